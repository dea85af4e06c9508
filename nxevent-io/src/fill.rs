//! Fill step of a worker subprocess: loads one slice of the global event
//! stream into a fresh shared-memory segment.

use crate::multiprocess::WorkerArgs;
use crate::nexus::{bank_sizes, event_time_offset_kind, NXEventDataLoader, NXEventDataSource};
use crate::nexus::{NumericKind, TimeOffset};
use crate::pool::{portion_size, run_striped};
use crate::shmem::{EventsListsShmemStorage, ReservedList};
use crate::{Error, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use nxevent_core::{to_global_indices, AnyEventDataPartitioner, IndexedEvent, LoadRange, TofEvent};
use rayon::prelude::*;
use std::path::Path;
use std::str::FromStr;
use std::time::Instant;

/// Chunk of the segment that worker subprocesses fill.
pub const SEGMENT_CHUNK: usize = 0;

const PIPELINE_DEPTH: usize = 4;
const FLUSH_THREADS: usize = 2;

/// How a worker subprocess moves events from the file into its segment.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FillStrategy {
    /// Read everything, count events per pixel, reserve, then append.
    #[default]
    Precount,
    /// Stream chunks from a reader thread into process-local per-pixel
    /// buffers, then flush them into the segment with two threads.
    ProducerConsumer,
}

impl FillStrategy {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Precount => "precount",
            Self::ProducerConsumer => "producer-consumer",
        }
    }

    /// Precounting flag of the worker command line.
    #[must_use]
    pub const fn flag(self) -> u8 {
        match self {
            Self::Precount => 1,
            Self::ProducerConsumer => 0,
        }
    }

    /// Parses the precounting flag of the worker command line.
    ///
    /// # Errors
    /// Returns [`Error::WorkerArgs`] for anything but `0` or `1`.
    pub fn from_flag(flag: &str) -> Result<Self> {
        match flag {
            "1" => Ok(Self::Precount),
            "0" => Ok(Self::ProducerConsumer),
            other => Err(Error::WorkerArgs(format!(
                "precounting flag must be 0 or 1, got {other}"
            ))),
        }
    }

    fn resolve<T: TimeOffset>(self) -> FillFn {
        match self {
            Self::Precount => precount::<T>,
            Self::ProducerConsumer => producer_consumer::<T>,
        }
    }
}

impl FromStr for FillStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "precount" => Ok(Self::Precount),
            "producer-consumer" | "producer_consumer" => Ok(Self::ProducerConsumer),
            other => Err(nxevent_core::Error::ConfigError(format!(
                "unknown fill strategy {other}"
            ))
            .into()),
        }
    }
}

impl std::fmt::Display for FillStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

type FillFn = fn(&FillJob<'_>, &mut EventsListsShmemStorage) -> Result<()>;

struct FillJob<'a> {
    args: &'a WorkerArgs,
    bank_names: &'a [String],
    ranges: &'a [LoadRange],
}

/// Creates the segment named in `args` under `shm_dir` and fills it.
///
/// # Errors
/// Returns an error if the segment cannot be created or the file read;
/// failures inside a strategy are wrapped in [`Error::FillStrategy`].
pub fn fill_segment(args: &WorkerArgs, shm_dir: &Path) -> Result<()> {
    let started = Instant::now();
    let mut storage = EventsListsShmemStorage::create(
        shm_dir,
        &args.segment_name,
        &args.storage_name,
        args.byte_budget,
        1,
        args.num_pixels,
    )?;

    let bank_names = args.bank_names();
    let sizes = bank_sizes(&args.filename, &args.group, &bank_names)?;
    let ranges = overlapping_ranges(&sizes, args.first_event, args.upper_event);
    if !ranges.is_empty() {
        let assigned: Vec<String> = ranges
            .iter()
            .map(|range| bank_names[range.bank_index].clone())
            .collect();
        let kind = event_time_offset_kind(&args.filename, &args.group, &assigned)?;
        let job = FillJob {
            args,
            bank_names: &bank_names,
            ranges: &ranges,
        };
        let run = match kind {
            NumericKind::I32 => args.strategy.resolve::<i32>(),
            NumericKind::I64 => args.strategy.resolve::<i64>(),
            NumericKind::U32 => args.strategy.resolve::<u32>(),
            NumericKind::U64 => args.strategy.resolve::<u64>(),
            NumericKind::F32 => args.strategy.resolve::<f32>(),
            NumericKind::F64 => args.strategy.resolve::<f64>(),
        };
        run(&job, &mut storage).map_err(|e| e.in_fill_strategy(args.strategy.name()))?;
    }
    storage.flush()?;

    log::info!(
        "process {}: {} events [{}, {}) into {} with {} fill in {:.2?}",
        args.process_index,
        storage.manager().total_events()?,
        args.first_event,
        args.upper_event,
        args.segment_name,
        args.strategy,
        started.elapsed()
    );
    Ok(())
}

/// Parts of each bank that fall into the global event slice `[first, upper)`.
///
/// Banks are laid end to end in the order given.
#[must_use]
pub fn overlapping_ranges(bank_sizes: &[usize], first: usize, upper: usize) -> Vec<LoadRange> {
    let mut ranges = Vec::new();
    let mut bank_start = 0;
    for (bank, &size) in bank_sizes.iter().enumerate() {
        let bank_end = bank_start + size;
        let lo = first.max(bank_start);
        let hi = upper.min(bank_end);
        if lo < hi {
            ranges.push(LoadRange::new(bank, lo - bank_start, hi - lo));
        }
        bank_start = bank_end;
    }
    ranges
}

/// Events of one read, with the factor converting their offsets to µs.
struct Portion<T> {
    events: Vec<IndexedEvent<T>>,
    tof_factor: f64,
}

impl<T: TimeOffset> Portion<T> {
    fn tof_event(&self, event: &IndexedEvent<T>) -> TofEvent {
        TofEvent::new(event.time_offset.to_f64() * self.tof_factor, event.pulse_time)
    }
}

/// Reads slices of one bank and resolves their global indices and pulse
/// times. Partitions for a single worker, so local index = global index.
struct BankReader<'a, T: TimeOffset> {
    loader: &'a mut NXEventDataLoader<T>,
    bank: usize,
    bank_offset: i32,
    partitioner: AnyEventDataPartitioner,
    tof_factor: f64,
    ids: Vec<i32>,
    offsets: Vec<T>,
    outputs: Vec<Vec<IndexedEvent<T>>>,
}

impl<'a, T: TimeOffset> BankReader<'a, T> {
    fn open(loader: &'a mut NXEventDataLoader<T>, args: &WorkerArgs, bank: usize) -> Result<Self> {
        let bank_offset = args
            .banks
            .get(bank)
            .map(|(_, offset)| *offset)
            .ok_or_else(|| {
                nxevent_core::Error::out_of_range("bank list", bank, 1, args.banks.len())
            })?;
        let partitioner = loader.set_bank_index(bank)?;
        let tof_factor = loader.read_event_time_offset_unit()?.microseconds_factor();
        Ok(Self {
            loader,
            bank,
            bank_offset,
            partitioner,
            tof_factor,
            ids: Vec::new(),
            offsets: Vec::new(),
            outputs: Vec::new(),
        })
    }

    fn read(&mut self, start: usize, count: usize) -> Result<Portion<T>> {
        self.loader.read_event_id(&mut self.ids, start, count)?;
        self.loader
            .read_event_time_offset(&mut self.offsets, start, count)?;
        to_global_indices(&mut self.ids, self.bank_offset)?;
        self.partitioner.partition(
            &mut self.outputs,
            &self.ids,
            &self.offsets,
            &LoadRange::new(self.bank, start, count),
        )?;
        Ok(Portion {
            events: self.outputs.pop().unwrap_or_default(),
            tof_factor: self.tof_factor,
        })
    }
}

fn pixel_out_of_range(pixel: usize, num_pixels: usize) -> Error {
    nxevent_core::Error::out_of_range("pixel index", pixel, 1, num_pixels).into()
}

/// Events per pixel over all portions.
fn histogram<T: TimeOffset>(portions: &[Portion<T>], num_pixels: usize) -> Result<Vec<usize>> {
    portions
        .par_iter()
        .flat_map_iter(|portion| portion.events.iter())
        .try_fold(
            || vec![0usize; num_pixels],
            |mut counts, event| {
                *counts
                    .get_mut(event.local_index)
                    .ok_or_else(|| pixel_out_of_range(event.local_index, num_pixels))? += 1;
                Ok(counts)
            },
        )
        .try_reduce(
            || vec![0usize; num_pixels],
            |mut total, counts| {
                for (sum, count) in total.iter_mut().zip(counts) {
                    *sum += count;
                }
                Ok(total)
            },
        )
}

fn precount<T: TimeOffset>(job: &FillJob<'_>, storage: &mut EventsListsShmemStorage) -> Result<()> {
    let args = job.args;
    let mut loader = NXEventDataLoader::<T>::open(&args.filename, &args.group, job.bank_names, 1)?;
    let mut portions = Vec::with_capacity(job.ranges.len());
    for range in job.ranges {
        let mut reader = BankReader::open(&mut loader, args, range.bank_index)?;
        portions.push(reader.read(range.event_offset, range.event_count)?);
    }

    let counts = histogram(&portions, args.num_pixels)?;
    for (pixel, &count) in counts.iter().enumerate() {
        if count > 0 {
            storage.reserve(SEGMENT_CHUNK, pixel, count)?;
        }
    }
    for portion in &portions {
        for event in &portion.events {
            storage.append_event(SEGMENT_CHUNK, event.local_index, portion.tof_event(event))?;
        }
    }
    Ok(())
}

fn produce<T: TimeOffset>(job: &FillJob<'_>, tx: &Sender<Portion<T>>) -> Result<()> {
    let args = job.args;
    let mut loader = NXEventDataLoader::<T>::open(&args.filename, &args.group, job.bank_names, 1)?;
    for range in job.ranges {
        let mut reader = BankReader::open(&mut loader, args, range.bank_index)?;
        let step = (range.event_count / 10).max(1);
        let mut start = range.event_offset;
        while start < range.end() {
            let count = step.min(range.end() - start);
            if tx.send(reader.read(start, count)?).is_err() {
                // Consumer stopped and reports its own error.
                return Ok(());
            }
            start += count;
        }
    }
    Ok(())
}

fn consume<T: TimeOffset>(rx: &Receiver<Portion<T>>, local: &mut [Vec<TofEvent>]) -> Result<()> {
    let num_pixels = local.len();
    for portion in rx {
        for event in &portion.events {
            local
                .get_mut(event.local_index)
                .ok_or_else(|| pixel_out_of_range(event.local_index, num_pixels))?
                .push(portion.tof_event(event));
        }
    }
    Ok(())
}

fn producer_consumer<T: TimeOffset>(
    job: &FillJob<'_>,
    storage: &mut EventsListsShmemStorage,
) -> Result<()> {
    let num_pixels = job.args.num_pixels;
    let mut local: Vec<Vec<TofEvent>> = vec![Vec::new(); num_pixels];
    let (tx, rx) = bounded::<Portion<T>>(PIPELINE_DEPTH);

    std::thread::scope(|scope| {
        let producer = scope.spawn(move || produce(job, &tx));
        let consumed = consume(&rx, &mut local);
        drop(rx);
        let produced = producer.join().map_err(|e| Error::from_panic(&*e))?;
        consumed.and(produced)
    })?;

    for (pixel, events) in local.iter().enumerate() {
        if !events.is_empty() {
            storage.reserve(SEGMENT_CHUNK, pixel, events.len())?;
        }
    }
    let lists = storage.manager_mut().reserved_lists_mut(SEGMENT_CHUNK)?;
    let mut pairs: Vec<(ReservedList<'_>, Vec<TofEvent>)> = lists.into_iter().zip(local).collect();
    let portions: Vec<_> = pairs
        .chunks_mut(portion_size(num_pixels, FLUSH_THREADS))
        .collect();
    run_striped(FLUSH_THREADS, portions, |portion| {
        for (list, events) in portion {
            list.extend_from_slice(events)?;
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shmem::EventsListsShmemManager;
    use crate::synthetic::{write_event_file, Column, SyntheticBank};
    use nxevent_core::PulseTime;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn bank(name: &str, ids: Vec<i32>, tofs: Vec<f64>, unit: &str) -> SyntheticBank {
        SyntheticBank {
            name: name.to_string(),
            event_id: Column::I32(ids),
            event_time_offset: Column::F64(tofs),
            event_time_offset_unit: unit.to_string(),
            event_index: Column::I64(vec![0, 2]),
            event_time_zero: Column::F64(vec![1.0, 2.0]),
            event_time_zero_unit: "second".to_string(),
            event_time_zero_offset: None,
        }
    }

    fn fixture(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("events.h5");
        write_event_file(
            &path,
            "entry",
            &[
                bank("bank1", vec![10, 11, 10, 12], vec![1.0, 2.0, 3.0, 4.0], "microsecond"),
                bank("bank2", vec![20, 21, 21], vec![5e-6, 6e-6, 7e-6], "second"),
            ],
        )
        .unwrap();
        path
    }

    fn args(path: PathBuf, strategy: FillStrategy, first: usize, upper: usize) -> WorkerArgs {
        WorkerArgs {
            segment_name: format!("seg-{}", strategy.name()),
            storage_name: "lists".to_string(),
            process_index: 0,
            first_event: first,
            upper_event: upper,
            num_pixels: 6,
            byte_budget: 1 << 16,
            filename: path,
            group: "entry".to_string(),
            strategy,
            banks: vec![("bank1".to_string(), 10), ("bank2".to_string(), 17)],
        }
    }

    fn filled(dir: &TempDir, args: &WorkerArgs) -> Vec<Vec<TofEvent>> {
        let shm = dir.path().join("shm");
        std::fs::create_dir_all(&shm).unwrap();
        fill_segment(args, &shm).unwrap();
        let manager =
            EventsListsShmemManager::attach_read_only(&shm, &args.segment_name, "lists").unwrap();
        (0..6)
            .map(|pixel| manager.event_list(SEGMENT_CHUNK, pixel).unwrap().to_vec())
            .collect()
    }

    #[test]
    fn test_overlapping_ranges() {
        let ranges = overlapping_ranges(&[4, 0, 3, 5], 2, 9);
        assert_eq!(
            ranges,
            vec![
                LoadRange::new(0, 2, 2),
                LoadRange::new(2, 0, 3),
                LoadRange::new(3, 0, 2)
            ]
        );
        assert!(overlapping_ranges(&[4, 3], 5, 5).is_empty());
        assert_eq!(overlapping_ranges(&[4], 0, 100), vec![LoadRange::new(0, 0, 4)]);
    }

    #[test]
    fn test_strategy_flags() {
        assert_eq!(FillStrategy::from_flag("1").unwrap(), FillStrategy::Precount);
        assert_eq!(FillStrategy::from_flag("0").unwrap(), FillStrategy::ProducerConsumer);
        assert!(FillStrategy::from_flag("2").is_err());
        assert_eq!(
            "producer-consumer".parse::<FillStrategy>().unwrap(),
            FillStrategy::ProducerConsumer
        );
        assert!("fast".parse::<FillStrategy>().is_err());
    }

    #[test]
    fn test_strategies_agree() {
        let dir = TempDir::new().unwrap();
        let path = fixture(&dir);
        let precount = filled(&dir, &args(path.clone(), FillStrategy::Precount, 0, 7));
        let streamed = filled(&dir, &args(path, FillStrategy::ProducerConsumer, 0, 7));
        assert_eq!(precount, streamed);

        let second = PulseTime::from_nanoseconds(1_000_000_000);
        assert_eq!(
            precount[0],
            vec![
                TofEvent::new(1.0, second),
                TofEvent::new(3.0, PulseTime::from_nanoseconds(2_000_000_000))
            ]
        );
        assert_eq!(precount[3].len(), 1);
        assert!((precount[4][1].tof - 7.0).abs() < 1e-9);
        assert_eq!(precount.iter().map(Vec::len).sum::<usize>(), 7);
    }

    #[test]
    fn test_partial_slice() {
        let dir = TempDir::new().unwrap();
        let path = fixture(&dir);
        let lists = filled(&dir, &args(path, FillStrategy::Precount, 3, 5));
        assert_eq!(lists[2].len(), 1);
        assert_eq!(lists[3].len(), 1);
        assert_eq!(lists.iter().map(Vec::len).sum::<usize>(), 2);
    }

    #[test]
    fn test_pixel_out_of_range_is_wrapped() {
        let dir = TempDir::new().unwrap();
        let path = fixture(&dir);
        let shm = dir.path().join("shm");
        std::fs::create_dir_all(&shm).unwrap();
        for strategy in [FillStrategy::Precount, FillStrategy::ProducerConsumer] {
            let mut bad = args(path.clone(), strategy, 0, 7);
            bad.num_pixels = 3;
            let err = fill_segment(&bad, &shm).unwrap_err();
            assert!(matches!(err, Error::FillStrategy { .. }), "{err}");
            assert!(err.to_string().contains(strategy.name()));
        }
    }
}
