//! Top-level loading entry point.
//!
//! With a communicator of more than one rank the banks are balanced across
//! ranks by the [`Chunker`] and redistributed with an [`EventParser`];
//! otherwise the load runs on this node through [`MultiProcessEventLoader`].

use crate::comm::Communicator;
use crate::fill::FillStrategy;
use crate::multiprocess::{default_worker_executable, MultiProcessConfig, MultiProcessEventLoader};
use crate::nexus::{bank_sizes, event_time_offset_kind, NXEventDataLoader, NXEventDataSource};
use crate::nexus::{NumericKind, TimeOffset};
use crate::parser::EventParser;
use crate::shmem::default_shm_dir;
use crate::Result;
use nxevent_core::{Chunker, TofEvent};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

/// Default number of events per load range on the distributed path.
pub const DEFAULT_CHUNK_SIZE: usize = 1 << 22;

/// Configuration for [`EventLoader`].
#[derive(Clone, Debug)]
pub struct EventLoaderConfig {
    /// Maximum events per load range on the distributed path.
    pub chunk_size: usize,
    /// Fill strategy of worker subprocesses on the single-node path.
    pub strategy: FillStrategy,
    /// Worker binary; `None` selects the one installed next to this binary.
    pub worker_executable: Option<PathBuf>,
    /// Segment directory; `None` selects the platform default.
    pub shm_dir: Option<PathBuf>,
}

impl Default for EventLoaderConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            strategy: FillStrategy::default(),
            worker_executable: None,
            shm_dir: None,
        }
    }
}

impl EventLoaderConfig {
    /// Set the chunk size; values below 1 are clamped to 1.
    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Fallible variant of [`Self::with_chunk_size`].
    ///
    /// # Errors
    /// Returns an error if `chunk_size` is 0.
    pub fn try_with_chunk_size(mut self, chunk_size: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(nxevent_core::Error::ConfigError(
                "chunk_size must be at least 1".to_string(),
            )
            .into());
        }
        self.chunk_size = chunk_size;
        Ok(self)
    }

    #[must_use]
    pub fn with_strategy(mut self, strategy: FillStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    #[must_use]
    pub fn with_worker_executable(mut self, path: impl Into<PathBuf>) -> Self {
        self.worker_executable = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_shm_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.shm_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn effective_worker_executable(&self) -> PathBuf {
        self.worker_executable
            .clone()
            .unwrap_or_else(default_worker_executable)
    }

    #[must_use]
    pub fn effective_shm_dir(&self) -> PathBuf {
        self.shm_dir.clone().unwrap_or_else(default_shm_dir)
    }

    /// Worker processes and merge threads: half the hardware threads each,
    /// at least one.
    #[must_use]
    pub fn effective_parallelism() -> (usize, usize) {
        let hardware = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
        let half = (hardware / 2).max(1);
        (half, half)
    }
}

/// Loads the events of a set of banks into per-spectrum lists.
pub struct EventLoader {
    config: EventLoaderConfig,
    comm: Option<Arc<dyn Communicator>>,
}

impl EventLoader {
    #[must_use]
    pub fn new(config: EventLoaderConfig) -> Self {
        Self { config, comm: None }
    }

    /// Loads cooperatively with the other ranks of `comm`.
    #[must_use]
    pub fn with_communicator(mut self, comm: Arc<dyn Communicator>) -> Self {
        self.comm = Some(comm);
        self
    }

    #[must_use]
    pub fn config(&self) -> &EventLoaderConfig {
        &self.config
    }

    /// Whether loads take the distributed path.
    #[must_use]
    pub fn is_distributed(&self) -> bool {
        self.comm.as_ref().is_some_and(|comm| comm.size() > 1)
    }

    /// Appends the events of `bank_names` to `event_lists`.
    ///
    /// On the single-node path `event_lists` holds one list per global
    /// spectrum. On the distributed path it holds this rank's spectra
    /// (global spectrum `s` at `s / size` on rank `s % size`) and every rank
    /// must call `load` with the same file and banks.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, an event id falls
    /// outside the lists, or a worker fails. The lists are unspecified
    /// after an error.
    pub fn load(
        &self,
        filename: &Path,
        group: &str,
        bank_names: &[String],
        bank_offsets: &[i32],
        event_lists: &mut Vec<Vec<TofEvent>>,
    ) -> Result<()> {
        match &self.comm {
            Some(comm) if comm.size() > 1 => {
                self.load_distributed(comm, filename, group, bank_names, bank_offsets, event_lists)
            }
            _ => self.load_single_node(filename, group, bank_names, bank_offsets, event_lists),
        }
    }

    fn load_single_node(
        &self,
        filename: &Path,
        group: &str,
        bank_names: &[String],
        bank_offsets: &[i32],
        event_lists: &mut [Vec<TofEvent>],
    ) -> Result<()> {
        let (processes, threads) = EventLoaderConfig::effective_parallelism();
        let config = MultiProcessConfig::new(event_lists.len())
            .with_num_processes(processes)
            .with_num_threads(threads)
            .with_strategy(self.config.strategy)
            .with_worker_executable(self.config.effective_worker_executable())
            .with_shm_dir(self.config.effective_shm_dir());
        MultiProcessEventLoader::new(config).load(
            filename,
            group,
            bank_names,
            bank_offsets,
            event_lists,
        )
    }

    fn load_distributed(
        &self,
        comm: &Arc<dyn Communicator>,
        filename: &Path,
        group: &str,
        bank_names: &[String],
        bank_offsets: &[i32],
        event_lists: &mut Vec<Vec<TofEvent>>,
    ) -> Result<()> {
        if bank_names.is_empty() {
            return Ok(());
        }
        let kind = event_time_offset_kind(filename, group, bank_names)?;
        let job = DistributedJob {
            comm,
            chunk_size: self.config.chunk_size,
            filename,
            group,
            bank_names,
            bank_offsets,
        };
        match kind {
            NumericKind::I32 => job.run::<i32>(event_lists),
            NumericKind::I64 => job.run::<i64>(event_lists),
            NumericKind::U32 => job.run::<u32>(event_lists),
            NumericKind::U64 => job.run::<u64>(event_lists),
            NumericKind::F32 => job.run::<f32>(event_lists),
            NumericKind::F64 => job.run::<f64>(event_lists),
        }
    }
}

struct DistributedJob<'a> {
    comm: &'a Arc<dyn Communicator>,
    chunk_size: usize,
    filename: &'a Path,
    group: &'a str,
    bank_names: &'a [String],
    bank_offsets: &'a [i32],
}

impl DistributedJob<'_> {
    fn run<T: TimeOffset>(&self, event_lists: &mut Vec<Vec<TofEvent>>) -> Result<()> {
        let started = Instant::now();
        let size = self.comm.size();
        let rank = self.comm.rank();
        let sizes = bank_sizes(self.filename, self.group, self.bank_names)?;
        let chunker = Chunker::new(size, rank, sizes, self.chunk_size)?;
        let ranges = chunker.make_load_ranges();

        let mut source =
            NXEventDataLoader::<T>::open(self.filename, self.group, self.bank_names, size)?;
        let mut parser = EventParser::<T>::new(
            Arc::clone(self.comm),
            chunker.make_worker_groups(),
            self.bank_offsets.to_vec(),
            std::mem::take(event_lists),
        )?;

        let mut current_bank = None;
        for range in &ranges {
            let mut event_ids = Vec::new();
            let mut time_offsets = Vec::new();
            if !range.is_empty() {
                if current_bank != Some(range.bank_index) {
                    parser.set_event_data_partitioner(source.set_bank_index(range.bank_index)?)?;
                    parser.set_event_time_offset_unit(source.read_event_time_offset_unit()?)?;
                    current_bank = Some(range.bank_index);
                }
                source.read_event_id(&mut event_ids, range.event_offset, range.event_count)?;
                source.read_event_time_offset(
                    &mut time_offsets,
                    range.event_offset,
                    range.event_count,
                )?;
            }
            parser.start_async(event_ids, time_offsets, *range)?;
        }
        *event_lists = parser.into_event_lists()?;

        log::info!(
            "rank {rank}/{size}: {} load ranges from {} in {:.2?}",
            ranges.len(),
            self.filename.display(),
            started.elapsed()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::LocalCommunicator;
    use crate::parser::local_spectrum_count;
    use crate::synthetic::{write_event_file, SyntheticBank};
    use tempfile::NamedTempFile;

    #[test]
    fn test_config_defaults() {
        let config = EventLoaderConfig::default().with_chunk_size(0);
        assert_eq!(config.chunk_size, 1);
        assert!(EventLoaderConfig::default().try_with_chunk_size(0).is_err());
        assert_eq!(config.effective_shm_dir(), default_shm_dir());
        let custom = config.with_shm_dir("/tmp/segments");
        assert_eq!(custom.effective_shm_dir(), PathBuf::from("/tmp/segments"));
        let (processes, threads) = EventLoaderConfig::effective_parallelism();
        assert!(processes >= 1 && threads >= 1);
    }

    #[test]
    fn test_single_rank_communicator_is_not_distributed() {
        let comm: Arc<dyn Communicator> = Arc::new(LocalCommunicator::group(1).remove(0));
        let loader = EventLoader::new(EventLoaderConfig::default()).with_communicator(comm);
        assert!(!loader.is_distributed());
        assert!(!EventLoader::new(EventLoaderConfig::default()).is_distributed());
    }

    #[test]
    fn test_distributed_ranks_share_all_events() {
        let file = NamedTempFile::new().unwrap();
        let banks = vec![
            SyntheticBank::uniform("bank1", 0, 8, 500, 20),
            SyntheticBank::uniform("bank2", 8, 8, 300, 10),
        ];
        write_event_file(file.path(), "entry", &banks).unwrap();
        let bank_names = vec!["bank1".to_string(), "bank2".to_string()];
        let size = 3;
        let num_pixels = 16;

        let totals: Vec<usize> = std::thread::scope(|scope| {
            let handles: Vec<_> = LocalCommunicator::group(size)
                .into_iter()
                .map(|comm| {
                    let path = file.path();
                    let bank_names = &bank_names;
                    scope.spawn(move || {
                        let rank = comm.rank();
                        let config = EventLoaderConfig::default().with_chunk_size(64);
                        let loader = EventLoader::new(config).with_communicator(Arc::new(comm));
                        assert!(loader.is_distributed());
                        let mut lists =
                            vec![Vec::new(); local_spectrum_count(num_pixels, size, rank)];
                        loader
                            .load(path, "entry", bank_names, &[0, 0], &mut lists)
                            .unwrap();
                        lists.iter().map(Vec::len).sum::<usize>()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(totals.iter().sum::<usize>(), 800);
    }
}
