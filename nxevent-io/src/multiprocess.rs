//! Single-node loading through worker subprocesses and shared memory.
//!
//! The global event stream is cut into one contiguous slice per worker
//! process. Each worker fills its own segment (see [`crate::fill`]); the
//! parent waits for all of them, then merges the segments into the output
//! lists on a striped thread pool and deletes them.

use crate::fill::{FillStrategy, SEGMENT_CHUNK};
use crate::nexus::bank_sizes;
use crate::pool::{portion_size, run_striped};
use crate::shmem::{default_shm_dir, remove_segment, EventsListsShmemManager, SegmentLayout};
use crate::{Error, Result};
use nxevent_core::TofEvent;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Instant;
use sysinfo::System;
use uuid::Uuid;

/// Environment variable telling workers where segments live.
pub const SHM_DIR_ENV: &str = "NXEVENT_SHM_DIR";

/// File name of the worker executable.
pub const WORKER_EXECUTABLE: &str = "nxevent-worker";

const MEMORY_OVERHEAD_FACTOR: f64 = 1.2;
const FIXED_ARGS: usize = 10;

/// Configuration for [`MultiProcessEventLoader`].
#[derive(Clone, Debug)]
pub struct MultiProcessConfig {
    /// Number of output event lists (detector pixels).
    pub num_pixels: usize,
    /// Worker subprocesses reading the file.
    pub num_processes: usize,
    /// Threads merging segments into the output lists.
    pub num_threads: usize,
    pub worker_executable: PathBuf,
    pub strategy: FillStrategy,
    /// Directory holding shared-memory segments.
    pub shm_dir: PathBuf,
    /// Segment size relative to the exact event payload.
    pub memory_overhead_factor: f64,
}

impl Default for MultiProcessConfig {
    fn default() -> Self {
        Self {
            num_pixels: 0,
            num_processes: 1,
            num_threads: 1,
            worker_executable: default_worker_executable(),
            strategy: FillStrategy::default(),
            shm_dir: default_shm_dir(),
            memory_overhead_factor: MEMORY_OVERHEAD_FACTOR,
        }
    }
}

impl MultiProcessConfig {
    #[must_use]
    pub fn new(num_pixels: usize) -> Self {
        Self {
            num_pixels,
            ..Self::default()
        }
    }

    /// Set the number of worker processes; values below 1 are clamped to 1.
    #[must_use]
    pub fn with_num_processes(mut self, processes: usize) -> Self {
        self.num_processes = processes.max(1);
        self
    }

    /// Set the number of merge threads; values below 1 are clamped to 1.
    #[must_use]
    pub fn with_num_threads(mut self, threads: usize) -> Self {
        self.num_threads = threads.max(1);
        self
    }

    #[must_use]
    pub fn with_worker_executable(mut self, path: impl Into<PathBuf>) -> Self {
        self.worker_executable = path.into();
        self
    }

    #[must_use]
    pub fn with_strategy(mut self, strategy: FillStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    #[must_use]
    pub fn with_shm_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.shm_dir = dir.into();
        self
    }

    /// Set the segment overhead factor; values below 1.0 are clamped to 1.0.
    #[must_use]
    pub fn with_memory_overhead_factor(mut self, factor: f64) -> Self {
        self.memory_overhead_factor = factor.max(1.0);
        self
    }

    /// Fallible variant of [`Self::with_num_processes`].
    ///
    /// # Errors
    /// Returns an error if `processes` is 0.
    pub fn try_with_num_processes(mut self, processes: usize) -> Result<Self> {
        if processes == 0 {
            return Err(config_error("num_processes must be at least 1"));
        }
        self.num_processes = processes;
        Ok(self)
    }

    /// Fallible variant of [`Self::with_num_threads`].
    ///
    /// # Errors
    /// Returns an error if `threads` is 0.
    pub fn try_with_num_threads(mut self, threads: usize) -> Result<Self> {
        if threads == 0 {
            return Err(config_error("num_threads must be at least 1"));
        }
        self.num_threads = threads;
        Ok(self)
    }

    /// Fallible variant of [`Self::with_memory_overhead_factor`].
    ///
    /// # Errors
    /// Returns an error if `factor` is not finite or below 1.0.
    pub fn try_with_memory_overhead_factor(mut self, factor: f64) -> Result<Self> {
        if !(factor.is_finite() && factor >= 1.0) {
            return Err(config_error("memory_overhead_factor must be at least 1.0"));
        }
        self.memory_overhead_factor = factor;
        Ok(self)
    }

    /// Segment byte budget for a slice of `events` events.
    ///
    /// # Errors
    /// Returns an error if the size overflows.
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_precision_loss,
        clippy::cast_sign_loss
    )]
    pub fn segment_budget(&self, events: usize) -> Result<usize> {
        let padded = (events as f64 * self.memory_overhead_factor).ceil() as usize;
        SegmentLayout::required_bytes(1, self.num_pixels, padded)
    }
}

fn config_error(message: &str) -> Error {
    nxevent_core::Error::ConfigError(message.to_string()).into()
}

/// Worker executable installed next to the running binary.
///
/// Test and example binaries live one level deeper (`deps/`), so its parent
/// directory is searched as well.
#[must_use]
pub fn default_worker_executable() -> PathBuf {
    let name = format!("{WORKER_EXECUTABLE}{}", std::env::consts::EXE_SUFFIX);
    let Some(dir) = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
    else {
        return PathBuf::from(name);
    };
    let candidates = [Some(dir.as_path()), dir.parent()];
    candidates
        .into_iter()
        .flatten()
        .map(|candidate| candidate.join(&name))
        .find(|path| path.is_file())
        .unwrap_or_else(|| dir.join(&name))
}

/// Command line of one worker subprocess.
///
/// Positional order: segment name, storage name, process index, first
/// event, upper event bound, pixel count, segment byte budget, file path,
/// group name, precounting flag (0/1), then `(bank name, bank offset)`
/// pairs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerArgs {
    pub segment_name: String,
    pub storage_name: String,
    pub process_index: usize,
    pub first_event: usize,
    pub upper_event: usize,
    pub num_pixels: usize,
    pub byte_budget: usize,
    pub filename: PathBuf,
    pub group: String,
    pub strategy: FillStrategy,
    pub banks: Vec<(String, i32)>,
}

impl WorkerArgs {
    #[must_use]
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            self.segment_name.clone(),
            self.storage_name.clone(),
            self.process_index.to_string(),
            self.first_event.to_string(),
            self.upper_event.to_string(),
            self.num_pixels.to_string(),
            self.byte_budget.to_string(),
            self.filename.to_string_lossy().into_owned(),
            self.group.clone(),
            self.strategy.flag().to_string(),
        ];
        for (name, offset) in &self.banks {
            args.push(name.clone());
            args.push(offset.to_string());
        }
        args
    }

    /// Parses the positional arguments (without the program name).
    ///
    /// # Errors
    /// Returns [`Error::WorkerArgs`] for missing or malformed fields.
    pub fn from_args<S: AsRef<str>>(args: &[S]) -> Result<Self> {
        if args.len() < FIXED_ARGS || (args.len() - FIXED_ARGS) % 2 != 0 {
            return Err(Error::WorkerArgs(format!(
                "expected {FIXED_ARGS} fields followed by bank name/offset pairs, got {} arguments",
                args.len()
            )));
        }
        let field = |index: usize| args[index].as_ref();
        let number = |index: usize, name: &str| -> Result<usize> {
            field(index)
                .parse()
                .map_err(|_| Error::WorkerArgs(format!("{name} is not a count: {}", field(index))))
        };

        let parsed = Self {
            segment_name: field(0).to_string(),
            storage_name: field(1).to_string(),
            process_index: number(2, "process index")?,
            first_event: number(3, "first event")?,
            upper_event: number(4, "upper event")?,
            num_pixels: number(5, "pixel count")?,
            byte_budget: number(6, "byte budget")?,
            filename: PathBuf::from(field(7)),
            group: field(8).to_string(),
            strategy: FillStrategy::from_flag(field(9))?,
            banks: args[FIXED_ARGS..]
                .chunks_exact(2)
                .map(|pair| {
                    let name = pair[0].as_ref();
                    let offset = pair[1].as_ref().parse().map_err(|_| {
                        Error::WorkerArgs(format!(
                            "offset of bank {name} is not an integer: {}",
                            pair[1].as_ref()
                        ))
                    })?;
                    Ok((name.to_string(), offset))
                })
                .collect::<Result<_>>()?,
        };
        if parsed.first_event > parsed.upper_event {
            return Err(Error::WorkerArgs(format!(
                "event range [{}, {}) is inverted",
                parsed.first_event, parsed.upper_event
            )));
        }
        Ok(parsed)
    }

    #[must_use]
    pub fn bank_names(&self) -> Vec<String> {
        self.banks.iter().map(|(name, _)| name.clone()).collect()
    }

    #[must_use]
    pub fn bank_offsets(&self) -> Vec<i32> {
        self.banks.iter().map(|(_, offset)| *offset).collect()
    }
}

/// Unique name prefix for the segments of one load.
fn segment_prefix() -> String {
    format!(
        "nxevent_{}_{}_{:08x}",
        chrono::Local::now().format("%Y%m%dT%H%M%S%6f"),
        std::process::id(),
        Uuid::new_v4().as_fields().0
    )
}

/// Splits `[0, total)` into `parts` contiguous slices; the last one takes
/// the remainder.
#[must_use]
pub fn split_event_range(total: usize, parts: usize) -> Vec<(usize, usize)> {
    let parts = parts.max(1);
    let per_part = total / parts;
    (0..parts)
        .map(|part| {
            let first = part * per_part;
            let upper = if part + 1 == parts { total } else { first + per_part };
            (first, upper)
        })
        .collect()
}

/// Removes every segment it still tracks when dropped.
struct SegmentGuard<'a> {
    shm_dir: &'a Path,
    outstanding: Vec<String>,
}

impl<'a> SegmentGuard<'a> {
    fn new(shm_dir: &'a Path, names: &[String]) -> Self {
        Self {
            shm_dir,
            outstanding: names.to_vec(),
        }
    }

    fn released(&mut self, name: &str) {
        self.outstanding.retain(|outstanding| outstanding != name);
    }
}

impl Drop for SegmentGuard<'_> {
    fn drop(&mut self) {
        for name in &self.outstanding {
            if let Err(e) = remove_segment(self.shm_dir, name) {
                log::warn!("failed to remove shared-memory segment {name}: {e}");
            }
        }
    }
}

/// Loads all banks of a file into per-pixel event lists using worker
/// subprocesses.
#[derive(Clone, Debug)]
pub struct MultiProcessEventLoader {
    config: MultiProcessConfig,
}

impl MultiProcessEventLoader {
    #[must_use]
    pub fn new(config: MultiProcessConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &MultiProcessConfig {
        &self.config
    }

    /// Appends the events of `bank_names` in `group` of `filename` to
    /// `event_lists`, indexed by `event_id - bank_offset`.
    ///
    /// # Errors
    /// Any failure is wrapped in [`Error::MultiProcessLoad`]; the contents
    /// of `event_lists` are unspecified afterwards.
    pub fn load(
        &self,
        filename: &Path,
        group: &str,
        bank_names: &[String],
        bank_offsets: &[i32],
        event_lists: &mut [Vec<TofEvent>],
    ) -> Result<()> {
        self.run(filename, group, bank_names, bank_offsets, event_lists)
            .map_err(Error::in_multi_process_load)
    }

    fn run(
        &self,
        filename: &Path,
        group: &str,
        bank_names: &[String],
        bank_offsets: &[i32],
        event_lists: &mut [Vec<TofEvent>],
    ) -> Result<()> {
        let config = &self.config;
        if bank_names.len() != bank_offsets.len() {
            return Err(config_error("every bank needs exactly one offset"));
        }
        if event_lists.len() != config.num_pixels {
            return Err(nxevent_core::Error::ConfigError(format!(
                "{} output lists given for {} pixels",
                event_lists.len(),
                config.num_pixels
            ))
            .into());
        }

        let started = Instant::now();
        let total: usize = bank_sizes(filename, group, bank_names)?.iter().sum();
        if total == 0 {
            log::info!("no events in {}", filename.display());
            return Ok(());
        }

        let prefix = segment_prefix();
        let storage_name = format!("{prefix}_lists");
        let slices = split_event_range(total, config.num_processes);
        let jobs = slices
            .iter()
            .enumerate()
            .map(|(index, &(first, upper))| {
                Ok(WorkerArgs {
                    segment_name: format!("{prefix}_{index}"),
                    storage_name: storage_name.clone(),
                    process_index: index,
                    first_event: first,
                    upper_event: upper,
                    num_pixels: config.num_pixels,
                    byte_budget: config.segment_budget(upper - first)?,
                    filename: filename.to_path_buf(),
                    group: group.to_string(),
                    strategy: config.strategy,
                    banks: bank_names
                        .iter()
                        .cloned()
                        .zip(bank_offsets.iter().copied())
                        .collect(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let segment_names: Vec<String> = jobs.iter().map(|job| job.segment_name.clone()).collect();
        let mut guard = SegmentGuard::new(&config.shm_dir, &segment_names);
        warn_if_over_memory(jobs.iter().map(|job| job.byte_budget).sum());

        log::info!(
            "loading {total} events from {} with {} processes ({} fill)",
            filename.display(),
            jobs.len(),
            config.strategy
        );
        self.run_workers(&jobs)?;
        log::info!("workers finished in {:.2?}", started.elapsed());

        let merge_started = Instant::now();
        for name in &segment_names {
            let manager =
                EventsListsShmemManager::attach_read_only(&config.shm_dir, name, &storage_name)?;
            self.merge_segment(&manager, event_lists)?;
            manager.destroy()?;
            guard.released(name);
        }
        log::info!(
            "merged {} segments in {:.2?}",
            segment_names.len(),
            merge_started.elapsed()
        );
        Ok(())
    }

    fn run_workers(&self, jobs: &[WorkerArgs]) -> Result<()> {
        let mut children: Vec<(usize, Child)> = Vec::with_capacity(jobs.len());
        for job in jobs {
            let spawned = Command::new(&self.config.worker_executable)
                .args(job.to_args())
                .env(SHM_DIR_ENV, &self.config.shm_dir)
                .stdin(Stdio::null())
                .spawn();
            match spawned {
                Ok(child) => children.push((job.process_index, child)),
                Err(e) => {
                    for (_, child) in &mut children {
                        let _ = child.kill();
                        let _ = child.wait();
                    }
                    return Err(std::io::Error::new(
                        e.kind(),
                        format!(
                            "cannot start worker {}: {e}",
                            self.config.worker_executable.display()
                        ),
                    )
                    .into());
                }
            }
        }

        let mut failed = Vec::new();
        for (index, mut child) in children {
            let status = child.wait()?;
            if !status.success() {
                failed.push((index, status.code()));
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(Error::Subprocess { failed })
        }
    }

    fn merge_segment(
        &self,
        manager: &EventsListsShmemManager,
        event_lists: &mut [Vec<TofEvent>],
    ) -> Result<()> {
        if manager.num_pixels() != event_lists.len() || manager.num_chunks() <= SEGMENT_CHUNK {
            return Err(Error::SharedMemory(format!(
                "segment {} holds {}x{} lists, expected pixels {}",
                manager.segment_name(),
                manager.num_chunks(),
                manager.num_pixels(),
                event_lists.len()
            )));
        }
        let portion = portion_size(event_lists.len(), self.config.num_threads);
        let portions: Vec<(usize, &mut [Vec<TofEvent>])> = event_lists
            .chunks_mut(portion)
            .enumerate()
            .map(|(index, lists)| (index * portion, lists))
            .collect();
        run_striped(self.config.num_threads, portions, |(first_pixel, lists)| {
            for (offset, list) in lists.iter_mut().enumerate() {
                list.extend_from_slice(manager.event_list(SEGMENT_CHUNK, first_pixel + offset)?);
            }
            Ok(())
        })
    }
}

#[allow(clippy::cast_possible_truncation)]
fn warn_if_over_memory(total_bytes: usize) {
    let mut system = System::new();
    system.refresh_memory();
    let available = system.available_memory();
    if available > 0 && total_bytes as u64 > available {
        log::warn!(
            "shared-memory budget of {total_bytes} bytes exceeds {available} available"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_args() -> WorkerArgs {
        WorkerArgs {
            segment_name: "seg_0".to_string(),
            storage_name: "lists".to_string(),
            process_index: 3,
            first_event: 10,
            upper_event: 20,
            num_pixels: 64,
            byte_budget: 4096,
            filename: PathBuf::from("/data/run.nxs"),
            group: "entry".to_string(),
            strategy: FillStrategy::ProducerConsumer,
            banks: vec![("bank1".to_string(), 0), ("bank2".to_string(), -5)],
        }
    }

    #[test]
    fn test_worker_args_positional_order() {
        let args = sample_args().to_args();
        assert_eq!(
            args,
            vec![
                "seg_0", "lists", "3", "10", "20", "64", "4096", "/data/run.nxs", "entry", "0",
                "bank1", "0", "bank2", "-5"
            ]
        );
        assert_eq!(WorkerArgs::from_args(&args).unwrap(), sample_args());
    }

    #[test]
    fn test_worker_args_rejects_malformed() {
        let args = sample_args().to_args();
        assert!(WorkerArgs::from_args(&args[..9]).is_err());
        assert!(WorkerArgs::from_args(&args[..11]).is_err());

        let mut bad_flag = args.clone();
        bad_flag[9] = "yes".to_string();
        assert!(matches!(
            WorkerArgs::from_args(&bad_flag),
            Err(Error::WorkerArgs(_))
        ));

        let mut inverted = args.clone();
        inverted[3] = "30".to_string();
        assert!(WorkerArgs::from_args(&inverted).is_err());

        let mut bad_offset = args;
        bad_offset[11] = "zero".to_string();
        assert!(WorkerArgs::from_args(&bad_offset).is_err());
    }

    #[test]
    fn test_segment_prefixes_are_unique() {
        let first = segment_prefix();
        let second = segment_prefix();
        assert_ne!(first, second);
        assert!(first.starts_with("nxevent_"));
        assert!(first.contains(&format!("_{}_", std::process::id())));
        assert!(format!("{first}_lists").len() < 64);
    }

    #[test]
    fn test_split_event_range() {
        assert_eq!(split_event_range(10, 3), vec![(0, 3), (3, 6), (6, 10)]);
        assert_eq!(split_event_range(2, 4), vec![(0, 0), (0, 0), (0, 0), (0, 2)]);
        assert_eq!(split_event_range(5, 0), vec![(0, 5)]);
    }

    #[test]
    fn test_config_builders() {
        let config = MultiProcessConfig::new(100)
            .with_num_processes(0)
            .with_num_threads(0)
            .with_memory_overhead_factor(0.5)
            .with_strategy(FillStrategy::ProducerConsumer);
        assert_eq!(config.num_processes, 1);
        assert_eq!(config.num_threads, 1);
        assert!((config.memory_overhead_factor - 1.0).abs() < f64::EPSILON);
        assert!(MultiProcessConfig::new(1).try_with_num_processes(0).is_err());
        assert!(MultiProcessConfig::new(1).try_with_num_threads(0).is_err());
        assert!(MultiProcessConfig::new(1)
            .try_with_memory_overhead_factor(f64::NAN)
            .is_err());
        assert!(config.segment_budget(1000).unwrap() > 1000 * std::mem::size_of::<TofEvent>());
    }

    #[test]
    fn test_guard_removes_outstanding_segments() {
        let dir = tempfile::TempDir::new().unwrap();
        let names = vec!["a".to_string(), "b".to_string()];
        for name in &names {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        {
            let mut guard = SegmentGuard::new(dir.path(), &names);
            guard.released("a");
        }
        assert!(dir.path().join("a").exists());
        assert!(!dir.path().join("b").exists());
    }

    #[test]
    fn test_mismatched_inputs_are_wrapped() {
        let loader = MultiProcessEventLoader::new(MultiProcessConfig::new(2));
        let mut lists = vec![Vec::new(); 2];
        let err = loader
            .load(Path::new("missing.h5"), "entry", &["bank1".to_string()], &[], &mut lists)
            .unwrap_err();
        assert!(matches!(err, Error::MultiProcessLoad { .. }));
    }
}
