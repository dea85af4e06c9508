//! nxevent CLI: inspect, partition and load NeXus event data.
//!
//! Besides the loaders this binary can write deterministic synthetic files,
//! which is the quickest way to benchmark the loading paths on one machine.
#![allow(
    clippy::uninlined_format_args,
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_possible_wrap,
    clippy::too_many_lines
)]

use clap::{Parser, Subcommand, ValueEnum};
use nxevent_core::{Chunker, TofEvent};
use nxevent_io::comm::{Communicator, LocalCommunicator};
use nxevent_io::multiprocess::default_worker_executable;
use nxevent_io::nexus::{list_banks, summarize_banks};
use nxevent_io::parser::local_spectrum_count;
use nxevent_io::synthetic::{write_event_file, SyntheticBank};
use nxevent_io::{
    make_any_event_id_to_bank_map, EventLoader, EventLoaderConfig, FillStrategy,
    MultiProcessConfig, MultiProcessEventLoader,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Result type for CLI operations.
type Result<T> = std::result::Result<T, CliError>;

/// CLI error types.
#[derive(Error, Debug)]
enum CliError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    NxeventIo(#[from] nxevent_io::Error),

    #[error("Core error: {0}")]
    Core(#[from] nxevent_core::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("rank thread panicked")]
    RankPanic,

    #[error("{0}")]
    Usage(String),
}

/// Fill strategy selection.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum Strategy {
    /// Count events per pixel, reserve, then append
    Precount,
    /// Stream chunks into local buffers, then flush
    ProducerConsumer,
}

impl From<Strategy> for FillStrategy {
    fn from(strategy: Strategy) -> Self {
        match strategy {
            Strategy::Precount => Self::Precount,
            Strategy::ProducerConsumer => Self::ProducerConsumer,
        }
    }
}

/// Parallel loader for NeXus NXevent_data detector event streams.
#[derive(Parser)]
#[command(name = "nxevent")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log progress (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show banks, sizes, types and units of a file
    Info {
        /// Input NeXus file
        input: PathBuf,

        /// Group holding the event banks
        #[arg(short, long, default_value = "entry")]
        group: String,

        /// Banks to describe (default: every bank in the group)
        #[arg(short, long)]
        bank: Vec<String>,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Show the balanced partitioning and load ranges for bank sizes
    Partition {
        /// Event count of each bank
        #[arg(required = true)]
        sizes: Vec<usize>,

        /// Number of workers (ranks)
        #[arg(short, long, default_value = "4")]
        workers: usize,

        /// Maximum events per load range
        #[arg(short, long, default_value = "1048576")]
        chunk_size: usize,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Load all events of a file into per-pixel lists
    Load {
        #[command(flatten)]
        source: SourceArgs,

        #[command(flatten)]
        workers: WorkerOptions,

        /// In-process ranks for the distributed path (1 = worker processes)
        #[arg(long, default_value = "1")]
        ranks: usize,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Write a deterministic synthetic event file
    Synthesize {
        /// Output file
        output: PathBuf,

        /// Group holding the event banks
        #[arg(short, long, default_value = "entry")]
        group: String,

        /// Number of banks
        #[arg(long, default_value = "4")]
        banks: usize,

        /// Events per bank
        #[arg(long, default_value = "1000000")]
        events: usize,

        /// Pixels per bank
        #[arg(long, default_value = "1024")]
        pixels: usize,

        /// Pulses per bank
        #[arg(long, default_value = "600")]
        pulses: usize,
    },

    /// Time both fill strategies and the distributed path
    Benchmark {
        #[command(flatten)]
        source: SourceArgs,

        #[command(flatten)]
        workers: WorkerOptions,

        /// In-process ranks for the distributed run
        #[arg(long, default_value = "2")]
        ranks: usize,

        /// Number of iterations
        #[arg(short, long, default_value = "3")]
        iterations: usize,
    },
}

#[derive(clap::Args)]
struct SourceArgs {
    /// Input NeXus file
    input: PathBuf,

    /// Group holding the event banks
    #[arg(short, long, default_value = "entry")]
    group: String,

    /// Banks to load (default: every bank in the group)
    #[arg(short, long)]
    bank: Vec<String>,

    /// Event id offset of each bank (default: 0 for every bank)
    #[arg(long, allow_negative_numbers = true)]
    offset: Vec<i32>,

    /// Number of output pixels
    #[arg(short, long)]
    pixels: usize,
}

#[derive(clap::Args)]
struct WorkerOptions {
    /// Worker processes (default: half the hardware threads)
    #[arg(long)]
    processes: Option<usize>,

    /// Merge threads (default: half the hardware threads)
    #[arg(long)]
    threads: Option<usize>,

    /// Fill strategy of the worker processes
    #[arg(short, long, value_enum, default_value = "precount")]
    strategy: Strategy,

    /// Worker executable (default: nxevent-worker next to this binary)
    #[arg(long)]
    worker: Option<PathBuf>,

    /// Directory for shared-memory segments
    #[arg(long)]
    shm_dir: Option<PathBuf>,
}

impl WorkerOptions {
    fn config(&self, num_pixels: usize, strategy: Strategy) -> MultiProcessConfig {
        let (processes, threads) = EventLoaderConfig::effective_parallelism();
        let mut config = MultiProcessConfig::new(num_pixels)
            .with_num_processes(self.processes.unwrap_or(processes))
            .with_num_threads(self.threads.unwrap_or(threads))
            .with_strategy(strategy.into())
            .with_worker_executable(
                self.worker
                    .clone()
                    .unwrap_or_else(default_worker_executable),
            );
        if let Some(dir) = &self.shm_dir {
            config = config.with_shm_dir(dir);
        }
        config
    }
}

/// Banks and offsets resolved from the command line.
struct Source {
    input: PathBuf,
    group: String,
    banks: Vec<String>,
    offsets: Vec<i32>,
    pixels: usize,
}

impl Source {
    fn resolve(args: &SourceArgs) -> Result<Self> {
        let banks = if args.bank.is_empty() {
            list_banks(&args.input, &args.group)?
        } else {
            args.bank.clone()
        };
        let offsets = if args.offset.is_empty() {
            vec![0; banks.len()]
        } else if args.offset.len() == banks.len() {
            args.offset.clone()
        } else {
            return Err(CliError::Usage(format!(
                "{} offsets given for {} banks",
                args.offset.len(),
                banks.len()
            )));
        };
        Ok(Self {
            input: args.input.clone(),
            group: args.group.clone(),
            banks,
            offsets,
            pixels: args.pixels,
        })
    }
}

fn load_multi_process(source: &Source, config: MultiProcessConfig) -> Result<Vec<Vec<TofEvent>>> {
    let mut lists = vec![Vec::new(); source.pixels];
    MultiProcessEventLoader::new(config).load(
        &source.input,
        &source.group,
        &source.banks,
        &source.offsets,
        &mut lists,
    )?;
    Ok(lists)
}

/// Runs the distributed path with `ranks` threads as ranks; returns each
/// rank's lists.
fn load_distributed(source: &Source, ranks: usize) -> Result<Vec<Vec<Vec<TofEvent>>>> {
    let ranks = ranks.max(1);
    std::thread::scope(|scope| {
        let handles: Vec<_> = LocalCommunicator::group(ranks)
            .into_iter()
            .map(|comm| {
                scope.spawn(move || -> Result<Vec<Vec<TofEvent>>> {
                    let rank = comm.rank();
                    let loader = EventLoader::new(EventLoaderConfig::default())
                        .with_communicator(Arc::new(comm));
                    let mut lists =
                        vec![Vec::new(); local_spectrum_count(source.pixels, ranks, rank)];
                    loader.load(
                        &source.input,
                        &source.group,
                        &source.banks,
                        &source.offsets,
                        &mut lists,
                    )?;
                    Ok(lists)
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().map_err(|_| CliError::RankPanic)?)
            .collect()
    })
}

fn count_events(lists: &[Vec<TofEvent>]) -> usize {
    lists.iter().map(Vec::len).sum()
}

fn timed<T>(run: impl FnOnce() -> Result<T>) -> Result<(T, Duration)> {
    let start = Instant::now();
    let value = run()?;
    Ok((value, start.elapsed()))
}

fn print_info(input: &Path, group: &str, banks: &[String], json: bool) -> Result<()> {
    let summaries = summarize_banks(input, group, banks)?;
    let id_map = make_any_event_id_to_bank_map(input, group, banks)?;

    if json {
        let value = serde_json::json!({
            "file": input.display().to_string(),
            "group": group,
            "banks": summaries,
            "event_id_to_bank": id_map
                .iter()
                .map(|(id, bank)| serde_json::json!({ "event_id": id, "bank": bank }))
                .collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("File: {}", input.display());
    println!("Group: {}", group);
    println!(
        "{:<16} | {:>12} | {:>8} | {:<6} | {:<12} | {:<6} | {:<6}",
        "Bank", "Events", "Pulses", "TOF", "TOF unit", "Index", "Zero"
    );
    println!("{:-<86}", "");
    for summary in &summaries {
        println!(
            "{:<16} | {:>12} | {:>8} | {:<6} | {:<12} | {:<6} | {:<6}",
            summary.name,
            summary.events,
            summary.pulses,
            summary.event_time_offset_kind,
            summary.event_time_offset_unit,
            summary.event_index_kind,
            summary.event_time_zero_kind
        );
    }
    let total: usize = summaries.iter().map(|s| s.events).sum();
    println!("Total events: {}", total);
    for (id, bank) in &id_map {
        println!("Event id {} -> bank {}", id, banks[*bank]);
    }
    Ok(())
}

fn print_partition(sizes: &[usize], workers: usize, chunk_size: usize, json: bool) -> Result<()> {
    let chunkers = (0..workers)
        .map(|worker| Chunker::new(workers, worker, sizes.to_vec(), chunk_size))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let Some(first) = chunkers.first() else {
        return Err(CliError::Usage("at least one worker is required".to_string()));
    };

    if json {
        let value = serde_json::json!({
            "chunk_size": chunk_size,
            "chunk_counts": first.chunk_counts(),
            "partitioning": first.partitioning(),
            "worker_groups": first.make_worker_groups(),
            "load_ranges": chunkers.iter().map(Chunker::make_load_ranges).collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("Chunks per bank: {:?}", first.chunk_counts());
    for (index, partition) in first.partitioning().iter().enumerate() {
        println!(
            "Partition {}: {} worker(s), banks {:?}",
            index, partition.workers, partition.banks
        );
    }
    println!("Worker groups: {:?}", first.make_worker_groups());
    for (worker, chunker) in chunkers.iter().enumerate() {
        println!("Worker {}:", worker);
        for range in chunker.make_load_ranges() {
            if range.is_empty() {
                println!("  (padding)");
            } else {
                println!(
                    "  bank {} events [{}, {})",
                    range.bank_index,
                    range.event_offset,
                    range.end()
                );
            }
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let default_filter = if cli.verbose { "info" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    match cli.command {
        Commands::Info {
            input,
            group,
            bank,
            json,
        } => {
            let banks = if bank.is_empty() {
                list_banks(&input, &group)?
            } else {
                bank
            };
            print_info(&input, &group, &banks, json)?;
        }

        Commands::Partition {
            sizes,
            workers,
            chunk_size,
            json,
        } => {
            print_partition(&sizes, workers, chunk_size, json)?;
        }

        Commands::Load {
            source,
            workers,
            ranks,
            json,
        } => {
            let source = Source::resolve(&source)?;
            log::info!(
                "loading {} bank(s) from {} into {} pixels",
                source.banks.len(),
                source.input.display(),
                source.pixels
            );
            let (totals, elapsed) = if ranks > 1 {
                timed(|| {
                    Ok(load_distributed(&source, ranks)?
                        .iter()
                        .map(|lists| count_events(lists))
                        .collect::<Vec<_>>())
                })?
            } else {
                let config = workers.config(source.pixels, workers.strategy);
                timed(|| Ok(vec![count_events(&load_multi_process(&source, config)?)]))?
            };
            let total: usize = totals.iter().sum();

            if json {
                let value = serde_json::json!({
                    "file": source.input.display().to_string(),
                    "banks": source.banks,
                    "pixels": source.pixels,
                    "ranks": ranks.max(1),
                    "events_per_rank": totals,
                    "total_events": total,
                    "seconds": elapsed.as_secs_f64(),
                });
                println!("{}", serde_json::to_string_pretty(&value)?);
            } else {
                println!(
                    "Loaded {} events from {} bank(s) in {:.2}s",
                    total,
                    source.banks.len(),
                    elapsed.as_secs_f64()
                );
                if totals.len() > 1 {
                    for (rank, count) in totals.iter().enumerate() {
                        println!("  rank {}: {} events", rank, count);
                    }
                }
            }
        }

        Commands::Synthesize {
            output,
            group,
            banks,
            events,
            pixels,
            pulses,
        } => {
            let synthetic: Vec<SyntheticBank> = (0..banks)
                .map(|index| {
                    SyntheticBank::uniform(
                        &format!("bank{}", index + 1),
                        (index * pixels) as i32,
                        pixels,
                        events,
                        pulses,
                    )
                })
                .collect();
            log::info!("writing {banks} bank(s) to {}", output.display());
            write_event_file(&output, &group, &synthetic)?;
            println!(
                "Wrote {} bank(s) of {} events to {} ({} pixels, bank offsets 0)",
                banks,
                events,
                output.display(),
                banks * pixels
            );
        }

        Commands::Benchmark {
            source,
            workers,
            ranks,
            iterations,
        } => {
            let source = Source::resolve(&source)?;
            let iterations = iterations.max(1);
            println!(
                "Benchmarking {} bank(s) of {}, {} iterations",
                source.banks.len(),
                source.input.display(),
                iterations
            );
            println!(
                "{:<20} | {:<15} | {:<15} | {:<15} | {:>12}",
                "Path", "Mean Time (ms)", "Min Time (ms)", "Max Time (ms)", "Events"
            );
            println!("{:-<88}", "");

            let runs: [(&str, Option<Strategy>); 3] = [
                ("precount", Some(Strategy::Precount)),
                ("producer-consumer", Some(Strategy::ProducerConsumer)),
                ("distributed", None),
            ];
            let mut totals = Vec::with_capacity(runs.len());
            for (name, strategy) in runs {
                let mut times = Vec::with_capacity(iterations);
                let mut events = 0;
                for _ in 0..iterations {
                    let (count, elapsed) = match strategy {
                        Some(strategy) => {
                            let config = workers.config(source.pixels, strategy);
                            timed(|| Ok(count_events(&load_multi_process(&source, config)?)))?
                        }
                        None => timed(|| {
                            Ok(load_distributed(&source, ranks)?
                                .iter()
                                .map(|lists| count_events(lists))
                                .sum::<usize>())
                        })?,
                    };
                    log::info!("{name}: {count} events in {:.2?}", elapsed);
                    times.push(elapsed.as_secs_f64() * 1000.0);
                    events = count;
                }

                let min_time = times.iter().fold(f64::INFINITY, |a, &b| a.min(b));
                let max_time = times.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));
                let mean_time = times.iter().sum::<f64>() / times.len() as f64;
                println!(
                    "{:<20} | {:<15.2} | {:<15.2} | {:<15.2} | {:>12}",
                    name, mean_time, min_time, max_time, events
                );
                totals.push(events);
            }

            if totals.windows(2).any(|pair| pair[0] != pair[1]) {
                return Err(CliError::Usage(format!(
                    "event totals differ between paths: {:?}",
                    totals
                )));
            }
            println!("Event totals match: {}", totals[0]);
        }
    }

    Ok(())
}
