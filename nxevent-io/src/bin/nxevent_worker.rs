//! Worker subprocess of the multi-process event loader.
//!
//! Fills one shared-memory segment from a slice of the global event stream
//! and exits 0 on success. Arguments follow [`WorkerArgs::to_args`].

use nxevent_io::fill::fill_segment;
use nxevent_io::multiprocess::SHM_DIR_ENV;
use nxevent_io::shmem::default_shm_dir;
use nxevent_io::WorkerArgs;
use std::error::Error as _;
use std::path::PathBuf;
use std::process::ExitCode;

fn run(args: &[String]) -> nxevent_io::Result<()> {
    let args = WorkerArgs::from_args(args)?;
    let shm_dir = std::env::var_os(SHM_DIR_ENV).map_or_else(default_shm_dir, PathBuf::from);
    fill_segment(&args, &shm_dir)
}

fn main() -> ExitCode {
    env_logger::init();
    let args: Vec<String> = std::env::args().skip(1).collect();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("nxevent-worker: {e}");
            let mut source = e.source();
            while let Some(cause) = source {
                eprintln!("  caused by: {cause}");
                source = cause.source();
            }
            ExitCode::FAILURE
        }
    }
}
