//! I/O error types.

use thiserror::Error;

/// Result type for I/O operations.
pub type Result<T> = std::result::Result<T, Error>;

/// I/O error types.
#[derive(Error, Debug)]
pub enum Error {
    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HDF5 library error.
    #[error("HDF5 error: {0}")]
    Hdf5(#[from] hdf5::Error),

    /// Invalid file format.
    #[error("invalid file format: {0}")]
    InvalidFormat(String),

    /// Core library error.
    #[error("core error: {0}")]
    CoreError(#[from] nxevent_core::Error),

    /// Shared-memory segment missing, malformed or exhausted.
    #[error("shared memory error: {0}")]
    SharedMemory(String),

    /// Malformed worker subprocess command line.
    #[error("invalid worker arguments: {0}")]
    WorkerArgs(String),

    /// Rank exchange failed.
    #[error("rank communication error: {0}")]
    Communication(String),

    /// A worker thread panicked.
    #[error("worker thread panicked: {0}")]
    ThreadPanic(String),

    /// One or more worker subprocesses exited unsuccessfully.
    #[error("worker processes failed: {}", describe_failures(.failed))]
    Subprocess { failed: Vec<(usize, Option<i32>)> },

    /// A fill strategy aborted inside a worker subprocess.
    #[error("{strategy} fill strategy failed: {source}")]
    FillStrategy {
        strategy: &'static str,
        #[source]
        source: Box<Error>,
    },

    /// Context wrapper for any failure of the multi-process pipeline.
    #[error("multi-process event loader failed: {source}")]
    MultiProcessLoad {
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Wraps `self` as the failure of a fill strategy.
    #[must_use]
    pub fn in_fill_strategy(self, strategy: &'static str) -> Self {
        Self::FillStrategy {
            strategy,
            source: Box::new(self),
        }
    }

    /// Wraps `self` with the multi-process loader context.
    #[must_use]
    pub fn in_multi_process_load(self) -> Self {
        Self::MultiProcessLoad {
            source: Box::new(self),
        }
    }

    /// Converts a thread join panic payload into an error.
    #[must_use]
    pub fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(ToString::to_string)
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        Self::ThreadPanic(message)
    }
}

fn describe_failures(failed: &[(usize, Option<i32>)]) -> String {
    failed
        .iter()
        .map(|(process, code)| match code {
            Some(code) => format!("process {process} exited with code {code}"),
            None => format!("process {process} terminated by signal"),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subprocess_message() {
        let err = Error::Subprocess {
            failed: vec![(0, Some(1)), (3, None)],
        };
        let message = err.to_string();
        assert!(message.contains("process 0 exited with code 1"));
        assert!(message.contains("process 3 terminated by signal"));
    }

    #[test]
    fn test_context_chain() {
        let err = Error::SharedMemory("segment full".to_string())
            .in_fill_strategy("precount")
            .in_multi_process_load();
        let message = err.to_string();
        assert!(message.starts_with("multi-process event loader failed"));
        assert!(message.contains("precount fill strategy failed"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
