//! nxevent-core: Core types and algorithms for parallel NeXus event loading.
//!
//! This crate is free of file and process I/O. It provides the load
//! balancing of banks across workers ([`Chunker`]), absolute pulse-time
//! resolution from sparse pulse index tables ([`PulseTimeGenerator`]) and
//! the round-robin routing of events to workers ([`EventDataPartitioner`]).
//!

pub mod chunker;
pub mod error;
pub mod event;
pub mod partitioner;
pub mod pulse_time;

pub use chunker::{Chunker, Partition};
pub use error::{Error, Result};
pub use event::{IndexedEvent, LoadRange, PulseTime, TimeUnit, TofEvent};
pub use partitioner::{to_global_indices, AnyEventDataPartitioner, EventDataPartitioner};
pub use pulse_time::{PulseTimeGenerator, TimeZero};
