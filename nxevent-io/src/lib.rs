//! nxevent-io: File, process and rank level machinery for nxevent.
//!
//! This crate reads `NXevent_data` banks through HDF5, redistributes events
//! across cooperating ranks ([`EventParser`]) or across worker processes
//! staging into shared memory ([`MultiProcessEventLoader`]), and exposes
//! the [`EventLoader`] façade selecting between the two.
//!

pub mod comm;
mod error;
pub mod fill;
pub mod loader;
pub mod multiprocess;
pub mod nexus;
pub mod parser;
pub mod pool;
pub mod shmem;
pub mod synthetic;

pub use comm::{Communicator, LocalCommunicator, WireEvent};
pub use error::{Error, Result};
pub use fill::FillStrategy;
pub use loader::{EventLoader, EventLoaderConfig};
pub use multiprocess::{MultiProcessConfig, MultiProcessEventLoader, WorkerArgs};
pub use nexus::{
    bank_sizes, make_any_event_id_to_bank_map, NXEventDataLoader, NXEventDataSource,
    NumericKind, TimeOffset,
};
pub use parser::EventParser;
pub use shmem::{EventsListsShmemManager, EventsListsShmemStorage};
