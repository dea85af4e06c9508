//! Asynchronous partition-and-exchange of event batches between ranks.

use crate::comm::{Communicator, WireEvent};
use crate::nexus::TimeOffset;
use crate::{Error, Result};
use nxevent_core::{
    to_global_indices, AnyEventDataPartitioner, IndexedEvent, LoadRange, TimeUnit, TofEvent,
};
use std::sync::Arc;
use std::thread::JoinHandle;

struct ParserState<T> {
    comm: Arc<dyn Communicator>,
    bank_offsets: Vec<i32>,
    partitioner: Option<AnyEventDataPartitioner>,
    tof_factor: f64,
    partitioned: Vec<Vec<IndexedEvent<T>>>,
    event_lists: Vec<Vec<TofEvent>>,
}

type Completed<T> = (Box<ParserState<T>>, Result<()>);

enum Slot<T> {
    Idle(Box<ParserState<T>>),
    Running(JoinHandle<Completed<T>>),
    Poisoned,
}

/// Distributes the events of successive load ranges to their owning ranks.
///
/// Global spectrum `s` is owned by rank `s % size` and lands in that rank's
/// event list `s / size`. Every rank must call [`start_async`] for every
/// load range of the common schedule, including padding ranges.
///
/// [`start_async`]: EventParser::start_async
pub struct EventParser<T: TimeOffset> {
    rank_groups: Vec<Vec<usize>>,
    slot: Slot<T>,
}

impl<T: TimeOffset> EventParser<T> {
    /// Creates a parser filling `event_lists`, this rank's local spectra.
    ///
    /// `rank_groups` holds the ranks cooperating on each partition and must
    /// cover every rank exactly once.
    ///
    /// # Errors
    /// Returns a configuration error if the rank groups do not cover the
    /// communicator.
    pub fn new(
        comm: Arc<dyn Communicator>,
        rank_groups: Vec<Vec<usize>>,
        bank_offsets: Vec<i32>,
        event_lists: Vec<Vec<TofEvent>>,
    ) -> Result<Self> {
        let mut seen = vec![false; comm.size()];
        for &rank in rank_groups.iter().flatten() {
            match seen.get_mut(rank) {
                Some(slot) if !*slot => *slot = true,
                _ => {
                    return Err(nxevent_core::Error::ConfigError(format!(
                        "rank {rank} is repeated or outside a group of {} ranks",
                        comm.size()
                    ))
                    .into());
                }
            }
        }
        if seen.iter().any(|covered| !covered) {
            return Err(nxevent_core::Error::ConfigError(
                "rank groups do not cover every rank".to_string(),
            )
            .into());
        }

        Ok(Self {
            rank_groups,
            slot: Slot::Idle(Box::new(ParserState {
                comm,
                bank_offsets,
                partitioner: None,
                tof_factor: 1.0,
                partitioned: Vec::new(),
                event_lists,
            })),
        })
    }

    #[must_use]
    pub fn rank_groups(&self) -> &[Vec<usize>] {
        &self.rank_groups
    }

    /// Replaces the partitioner used for subsequent ranges.
    ///
    /// # Errors
    /// Returns an error if the partitioner does not route to one worker per
    /// rank, or if an in-flight unit failed.
    pub fn set_event_data_partitioner(
        &mut self,
        partitioner: AnyEventDataPartitioner,
    ) -> Result<()> {
        let state = self.idle_state()?;
        if partitioner.num_workers() != state.comm.size() {
            return Err(nxevent_core::Error::ConfigError(format!(
                "partitioner routes to {} workers but there are {} ranks",
                partitioner.num_workers(),
                state.comm.size()
            ))
            .into());
        }
        state.partitioner = Some(partitioner);
        Ok(())
    }

    /// Sets the unit of raw time offsets; stored values are microseconds.
    ///
    /// # Errors
    /// Returns an error if an in-flight unit failed.
    pub fn set_event_time_offset_unit(&mut self, unit: TimeUnit) -> Result<()> {
        self.idle_state()?.tof_factor = unit.microseconds_factor();
        Ok(())
    }

    /// Starts partitioning and exchanging one range on a background thread.
    ///
    /// Waits for the previous unit first. `event_ids` are file-local ids of
    /// bank `range.bank_index`.
    ///
    /// # Errors
    /// Returns an error if the previous unit failed.
    pub fn start_async(
        &mut self,
        event_ids: Vec<i32>,
        time_offsets: Vec<T>,
        range: LoadRange,
    ) -> Result<()> {
        self.wait()?;
        let Slot::Idle(mut state) = std::mem::replace(&mut self.slot, Slot::Poisoned) else {
            return Err(poisoned());
        };
        let handle = std::thread::Builder::new()
            .name("nxevent-parser".to_string())
            .spawn(move || {
                let result = state.process(event_ids, &time_offsets, &range);
                (state, result)
            })?;
        self.slot = Slot::Running(handle);
        Ok(())
    }

    /// Blocks until the in-flight unit, if any, has completed.
    ///
    /// # Errors
    /// Returns the error of the completed unit.
    pub fn wait(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.slot, Slot::Poisoned) {
            Slot::Running(handle) => {
                let (state, result) = handle.join().map_err(|e| Error::from_panic(&*e))?;
                self.slot = Slot::Idle(state);
                result
            }
            idle @ Slot::Idle(_) => {
                self.slot = idle;
                Ok(())
            }
            Slot::Poisoned => Err(poisoned()),
        }
    }

    /// Waits for outstanding work and returns this rank's event lists.
    ///
    /// # Errors
    /// Returns the error of the last in-flight unit.
    pub fn into_event_lists(mut self) -> Result<Vec<Vec<TofEvent>>> {
        self.wait()?;
        match self.slot {
            Slot::Idle(state) => Ok(state.event_lists),
            _ => Err(poisoned()),
        }
    }

    fn idle_state(&mut self) -> Result<&mut ParserState<T>> {
        self.wait()?;
        match &mut self.slot {
            Slot::Idle(state) => Ok(&mut **state),
            _ => Err(poisoned()),
        }
    }
}

fn poisoned() -> Error {
    Error::Communication("event parser is unusable after a failed unit".to_string())
}

impl<T: TimeOffset> ParserState<T> {
    fn process(
        &mut self,
        mut event_ids: Vec<i32>,
        time_offsets: &[T],
        range: &LoadRange,
    ) -> Result<()> {
        let size = self.comm.size();
        let count = range.event_count;
        if count == 0 {
            self.partitioned.clear();
            self.partitioned.resize_with(size, Vec::new);
        } else {
            let offset = *self.bank_offsets.get(range.bank_index).ok_or_else(|| {
                nxevent_core::Error::out_of_range(
                    "bank offset table",
                    range.bank_index,
                    1,
                    self.bank_offsets.len(),
                )
            })?;
            let available = event_ids.len();
            let ids = event_ids.get_mut(..count).ok_or_else(|| {
                nxevent_core::Error::out_of_range("event id buffer", 0, count, available)
            })?;
            to_global_indices(ids, offset)?;
            let partitioner = self.partitioner.as_mut().ok_or_else(|| {
                nxevent_core::Error::ConfigError("no partitioner set for bank".to_string())
            })?;
            partitioner.partition(&mut self.partitioned, &event_ids, time_offsets, range)?;
        }

        let factor = self.tof_factor;
        let outgoing = self
            .partitioned
            .iter()
            .map(|events| {
                events
                    .iter()
                    .map(|e| WireEvent {
                        local_index: e.local_index,
                        event: TofEvent::new(e.time_offset.to_f64() * factor, e.pulse_time),
                    })
                    .collect()
            })
            .collect();

        let incoming = self.comm.exchange(outgoing)?;
        let lists = self.event_lists.len();
        for message in incoming {
            for wire in message {
                self.event_lists
                    .get_mut(wire.local_index)
                    .ok_or_else(|| {
                        nxevent_core::Error::out_of_range(
                            "rank event lists",
                            wire.local_index,
                            1,
                            lists,
                        )
                    })?
                    .push(wire.event);
            }
        }
        log::debug!(
            "rank {} exchanged range bank={} offset={} count={}",
            self.comm.rank(),
            range.bank_index,
            range.event_offset,
            count
        );
        Ok(())
    }
}

/// Number of spectra owned by `rank` when `num_pixels` spectra are spread
/// round-robin over `size` ranks.
#[must_use]
pub fn local_spectrum_count(num_pixels: usize, size: usize, rank: usize) -> usize {
    let size = size.max(1);
    num_pixels / size + usize::from(rank < num_pixels % size)
}
