//! Round-robin routing of events to workers by global spectrum index.

use crate::error::check_range;
use crate::{Error, IndexedEvent, LoadRange, PulseTimeGenerator, Result};
use crate::pulse_time::TimeZero;

/// Splits the events of one load range into per-worker lists.
///
/// An event with global spectrum index `s` goes to worker `s % n` with
/// local index `s / n`, tagged with its resolved pulse time.
#[derive(Clone, Debug)]
pub struct EventDataPartitioner<Z: TimeZero> {
    num_workers: usize,
    pulse_times: PulseTimeGenerator<Z>,
}

impl<Z: TimeZero> EventDataPartitioner<Z> {
    #[must_use]
    pub fn new(num_workers: usize, pulse_times: PulseTimeGenerator<Z>) -> Self {
        Self {
            num_workers: num_workers.max(1),
            pulse_times,
        }
    }

    #[must_use]
    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    /// Partitions `range.event_count` events from the front of
    /// `global_indices` / `time_offsets`.
    ///
    /// `outputs` is cleared and resized to the worker count. Pulse times
    /// are resolved from `range.event_offset` onwards; empty ranges do not
    /// touch the pulse table.
    ///
    /// # Errors
    /// Returns an error if the buffers are shorter than the range, an index
    /// is negative, or pulse times cannot be resolved.
    pub fn partition<T: Copy>(
        &mut self,
        outputs: &mut Vec<Vec<IndexedEvent<T>>>,
        global_indices: &[i32],
        time_offsets: &[T],
        range: &LoadRange,
    ) -> Result<()> {
        let count = range.event_count;
        check_range("event id buffer", 0, count, global_indices.len())?;
        check_range("event time offset buffer", 0, count, time_offsets.len())?;

        outputs.clear();
        outputs.resize_with(self.num_workers, Vec::new);
        if count == 0 {
            return Ok(());
        }

        self.pulse_times.seek(range.event_offset)?;
        for (&index, &time_offset) in global_indices[..count]
            .iter()
            .zip(&time_offsets[..count])
        {
            let spectrum = usize::try_from(index).map_err(|_| Error::InvalidEventId {
                id: i64::from(index),
                offset: 0,
            })?;
            outputs[spectrum % self.num_workers].push(IndexedEvent {
                local_index: spectrum / self.num_workers,
                time_offset,
                pulse_time: self.pulse_times.next()?,
            });
        }
        Ok(())
    }
}

/// Partitioner for a bank, typed by the stored `event_time_zero` kind.
///
/// Resolved once when a bank is opened; the variant is matched per
/// partition call, never per event.
#[derive(Clone, Debug)]
pub enum AnyEventDataPartitioner {
    Integral(EventDataPartitioner<i64>),
    Floating(EventDataPartitioner<f64>),
}

impl AnyEventDataPartitioner {
    #[must_use]
    pub fn num_workers(&self) -> usize {
        match self {
            Self::Integral(inner) => inner.num_workers(),
            Self::Floating(inner) => inner.num_workers(),
        }
    }

    /// See [`EventDataPartitioner::partition`].
    ///
    /// # Errors
    /// Propagates errors of the underlying partitioner.
    pub fn partition<T: Copy>(
        &mut self,
        outputs: &mut Vec<Vec<IndexedEvent<T>>>,
        global_indices: &[i32],
        time_offsets: &[T],
        range: &LoadRange,
    ) -> Result<()> {
        match self {
            Self::Integral(inner) => inner.partition(outputs, global_indices, time_offsets, range),
            Self::Floating(inner) => inner.partition(outputs, global_indices, time_offsets, range),
        }
    }
}

/// Converts file-local event ids to global spectrum indices in place.
///
/// # Errors
/// Returns [`Error::InvalidEventId`] if an id is below `bank_offset`.
pub fn to_global_indices(event_ids: &mut [i32], bank_offset: i32) -> Result<()> {
    for id in event_ids.iter_mut() {
        let global = id
            .checked_sub(bank_offset)
            .filter(|value| *value >= 0)
            .ok_or(Error::InvalidEventId {
                id: i64::from(*id),
                offset: i64::from(bank_offset),
            })?;
        *id = global;
    }
    Ok(())
}
