//! Absolute pulse-time resolution from `event_index` / `event_time_zero`.
//!
//! `event_index[p]` is the first event of pulse `p`; pulses may be empty,
//! in which case consecutive entries are equal. The generator walks the
//! event stream with a cursor and yields the pulse time of each event.

use crate::{Error, PulseTime, Result, TimeUnit};

/// Numeric representation of `event_time_zero` values.
///
/// Integral tables are stored in nanoseconds; floating-point tables may be
/// in seconds, microseconds or nanoseconds and are converted through `f64`.
pub trait TimeZero: Copy + Send + Sync + 'static {
    /// Scale factor applied to raw values, or an error if `unit` is not
    /// accepted for this representation.
    ///
    /// # Errors
    /// Returns [`Error::UnsupportedTimeUnit`] for rejected units.
    fn scale(unit: TimeUnit) -> Result<f64>;

    /// Absolute time of a pulse with raw time-zero `value`.
    fn pulse_time(offset: PulseTime, scale: f64, value: Self) -> PulseTime;
}

impl TimeZero for i64 {
    fn scale(unit: TimeUnit) -> Result<f64> {
        match unit {
            TimeUnit::Nanosecond => Ok(1.0),
            other => Err(Error::UnsupportedTimeUnit {
                unit: other.to_string(),
                context: "integral event_time_zero (nanosecond required)".to_string(),
            }),
        }
    }

    fn pulse_time(offset: PulseTime, _scale: f64, value: Self) -> PulseTime {
        offset.add_nanoseconds(value)
    }
}

impl TimeZero for f64 {
    fn scale(unit: TimeUnit) -> Result<f64> {
        Ok(unit.seconds_factor())
    }

    fn pulse_time(offset: PulseTime, scale: f64, value: Self) -> PulseTime {
        offset.add_seconds(scale * value)
    }
}

/// Cursor over the pulses of one bank.
#[derive(Clone, Debug)]
pub struct PulseTimeGenerator<Z: TimeZero> {
    event_index: Vec<usize>,
    time_zero: Vec<Z>,
    scale: f64,
    offset: PulseTime,
    event: usize,
    pulse: usize,
    pulse_time: PulseTime,
    seeked: bool,
}

impl<Z: TimeZero> PulseTimeGenerator<Z> {
    /// Creates a generator over a pulse table.
    ///
    /// # Errors
    /// Returns an error if `unit` is not accepted for `Z`, or if the index
    /// and time-zero tables differ in length.
    pub fn new(
        event_index: Vec<usize>,
        time_zero: Vec<Z>,
        unit: TimeUnit,
        offset: PulseTime,
    ) -> Result<Self> {
        if event_index.len() != time_zero.len() {
            return Err(Error::ConfigError(format!(
                "event_index has {} entries but event_time_zero has {}",
                event_index.len(),
                time_zero.len()
            )));
        }
        Ok(Self {
            event_index,
            time_zero,
            scale: Z::scale(unit)?,
            offset,
            event: 0,
            pulse: 0,
            pulse_time: offset,
            seeked: false,
        })
    }

    /// Number of pulses in the table.
    #[must_use]
    pub fn pulse_count(&self) -> usize {
        self.event_index.len()
    }

    /// Positions the cursor on event `event`.
    ///
    /// Seeking backwards restarts the pulse search from the first pulse.
    ///
    /// # Errors
    /// Returns [`Error::EmptyEventIndex`] if the pulse table is empty.
    pub fn seek(&mut self, event: usize) -> Result<()> {
        if self.event_index.is_empty() {
            return Err(Error::EmptyEventIndex);
        }
        if event < self.event {
            self.pulse = 0;
        }
        self.event = event;
        while self.pulse + 1 < self.event_index.len()
            && self.event >= self.event_index[self.pulse + 1]
        {
            self.pulse += 1;
        }
        self.update_pulse_time();
        self.seeked = true;
        Ok(())
    }

    /// Pulse time of the event under the cursor; advances the cursor.
    ///
    /// Without a prior [`seek`](Self::seek) this starts at event 0.
    ///
    /// # Errors
    /// Returns [`Error::EmptyEventIndex`] if the pulse table is empty.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Result<PulseTime> {
        if !self.seeked {
            self.seek(0)?;
        }
        while self.pulse + 1 < self.event_index.len()
            && self.event >= self.event_index[self.pulse + 1]
        {
            self.pulse += 1;
            self.update_pulse_time();
        }
        self.event += 1;
        Ok(self.pulse_time)
    }

    fn update_pulse_time(&mut self) {
        self.pulse_time = Z::pulse_time(self.offset, self.scale, self.time_zero[self.pulse]);
    }
}
