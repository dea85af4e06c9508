//! Event, load range and time types shared by all loading paths.

use crate::{Error, Result};
use bytemuck::{Pod, Zeroable};
use chrono::{DateTime, NaiveDateTime};
use std::fmt;
use std::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

const NANOS_PER_SECOND: f64 = 1e9;

/// Absolute pulse time in nanoseconds since the Unix epoch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Pod, Zeroable)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(transparent)]
pub struct PulseTime(i64);

impl PulseTime {
    /// The Unix epoch.
    pub const EPOCH: Self = Self(0);

    #[must_use]
    pub const fn from_nanoseconds(nanoseconds: i64) -> Self {
        Self(nanoseconds)
    }

    #[must_use]
    pub const fn nanoseconds(self) -> i64 {
        self.0
    }

    /// Returns this time shifted by an integral number of nanoseconds.
    #[must_use]
    pub const fn add_nanoseconds(self, nanoseconds: i64) -> Self {
        Self(self.0.wrapping_add(nanoseconds))
    }

    /// Returns this time shifted by `seconds`, rounded to the nearest nanosecond.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn add_seconds(self, seconds: f64) -> Self {
        Self(self.0.wrapping_add((seconds * NANOS_PER_SECOND).round() as i64))
    }

    /// Parses an ISO-8601 timestamp such as the `offset` attribute of
    /// `event_time_zero`. Timestamps without a zone are taken as UTC.
    ///
    /// # Errors
    /// Returns an error if the string is not a valid timestamp or lies
    /// outside the representable nanosecond range.
    pub fn parse_iso8601(value: &str) -> Result<Self> {
        let value = value.trim();
        let nanos = if let Ok(datetime) = DateTime::parse_from_rfc3339(value) {
            datetime.timestamp_nanos_opt()
        } else {
            ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
                .iter()
                .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
                .ok_or_else(|| Error::InvalidTimestamp(value.to_string()))?
                .and_utc()
                .timestamp_nanos_opt()
        };
        nanos
            .map(Self)
            .ok_or_else(|| Error::InvalidTimestamp(format!("{value} is out of range")))
    }
}

impl fmt::Display for PulseTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ns", self.0)
    }
}

/// Physical unit of a time dataset, from its `units` attribute.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum TimeUnit {
    Second,
    Microsecond,
    Nanosecond,
}

impl TimeUnit {
    /// Parses a unit string, naming `context` in the error.
    ///
    /// # Errors
    /// Returns [`Error::UnsupportedTimeUnit`] for anything other than
    /// second, microsecond or nanosecond spellings.
    pub fn parse(unit: &str, context: &str) -> Result<Self> {
        match unit.trim() {
            "second" | "seconds" | "s" => Ok(Self::Second),
            "microsecond" | "microseconds" | "us" | "\u{b5}s" => Ok(Self::Microsecond),
            "nanosecond" | "nanoseconds" | "ns" => Ok(Self::Nanosecond),
            other => Err(Error::UnsupportedTimeUnit {
                unit: other.to_string(),
                context: context.to_string(),
            }),
        }
    }

    /// Factor converting a value in this unit to seconds.
    #[must_use]
    pub const fn seconds_factor(self) -> f64 {
        match self {
            Self::Second => 1.0,
            Self::Microsecond => 1e-6,
            Self::Nanosecond => 1e-9,
        }
    }

    /// Factor converting a value in this unit to microseconds.
    #[must_use]
    pub const fn microseconds_factor(self) -> f64 {
        match self {
            Self::Second => 1e6,
            Self::Microsecond => 1.0,
            Self::Nanosecond => 1e-3,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Second => "second",
            Self::Microsecond => "microsecond",
            Self::Nanosecond => "nanosecond",
        }
    }
}

impl FromStr for TimeUnit {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s, "time dataset")
    }
}

impl fmt::Display for TimeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A contiguous slice of one bank's event stream.
///
/// Invariant: `event_offset + event_count` does not exceed the bank size.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LoadRange {
    pub bank_index: usize,
    pub event_offset: usize,
    pub event_count: usize,
}

impl LoadRange {
    #[must_use]
    pub const fn new(bank_index: usize, event_offset: usize, event_count: usize) -> Self {
        Self {
            bank_index,
            event_offset,
            event_count,
        }
    }

    /// Zero-count range used to keep ranks in lock-step.
    #[must_use]
    pub const fn padding() -> Self {
        Self::new(0, 0, 0)
    }

    /// One past the last event of the range.
    #[must_use]
    pub const fn end(&self) -> usize {
        self.event_offset + self.event_count
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.event_count == 0
    }
}

/// A detector event as stored in per-pixel event lists.
///
/// The layout is fixed so lists can live in shared-memory segments.
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(C)]
pub struct TofEvent {
    /// Time of flight relative to the pulse, in microseconds.
    pub tof: f64,
    pub pulse_time: PulseTime,
}

impl TofEvent {
    #[must_use]
    pub const fn new(tof: f64, pulse_time: PulseTime) -> Self {
        Self { tof, pulse_time }
    }

    /// Total order by pulse time, then time of flight.
    #[must_use]
    pub fn canonical_cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.pulse_time
            .cmp(&other.pulse_time)
            .then_with(|| self.tof.total_cmp(&other.tof))
    }
}

/// An event routed to a worker, addressed by its worker-local spectrum index.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct IndexedEvent<T> {
    pub local_index: usize,
    pub time_offset: T,
    pub pulse_time: PulseTime,
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_time_unit_parse() {
        assert_eq!(TimeUnit::parse("second", "x").unwrap(), TimeUnit::Second);
        assert_eq!(TimeUnit::parse("us", "x").unwrap(), TimeUnit::Microsecond);
        assert_eq!(
            "nanoseconds".parse::<TimeUnit>().unwrap(),
            TimeUnit::Nanosecond
        );
        let err = TimeUnit::parse("minute", "event_time_zero").unwrap_err();
        assert!(matches!(err, Error::UnsupportedTimeUnit { .. }));
        assert!(err.to_string().contains("event_time_zero"));
    }

    #[test]
    fn test_time_unit_factors() {
        assert_relative_eq!(TimeUnit::Second.microseconds_factor(), 1e6);
        assert_relative_eq!(TimeUnit::Nanosecond.microseconds_factor(), 1e-3);
        assert_relative_eq!(TimeUnit::Microsecond.seconds_factor(), 1e-6);
    }

    #[test]
    fn test_pulse_time_arithmetic() {
        let t = PulseTime::from_nanoseconds(1000);
        assert_eq!(t.add_nanoseconds(4).nanoseconds(), 1004);
        assert_eq!(t.add_seconds(1.5e-6).nanoseconds(), 2500);
    }

    #[test]
    fn test_parse_iso8601() {
        let with_zone = PulseTime::parse_iso8601("1970-01-01T00:00:01Z").unwrap();
        assert_eq!(with_zone.nanoseconds(), 1_000_000_000);

        let naive = PulseTime::parse_iso8601("1970-01-01T00:00:02.5").unwrap();
        assert_eq!(naive.nanoseconds(), 2_500_000_000);

        let shifted = PulseTime::parse_iso8601("1970-01-01T01:00:00+01:00").unwrap();
        assert_eq!(shifted, PulseTime::EPOCH);

        assert!(PulseTime::parse_iso8601("yesterday").is_err());
    }

    #[test]
    fn test_load_range() {
        let range = LoadRange::new(2, 10, 5);
        assert_eq!(range.end(), 15);
        assert!(!range.is_empty());
        assert!(LoadRange::padding().is_empty());
    }

    #[test]
    fn test_tof_event_layout() {
        assert_eq!(std::mem::size_of::<TofEvent>(), 16);
        assert_eq!(std::mem::align_of::<TofEvent>(), 8);

        let event = TofEvent::new(2.5, PulseTime::from_nanoseconds(-3));
        let bytes = bytemuck::bytes_of(&event);
        assert_eq!(bytes.len(), 16);
        assert_eq!(bytemuck::pod_read_unaligned::<TofEvent>(bytes), event);
    }
}
