//! Writer for `NXevent_data` files with arbitrary stored types.
//!
//! Used by tests, benchmarks and the `synthesize` CLI command.

use crate::nexus::{EVENT_ID, EVENT_INDEX, EVENT_TIME_OFFSET, EVENT_TIME_ZERO};
use crate::{Error, Result};
use hdf5::types::{H5Type, VarLenUnicode};
use hdf5::{Dataset, File, Group};
use ndarray::{s, ArrayView1};
use std::path::Path;
use std::str::FromStr;

const CHUNK_EVENTS: usize = 64 * 1024;

/// A typed 1-d column.
#[derive(Clone, Debug, PartialEq)]
pub enum Column {
    U8(Vec<u8>),
    I32(Vec<i32>),
    I64(Vec<i64>),
    U32(Vec<u32>),
    U64(Vec<u64>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

impl Column {
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::U8(v) => v.len(),
            Self::I32(v) => v.len(),
            Self::I64(v) => v.len(),
            Self::U32(v) => v.len(),
            Self::U64(v) => v.len(),
            Self::F32(v) => v.len(),
            Self::F64(v) => v.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn write(&self, group: &Group, name: &str) -> Result<Dataset> {
        match self {
            Self::U8(v) => write_column(group, name, v),
            Self::I32(v) => write_column(group, name, v),
            Self::I64(v) => write_column(group, name, v),
            Self::U32(v) => write_column(group, name, v),
            Self::U64(v) => write_column(group, name, v),
            Self::F32(v) => write_column(group, name, v),
            Self::F64(v) => write_column(group, name, v),
        }
    }
}

/// Contents of one bank group.
#[derive(Clone, Debug)]
pub struct SyntheticBank {
    pub name: String,
    pub event_id: Column,
    pub event_time_offset: Column,
    pub event_time_offset_unit: String,
    pub event_index: Column,
    pub event_time_zero: Column,
    pub event_time_zero_unit: String,
    /// ISO-8601 `offset` attribute of `event_time_zero`, if any.
    pub event_time_zero_offset: Option<String>,
}

impl SyntheticBank {
    /// A bank of `events` events spread evenly over `pulses` pulses.
    ///
    /// Event ids cycle through `first_id..first_id + pixels`; time offsets
    /// are `f32` microseconds and pulse times are integral nanoseconds
    /// 1/60 s apart.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_possible_wrap,
        clippy::cast_precision_loss
    )]
    pub fn uniform(name: &str, first_id: i32, pixels: usize, events: usize, pulses: usize) -> Self {
        let pixels = pixels.max(1);
        let pulses = pulses.max(1);
        let per_pulse = events.div_ceil(pulses);
        let event_id = (0..events)
            .map(|i| first_id + ((i * 7919) % pixels) as i32)
            .collect();
        let event_time_offset = (0..events)
            .map(|i| ((i * 37) % 16_667) as f32 + 0.5)
            .collect();
        let event_index = (0..pulses).map(|p| ((p * per_pulse).min(events)) as u64).collect();
        let event_time_zero = (0..pulses).map(|p| p as i64 * 16_666_667).collect();
        Self {
            name: name.to_string(),
            event_id: Column::I32(event_id),
            event_time_offset: Column::F32(event_time_offset),
            event_time_offset_unit: "microsecond".to_string(),
            event_index: Column::U64(event_index),
            event_time_zero: Column::I64(event_time_zero),
            event_time_zero_unit: "nanosecond".to_string(),
            event_time_zero_offset: Some("2024-01-01T00:00:00Z".to_string()),
        }
    }
}

/// Writes `banks` as subgroups of `group` into a new file at `path`.
///
/// # Errors
/// Returns an error if the file cannot be created or a bank is malformed.
pub fn write_event_file<P: AsRef<Path>>(
    path: P,
    group: &str,
    banks: &[SyntheticBank],
) -> Result<()> {
    let file = File::create(path)?;
    let root = file.create_group(group)?;
    set_attr_str(&root, "NX_class", "NXentry")?;
    for bank in banks {
        if bank.event_id.len() != bank.event_time_offset.len() {
            return Err(Error::InvalidFormat(format!(
                "bank {} has {} event ids but {} time offsets",
                bank.name,
                bank.event_id.len(),
                bank.event_time_offset.len()
            )));
        }
        let bank_group = root.create_group(&bank.name)?;
        set_attr_str(&bank_group, "NX_class", "NXevent_data")?;

        bank.event_id.write(&bank_group, EVENT_ID)?;
        let offsets = bank.event_time_offset.write(&bank_group, EVENT_TIME_OFFSET)?;
        set_dataset_attr(&offsets, "units", &bank.event_time_offset_unit)?;
        bank.event_index.write(&bank_group, EVENT_INDEX)?;
        let zero = bank.event_time_zero.write(&bank_group, EVENT_TIME_ZERO)?;
        set_dataset_attr(&zero, "units", &bank.event_time_zero_unit)?;
        if let Some(offset) = &bank.event_time_zero_offset {
            set_dataset_attr(&zero, "offset", offset)?;
        }
    }
    Ok(())
}

fn write_column<T: H5Type>(group: &Group, name: &str, data: &[T]) -> Result<Dataset> {
    let dataset = create_extendable_dataset::<T>(group, name, CHUNK_EVENTS)?;
    for (index, chunk) in data.chunks(CHUNK_EVENTS).enumerate() {
        append_slice(&dataset, index * CHUNK_EVENTS, chunk)?;
    }
    Ok(dataset)
}

fn create_extendable_dataset<T: H5Type>(
    group: &Group,
    name: &str,
    chunk_events: usize,
) -> Result<Dataset> {
    Ok(group
        .new_dataset::<T>()
        .shape((0..,))
        .chunk((chunk_events,))
        .create(name)?)
}

fn append_slice<T: H5Type>(dataset: &Dataset, offset: usize, data: &[T]) -> Result<()> {
    if data.is_empty() {
        return Ok(());
    }
    let new_len = offset + data.len();
    dataset.resize((new_len,))?;
    let view = ArrayView1::from(data);
    dataset.write_slice(view, s![offset..new_len])?;
    Ok(())
}

fn set_dataset_attr(dataset: &Dataset, name: &str, value: &str) -> Result<()> {
    let value = to_var_len_unicode(value)?;
    dataset
        .new_attr::<VarLenUnicode>()
        .create(name)?
        .write_scalar(&value)?;
    Ok(())
}

fn set_attr_str(group: &Group, name: &str, value: &str) -> Result<()> {
    let value = to_var_len_unicode(value)?;
    group
        .new_attr::<VarLenUnicode>()
        .create(name)?
        .write_scalar(&value)?;
    Ok(())
}

fn to_var_len_unicode(value: &str) -> Result<VarLenUnicode> {
    VarLenUnicode::from_str(value)
        .map_err(|e| Error::InvalidFormat(format!("invalid utf-8 attribute: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_uniform_bank_shape() {
        let bank = SyntheticBank::uniform("bank1", 100, 10, 25, 4);
        assert_eq!(bank.event_id.len(), 25);
        assert_eq!(bank.event_index, Column::U64(vec![0, 7, 14, 21]));
        let Column::I32(ids) = &bank.event_id else {
            panic!("expected int32 ids");
        };
        assert!(ids.iter().all(|id| (100..110).contains(id)));
    }

    #[test]
    fn test_mismatched_columns_rejected() {
        let file = NamedTempFile::new().unwrap();
        let mut bank = SyntheticBank::uniform("bank1", 0, 4, 8, 2);
        bank.event_time_offset = Column::F64(vec![1.0]);
        let err = write_event_file(file.path(), "entry", &[bank]).unwrap_err();
        assert!(matches!(err, Error::InvalidFormat(_)));
    }

    #[test]
    fn test_written_file_reads_back() {
        let file = NamedTempFile::new().unwrap();
        let bank = SyntheticBank::uniform("bank1", 0, 4, 200_000, 3);
        write_event_file(file.path(), "entry", &[bank.clone()]).unwrap();

        let h5 = File::open(file.path()).unwrap();
        let ids = h5
            .dataset("entry/bank1/event_id")
            .unwrap()
            .read_raw::<i32>()
            .unwrap();
        assert_eq!(Column::I32(ids), bank.event_id);
    }
}
