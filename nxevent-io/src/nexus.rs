//! HDF5/NeXus event data access (`NXevent_data` banks).
//!
//! A bank group holds `event_id`, `event_time_offset` (with a `units`
//! attribute), and the pulse table `event_index` / `event_time_zero`
//! (with `units` and an optional ISO-8601 `offset` attribute).

use crate::{Error, Result};
use hdf5::types::{
    FixedAscii, FixedUnicode, FloatSize, H5Type, IntSize, TypeDescriptor, VarLenAscii,
    VarLenUnicode,
};
use hdf5::{Dataset, File, Group};
use ndarray::s;
use nxevent_core::error::check_range;
use nxevent_core::{
    AnyEventDataPartitioner, EventDataPartitioner, PulseTime, PulseTimeGenerator, TimeUnit,
};
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::path::Path;

pub const EVENT_ID: &str = "event_id";
pub const EVENT_TIME_OFFSET: &str = "event_time_offset";
pub const EVENT_INDEX: &str = "event_index";
pub const EVENT_TIME_ZERO: &str = "event_time_zero";

/// Stored numeric type of a dataset.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum NumericKind {
    I32,
    I64,
    U32,
    U64,
    F32,
    F64,
}

impl NumericKind {
    /// Determines the kind of a dataset from its HDF5 type descriptor.
    ///
    /// # Errors
    /// Returns [`nxevent_core::Error::UnsupportedDataType`] for any type
    /// outside the supported set.
    pub fn of(dataset: &Dataset) -> Result<Self> {
        let descriptor = dataset.dtype()?.to_descriptor()?;
        match descriptor {
            TypeDescriptor::Integer(IntSize::U4) => Ok(Self::I32),
            TypeDescriptor::Integer(IntSize::U8) => Ok(Self::I64),
            TypeDescriptor::Unsigned(IntSize::U4) => Ok(Self::U32),
            TypeDescriptor::Unsigned(IntSize::U8) => Ok(Self::U64),
            TypeDescriptor::Float(FloatSize::U4) => Ok(Self::F32),
            TypeDescriptor::Float(FloatSize::U8) => Ok(Self::F64),
            other => Err(unsupported(dataset, &format!("{other:?}"))),
        }
    }

    #[must_use]
    pub const fn is_integral(self) -> bool {
        !matches!(self, Self::F32 | Self::F64)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::I32 => "int32",
            Self::I64 => "int64",
            Self::U32 => "uint32",
            Self::U64 => "uint64",
            Self::F32 => "float32",
            Self::F64 => "float64",
        }
    }
}

impl std::fmt::Display for NumericKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Element type of `event_time_offset` as read from file.
pub trait TimeOffset: H5Type + Copy + Default + Send + Sync + 'static {
    const KIND: NumericKind;

    fn to_f64(self) -> f64;
}

macro_rules! impl_time_offset {
    ($($ty:ty => $kind:ident),* $(,)?) => {
        $(
            impl TimeOffset for $ty {
                const KIND: NumericKind = NumericKind::$kind;

                #[allow(clippy::cast_precision_loss, clippy::cast_lossless)]
                fn to_f64(self) -> f64 {
                    self as f64
                }
            }
        )*
    };
}

impl_time_offset!(i32 => I32, i64 => I64, u32 => U32, u64 => U64, f32 => F32, f64 => F64);

/// Bank-level event reads for one file group.
pub trait NXEventDataSource<T: TimeOffset> {
    /// Selects bank `bank` for subsequent reads and returns a partitioner
    /// over its pulse table.
    ///
    /// # Errors
    /// Returns an error if the bank cannot be opened or its pulse table has
    /// an unsupported type or unit.
    fn set_bank_index(&mut self, bank: usize) -> Result<AnyEventDataPartitioner>;

    /// Reads `count` event ids starting at `start` into `buffer`.
    ///
    /// # Errors
    /// Returns an out-of-range error if the slice exceeds the dataset.
    fn read_event_id(&self, buffer: &mut Vec<i32>, start: usize, count: usize) -> Result<()>;

    /// Reads `count` time offsets starting at `start` into `buffer`.
    ///
    /// # Errors
    /// Returns an out-of-range error if the slice exceeds the dataset.
    fn read_event_time_offset(&self, buffer: &mut Vec<T>, start: usize, count: usize)
        -> Result<()>;

    /// Unit of the selected bank's time offsets.
    ///
    /// # Errors
    /// Returns an error if the unit attribute holds an unsupported unit.
    fn read_event_time_offset_unit(&self) -> Result<TimeUnit>;
}

struct BankDatasets {
    event_id: Dataset,
    event_time_offset: Dataset,
}

/// [`NXEventDataSource`] backed by an HDF5 file.
pub struct NXEventDataLoader<T: TimeOffset> {
    group: Group,
    bank_names: Vec<String>,
    num_workers: usize,
    bank: Option<BankDatasets>,
    _file: File,
    _marker: PhantomData<T>,
}

impl<T: TimeOffset> NXEventDataLoader<T> {
    /// Opens `group_name` in `path`; partitioners route to `num_workers`.
    ///
    /// # Errors
    /// Returns an error if the file or group cannot be opened.
    pub fn open<P: AsRef<Path>>(
        path: P,
        group_name: &str,
        bank_names: &[String],
        num_workers: usize,
    ) -> Result<Self> {
        let file = File::open(path)?;
        let group = file.group(group_name)?;
        Ok(Self {
            group,
            bank_names: bank_names.to_vec(),
            num_workers,
            bank: None,
            _file: file,
            _marker: PhantomData,
        })
    }

    #[must_use]
    pub fn bank_count(&self) -> usize {
        self.bank_names.len()
    }

    fn selected(&self) -> Result<&BankDatasets> {
        self.bank
            .as_ref()
            .ok_or_else(|| Error::InvalidFormat("no bank selected".to_string()))
    }

    fn bank_group(&self, bank: usize) -> Result<Group> {
        let name = self.bank_names.get(bank).ok_or_else(|| {
            Error::from(nxevent_core::Error::out_of_range(
                "bank index",
                bank,
                1,
                self.bank_names.len(),
            ))
        })?;
        Ok(self.group.group(name)?)
    }
}

impl<T: TimeOffset> NXEventDataSource<T> for NXEventDataLoader<T> {
    fn set_bank_index(&mut self, bank: usize) -> Result<AnyEventDataPartitioner> {
        let group = self.bank_group(bank)?;
        let partitioner = read_partitioner(&group, self.num_workers)?;
        self.bank = Some(BankDatasets {
            event_id: group.dataset(EVENT_ID)?,
            event_time_offset: group.dataset(EVENT_TIME_OFFSET)?,
        });
        Ok(partitioner)
    }

    fn read_event_id(&self, buffer: &mut Vec<i32>, start: usize, count: usize) -> Result<()> {
        read_slice(&self.selected()?.event_id, buffer, start, count)
    }

    fn read_event_time_offset(
        &self,
        buffer: &mut Vec<T>,
        start: usize,
        count: usize,
    ) -> Result<()> {
        read_slice(&self.selected()?.event_time_offset, buffer, start, count)
    }

    fn read_event_time_offset_unit(&self) -> Result<TimeUnit> {
        time_offset_unit(&self.selected()?.event_time_offset)
    }
}

/// Pulse table and partitioner construction for one bank group.
///
/// # Errors
/// Returns an error if the pulse datasets are missing or have unsupported
/// types or units.
pub fn read_partitioner(group: &Group, num_workers: usize) -> Result<AnyEventDataPartitioner> {
    let index_dataset = group.dataset(EVENT_INDEX)?;
    let zero_dataset = group.dataset(EVENT_TIME_ZERO)?;
    let event_index = read_event_index(&index_dataset)?;

    let offset = match read_attr_string(&zero_dataset, "offset")? {
        Some(value) => PulseTime::parse_iso8601(&value)?,
        None => PulseTime::EPOCH,
    };
    let kind = NumericKind::of(&zero_dataset)?;
    let unit = match read_attr_string(&zero_dataset, "units")? {
        Some(value) => TimeUnit::parse(&value, EVENT_TIME_ZERO)?,
        None if kind.is_integral() => TimeUnit::Nanosecond,
        None => TimeUnit::Second,
    };

    let partitioner = match kind {
        NumericKind::I32 => {
            integral(num_workers, event_index, widen_i32(&zero_dataset)?, unit, offset)?
        }
        NumericKind::I64 => {
            let zeros = zero_dataset.read_raw::<i64>()?;
            integral(num_workers, event_index, zeros, unit, offset)?
        }
        NumericKind::U32 => {
            integral(num_workers, event_index, widen_u32(&zero_dataset)?, unit, offset)?
        }
        NumericKind::U64 => {
            integral(num_workers, event_index, narrow_u64(&zero_dataset)?, unit, offset)?
        }
        NumericKind::F32 => {
            let values = zero_dataset.read_raw::<f32>()?;
            let values = values.into_iter().map(f64::from).collect();
            floating(num_workers, event_index, values, unit, offset)?
        }
        NumericKind::F64 => {
            floating(num_workers, event_index, zero_dataset.read_raw::<f64>()?, unit, offset)?
        }
    };
    Ok(partitioner)
}

fn integral(
    num_workers: usize,
    event_index: Vec<usize>,
    time_zero: Vec<i64>,
    unit: TimeUnit,
    offset: PulseTime,
) -> Result<AnyEventDataPartitioner> {
    let generator = PulseTimeGenerator::new(event_index, time_zero, unit, offset)?;
    Ok(AnyEventDataPartitioner::Integral(EventDataPartitioner::new(
        num_workers,
        generator,
    )))
}

fn floating(
    num_workers: usize,
    event_index: Vec<usize>,
    time_zero: Vec<f64>,
    unit: TimeUnit,
    offset: PulseTime,
) -> Result<AnyEventDataPartitioner> {
    let generator = PulseTimeGenerator::new(event_index, time_zero, unit, offset)?;
    Ok(AnyEventDataPartitioner::Floating(EventDataPartitioner::new(
        num_workers,
        generator,
    )))
}

fn widen_i32(dataset: &Dataset) -> Result<Vec<i64>> {
    Ok(dataset.read_raw::<i32>()?.into_iter().map(i64::from).collect())
}

fn widen_u32(dataset: &Dataset) -> Result<Vec<i64>> {
    Ok(dataset.read_raw::<u32>()?.into_iter().map(i64::from).collect())
}

fn narrow_u64(dataset: &Dataset) -> Result<Vec<i64>> {
    dataset
        .read_raw::<u64>()?
        .into_iter()
        .map(|value| {
            i64::try_from(value).map_err(|_| {
                Error::InvalidFormat(format!("{EVENT_TIME_ZERO} value {value} exceeds int64"))
            })
        })
        .collect()
}

fn read_event_index(dataset: &Dataset) -> Result<Vec<usize>> {
    match NumericKind::of(dataset)? {
        NumericKind::I32 => to_indices(dataset.read_raw::<i32>()?),
        NumericKind::I64 => to_indices(dataset.read_raw::<i64>()?),
        NumericKind::U32 => to_indices(dataset.read_raw::<u32>()?),
        NumericKind::U64 => to_indices(dataset.read_raw::<u64>()?),
        kind => Err(unsupported(dataset, kind.as_str())),
    }
}

fn to_indices<I>(values: Vec<I>) -> Result<Vec<usize>>
where
    I: Copy + std::fmt::Display,
    usize: TryFrom<I>,
{
    values
        .into_iter()
        .map(|value| {
            usize::try_from(value)
                .map_err(|_| Error::InvalidFormat(format!("invalid {EVENT_INDEX} entry {value}")))
        })
        .collect()
}

fn unsupported(dataset: &Dataset, kind: &str) -> Error {
    Error::CoreError(nxevent_core::Error::UnsupportedDataType {
        dataset: dataset.name(),
        kind: kind.to_string(),
    })
}

/// Reads `count` elements from `start`; the range check comes first.
fn read_slice<T: H5Type + Copy>(
    dataset: &Dataset,
    buffer: &mut Vec<T>,
    start: usize,
    count: usize,
) -> Result<()> {
    check_range(&dataset.name(), start, count, dataset.size())?;
    buffer.clear();
    if count == 0 {
        return Ok(());
    }
    let values = dataset.read_slice_1d::<T, _>(s![start..start + count])?;
    buffer.extend(values.iter().copied());
    Ok(())
}

fn time_offset_unit(dataset: &Dataset) -> Result<TimeUnit> {
    match read_attr_string(dataset, "units")? {
        Some(value) => Ok(TimeUnit::parse(&value, EVENT_TIME_OFFSET)?),
        None => Ok(TimeUnit::Microsecond),
    }
}

fn read_attr_string(dataset: &Dataset, name: &str) -> Result<Option<String>> {
    let Ok(attr) = dataset.attr(name) else {
        return Ok(None);
    };
    let value = match attr.dtype()?.to_descriptor()? {
        TypeDescriptor::VarLenAscii => attr.read_scalar::<VarLenAscii>()?.as_str().to_string(),
        TypeDescriptor::FixedAscii(_) => {
            attr.read_scalar::<FixedAscii<256>>()?.as_str().to_string()
        }
        TypeDescriptor::FixedUnicode(_) => {
            attr.read_scalar::<FixedUnicode<256>>()?.as_str().to_string()
        }
        _ => attr.read_scalar::<VarLenUnicode>()?.as_str().to_string(),
    };
    Ok(Some(value.trim_end_matches('\0').to_string()))
}

fn open_banks<P: AsRef<Path>>(
    path: P,
    group_name: &str,
    bank_names: &[String],
) -> Result<Vec<Group>> {
    let file = File::open(path)?;
    let group = file.group(group_name)?;
    bank_names
        .iter()
        .map(|name| Ok(group.group(name)?))
        .collect()
}

/// Number of events in each bank.
///
/// # Errors
/// Returns an error if a bank or its `event_id` dataset is missing.
pub fn bank_sizes<P: AsRef<Path>>(
    path: P,
    group_name: &str,
    bank_names: &[String],
) -> Result<Vec<usize>> {
    open_banks(path, group_name, bank_names)?
        .iter()
        .map(|bank| Ok(bank.dataset(EVENT_ID)?.size()))
        .collect()
}

/// Stored kind of `event_time_offset`, which must agree across banks.
///
/// # Errors
/// Returns an error if banks disagree or the kind is unsupported.
pub fn event_time_offset_kind<P: AsRef<Path>>(
    path: P,
    group_name: &str,
    bank_names: &[String],
) -> Result<NumericKind> {
    let mut kind = None;
    for bank in open_banks(path, group_name, bank_names)? {
        let bank_kind = NumericKind::of(&bank.dataset(EVENT_TIME_OFFSET)?)?;
        match kind {
            Some(existing) if existing != bank_kind => {
                return Err(Error::InvalidFormat(format!(
                    "{EVENT_TIME_OFFSET} types differ between banks: {existing} and {bank_kind}"
                )));
            }
            _ => kind = Some(bank_kind),
        }
    }
    kind.ok_or_else(|| Error::InvalidFormat("no banks given".to_string()))
}

/// Stored kinds and units of one bank, for diagnostics.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BankSummary {
    pub name: String,
    pub events: usize,
    pub pulses: usize,
    pub event_time_offset_kind: NumericKind,
    pub event_time_offset_unit: TimeUnit,
    pub event_index_kind: NumericKind,
    pub event_time_zero_kind: NumericKind,
}

/// Describes every bank of a group.
///
/// # Errors
/// Returns an error if any bank is malformed.
pub fn summarize_banks<P: AsRef<Path>>(
    path: P,
    group_name: &str,
    bank_names: &[String],
) -> Result<Vec<BankSummary>> {
    open_banks(path, group_name, bank_names)?
        .iter()
        .zip(bank_names)
        .map(|(bank, name)| {
            let offsets = bank.dataset(EVENT_TIME_OFFSET)?;
            let index = bank.dataset(EVENT_INDEX)?;
            Ok(BankSummary {
                name: name.clone(),
                events: bank.dataset(EVENT_ID)?.size(),
                pulses: index.size(),
                event_time_offset_kind: NumericKind::of(&offsets)?,
                event_time_offset_unit: time_offset_unit(&offsets)?,
                event_index_kind: NumericKind::of(&index)?,
                event_time_zero_kind: NumericKind::of(&bank.dataset(EVENT_TIME_ZERO)?)?,
            })
        })
        .collect()
}

/// Names of all subgroups of `group_name` that contain an `event_id` dataset.
///
/// # Errors
/// Returns an error if the file or group cannot be opened.
pub fn list_banks<P: AsRef<Path>>(path: P, group_name: &str) -> Result<Vec<String>> {
    let file = File::open(path)?;
    let group = file.group(group_name)?;
    let mut names = Vec::new();
    for name in group.member_names()? {
        if let Ok(bank) = group.group(&name) {
            if bank.link_exists(EVENT_ID) {
                names.push(name);
            }
        }
    }
    Ok(names)
}

/// One representative event id per non-empty bank, mapped to the bank index.
///
/// # Errors
/// Returns an error if a bank cannot be read.
pub fn make_any_event_id_to_bank_map<P: AsRef<Path>>(
    path: P,
    group_name: &str,
    bank_names: &[String],
) -> Result<BTreeMap<i32, usize>> {
    let mut map = BTreeMap::new();
    for (index, bank) in open_banks(path, group_name, bank_names)?.iter().enumerate() {
        let dataset = bank.dataset(EVENT_ID)?;
        let mut buffer = Vec::new();
        if dataset.size() > 0 {
            read_slice::<i32>(&dataset, &mut buffer, 0, 1)?;
        }
        if let Some(&id) = buffer.first() {
            map.insert(id, index);
        }
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::{write_event_file, Column, SyntheticBank};
    use tempfile::NamedTempFile;

    fn bank(name: &str, ids: Vec<i32>) -> SyntheticBank {
        let n = ids.len();
        SyntheticBank {
            name: name.to_string(),
            event_id: Column::I32(ids),
            event_time_offset: Column::F32((0..n).map(|i| i as f32).collect()),
            event_time_offset_unit: "microsecond".to_string(),
            event_index: Column::U64(vec![0, 2, 2, 3]),
            event_time_zero: Column::F64(vec![0.0, 1.0, 2.0, 3.0]),
            event_time_zero_unit: "second".to_string(),
            event_time_zero_offset: Some("1970-01-01T00:00:10Z".to_string()),
        }
    }

    fn names(banks: &[&str]) -> Vec<String> {
        banks.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_read_slices_and_partitioner() {
        let file = NamedTempFile::new().unwrap();
        write_event_file(file.path(), "entry", &[bank("bank1", vec![7, 8, 9, 10, 11])]).unwrap();

        let mut loader =
            NXEventDataLoader::<f32>::open(file.path(), "entry", &names(&["bank1"]), 2).unwrap();
        let mut partitioner = loader.set_bank_index(0).unwrap();
        assert!(matches!(partitioner, AnyEventDataPartitioner::Floating(_)));
        assert_eq!(partitioner.num_workers(), 2);

        let mut ids = Vec::new();
        loader.read_event_id(&mut ids, 1, 3).unwrap();
        assert_eq!(ids, vec![8, 9, 10]);

        let mut tofs = Vec::new();
        loader.read_event_time_offset(&mut tofs, 1, 3).unwrap();
        assert_eq!(tofs, vec![1.0, 2.0, 3.0]);
        assert_eq!(
            loader.read_event_time_offset_unit().unwrap(),
            TimeUnit::Microsecond
        );

        let mut outputs = Vec::new();
        partitioner
            .partition(&mut outputs, &ids, &tofs, &nxevent_core::LoadRange::new(0, 1, 3))
            .unwrap();
        let pulse = outputs[0][0].pulse_time.nanoseconds();
        assert_eq!(pulse, 10_000_000_000);
    }

    #[test]
    fn test_read_past_end_fails() {
        let file = NamedTempFile::new().unwrap();
        write_event_file(file.path(), "entry", &[bank("bank1", vec![1, 2, 3])]).unwrap();
        let mut loader =
            NXEventDataLoader::<f32>::open(file.path(), "entry", &names(&["bank1"]), 1).unwrap();
        loader.set_bank_index(0).unwrap();

        let mut ids = Vec::new();
        let err = loader.read_event_id(&mut ids, 2, 2).unwrap_err();
        assert!(matches!(
            err,
            Error::CoreError(nxevent_core::Error::OutOfRange { .. })
        ));
        let err = loader.read_event_id(&mut ids, 4, 0).unwrap_err();
        assert!(matches!(
            err,
            Error::CoreError(nxevent_core::Error::OutOfRange { .. })
        ));
        loader.read_event_id(&mut ids, 3, 0).unwrap();
        assert!(ids.is_empty());
    }

    #[test]
    fn test_read_without_bank_fails() {
        let file = NamedTempFile::new().unwrap();
        write_event_file(file.path(), "entry", &[bank("bank1", vec![1])]).unwrap();
        let loader =
            NXEventDataLoader::<f32>::open(file.path(), "entry", &names(&["bank1"]), 1).unwrap();
        let mut ids = Vec::new();
        assert!(loader.read_event_id(&mut ids, 0, 1).is_err());
    }

    #[test]
    fn test_unsupported_time_zero_type() {
        let file = NamedTempFile::new().unwrap();
        let mut bad = bank("bank1", vec![1]);
        bad.event_time_zero = Column::U8(vec![0, 1, 2, 3]);
        write_event_file(file.path(), "entry", &[bad]).unwrap();
        let mut loader =
            NXEventDataLoader::<f32>::open(file.path(), "entry", &names(&["bank1"]), 1).unwrap();
        let err = loader.set_bank_index(0).err().unwrap();
        assert!(matches!(
            err,
            Error::CoreError(nxevent_core::Error::UnsupportedDataType { .. })
        ));
    }

    #[test]
    fn test_integral_time_zero_rejects_seconds() {
        let file = NamedTempFile::new().unwrap();
        let mut bad = bank("bank1", vec![1]);
        bad.event_time_zero = Column::I64(vec![0, 1, 2, 3]);
        write_event_file(file.path(), "entry", &[bad]).unwrap();
        let mut loader =
            NXEventDataLoader::<f32>::open(file.path(), "entry", &names(&["bank1"]), 1).unwrap();
        let err = loader.set_bank_index(0).err().unwrap();
        assert!(matches!(
            err,
            Error::CoreError(nxevent_core::Error::UnsupportedTimeUnit { .. })
        ));
    }

    #[test]
    fn test_narrow_pulse_tables_dispatch() {
        let cases = [
            (Column::U32(vec![0, 2, 2, 3]), Column::I32(vec![0, 5, 10, 15])),
            (Column::I32(vec![0, 2, 2, 3]), Column::U32(vec![0, 5, 10, 15])),
            (Column::I64(vec![0, 2, 2, 3]), Column::U64(vec![0, 5, 10, 15])),
        ];
        for (event_index, event_time_zero) in cases {
            let file = NamedTempFile::new().unwrap();
            let mut narrow = bank("bank1", vec![1, 2, 3]);
            narrow.event_index = event_index;
            narrow.event_time_zero = event_time_zero;
            narrow.event_time_zero_unit = "nanosecond".to_string();
            write_event_file(file.path(), "entry", &[narrow.clone()]).unwrap();

            let mut loader =
                NXEventDataLoader::<f32>::open(file.path(), "entry", &names(&["bank1"]), 1)
                    .unwrap();
            let partitioner = loader.set_bank_index(0).unwrap();
            assert!(matches!(partitioner, AnyEventDataPartitioner::Integral(_)));

            let mut outputs = Vec::new();
            partitioner
                .partition(
                    &mut outputs,
                    &[1, 2, 3],
                    &[0.0_f32, 1.0, 2.0],
                    &nxevent_core::LoadRange::new(0, 0, 3),
                )
                .unwrap();
            let pulses: Vec<i64> =
                outputs[0].iter().map(|event| event.pulse_time.nanoseconds()).collect();
            let base = 10_000_000_000;
            assert_eq!(pulses, vec![base, base, base + 10], "{:?}", narrow.event_index);

            drop(loader);
            narrow.event_time_zero_unit = "microsecond".to_string();
            write_event_file(file.path(), "entry", &[narrow]).unwrap();
            let mut loader =
                NXEventDataLoader::<f32>::open(file.path(), "entry", &names(&["bank1"]), 1)
                    .unwrap();
            assert!(matches!(
                loader.set_bank_index(0).err().unwrap(),
                Error::CoreError(nxevent_core::Error::UnsupportedTimeUnit { .. })
            ));
        }
    }

    #[test]
    fn test_prescan_helpers() {
        let file = NamedTempFile::new().unwrap();
        write_event_file(
            file.path(),
            "entry",
            &[
                bank("bank1", vec![5, 6]),
                bank("bank2", vec![]),
                bank("bank3", vec![40, 41, 42]),
            ],
        )
        .unwrap();
        let banks = names(&["bank1", "bank2", "bank3"]);

        assert_eq!(bank_sizes(file.path(), "entry", &banks).unwrap(), vec![2, 0, 3]);
        let map = make_any_event_id_to_bank_map(file.path(), "entry", &banks).unwrap();
        assert_eq!(map.into_iter().collect::<Vec<_>>(), vec![(5, 0), (40, 2)]);
        assert_eq!(
            event_time_offset_kind(file.path(), "entry", &banks).unwrap(),
            NumericKind::F32
        );
        let mut listed = list_banks(file.path(), "entry").unwrap();
        listed.sort();
        assert_eq!(listed, banks);

        let summary = summarize_banks(file.path(), "entry", &banks).unwrap();
        assert_eq!(summary[2].events, 3);
        assert_eq!(summary[0].event_index_kind, NumericKind::U64);
    }
}
