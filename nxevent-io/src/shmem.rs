//! Per-pixel event lists in named shared-memory segments.
//!
//! A segment is a file under a shared-memory directory (`/dev/shm` on
//! Linux) mapped into every process that uses it:
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ SegmentHeader                                │
//! │  magic, version, storage name (64 bytes),    │
//! │  num_chunks, num_pixels,                     │
//! │  arena capacity / used (in events)           │
//! ├──────────────────────────────────────────────┤
//! │ ListSlot[num_chunks * num_pixels]            │
//! │  {offset, len, capacity} into the arena      │
//! ├──────────────────────────────────────────────┤
//! │ TofEvent arena (bump allocated)              │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! Fields are fixed width and native-endian; segments never leave the host
//! that created them. Lists do not shrink and relocated blocks are
//! not reused, so writers should [`reserve`] before appending.
//!
//! [`reserve`]: EventsListsShmemStorage::reserve

use crate::{Error, Result};
use bytemuck::{Pod, PodCastError, Zeroable};
use memmap2::{Mmap, MmapMut};
use nxevent_core::TofEvent;
use std::fs::{File, OpenOptions};
use std::ops::Range;
use std::path::{Path, PathBuf};

const MAGIC: u64 = u64::from_le_bytes(*b"NXEVSHM\0");
const LAYOUT_VERSION: u64 = 1;
const NAME_LEN: usize = 64;
const MIN_GROWTH: usize = 4;

const HEADER_SIZE: usize = std::mem::size_of::<SegmentHeader>();
const SLOT_SIZE: usize = std::mem::size_of::<ListSlot>();
const EVENT_SIZE: usize = std::mem::size_of::<TofEvent>();

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct SegmentHeader {
    magic: u64,
    version: u64,
    storage_name: [u8; NAME_LEN],
    num_chunks: u64,
    num_pixels: u64,
    arena_capacity: u64,
    arena_used: u64,
}

/// Position of one list in the arena, in events.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
struct ListSlot {
    offset: u64,
    len: u64,
    capacity: u64,
}

impl ListSlot {
    fn offset(self) -> usize {
        widen(self.offset)
    }

    fn len(self) -> usize {
        widen(self.len)
    }

    fn capacity(self) -> usize {
        widen(self.capacity)
    }

    fn events(self) -> Range<usize> {
        self.offset()..self.offset() + self.len()
    }
}

// Stored counts are checked against the mapping on attach, so they fit.
#[allow(clippy::cast_possible_truncation)]
const fn widen(value: u64) -> usize {
    value as usize
}

const fn narrow(value: usize) -> u64 {
    value as u64
}

fn stored_count(value: u64, what: &str) -> Result<usize> {
    usize::try_from(value)
        .map_err(|_| Error::SharedMemory(format!("{what} {value} does not fit this host")))
}

fn layout_error(e: PodCastError) -> Error {
    Error::SharedMemory(format!("misaligned or truncated segment: {e}"))
}

/// Dimensions and byte offsets of a segment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SegmentLayout {
    pub num_chunks: usize,
    pub num_pixels: usize,
    /// Arena size in events.
    pub arena_capacity: usize,
}

impl SegmentLayout {
    /// Largest layout for `num_chunks × num_pixels` lists within `byte_budget`.
    ///
    /// # Errors
    /// Returns an error if the list table alone does not fit the budget.
    pub fn for_budget(num_chunks: usize, num_pixels: usize, byte_budget: usize) -> Result<Self> {
        let table_end = Self::arena_offset_for(num_chunks, num_pixels)?;
        let arena_bytes = byte_budget.checked_sub(table_end).ok_or_else(|| {
            Error::SharedMemory(format!(
                "budget of {byte_budget} bytes cannot hold the list table of {table_end} bytes"
            ))
        })?;
        Ok(Self {
            num_chunks,
            num_pixels,
            arena_capacity: arena_bytes / EVENT_SIZE,
        })
    }

    /// Bytes needed to hold `events` events in `num_chunks × num_pixels` lists.
    ///
    /// # Errors
    /// Returns an error on arithmetic overflow.
    pub fn required_bytes(num_chunks: usize, num_pixels: usize, events: usize) -> Result<usize> {
        let table_end = Self::arena_offset_for(num_chunks, num_pixels)?;
        events
            .checked_mul(EVENT_SIZE)
            .and_then(|bytes| bytes.checked_add(table_end))
            .ok_or_else(|| Error::SharedMemory("segment size overflows".to_string()))
    }

    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.num_chunks * self.num_pixels
    }

    fn arena_offset(&self) -> usize {
        HEADER_SIZE + (self.slot_count() * SLOT_SIZE).next_multiple_of(EVENT_SIZE)
    }

    fn arena_offset_for(num_chunks: usize, num_pixels: usize) -> Result<usize> {
        num_chunks
            .checked_mul(num_pixels)
            .and_then(|slots| slots.checked_mul(SLOT_SIZE))
            .map(|bytes| HEADER_SIZE + bytes.next_multiple_of(EVENT_SIZE))
            .ok_or_else(|| Error::SharedMemory("list table size overflows".to_string()))
    }

    /// Total mapped size in bytes.
    #[must_use]
    pub fn total_size(&self) -> usize {
        self.arena_offset() + self.arena_capacity * EVENT_SIZE
    }
}

/// Default directory for shared-memory segments on this platform.
#[must_use]
pub fn default_shm_dir() -> PathBuf {
    let dev_shm = Path::new("/dev/shm");
    if cfg!(target_os = "linux") && dev_shm.is_dir() {
        dev_shm.to_path_buf()
    } else {
        std::env::temp_dir()
    }
}

/// Removes a segment; a segment that does not exist is not an error.
///
/// # Errors
/// Returns any other I/O error.
pub fn remove_segment(shm_dir: &Path, segment_name: &str) -> Result<()> {
    match std::fs::remove_file(shm_dir.join(segment_name)) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

enum Mapping {
    ReadOnly(Mmap),
    ReadWrite(MmapMut),
}

impl Mapping {
    fn bytes(&self) -> &[u8] {
        match self {
            Self::ReadOnly(map) => &map[..],
            Self::ReadWrite(map) => &map[..],
        }
    }

    fn bytes_mut(&mut self) -> Result<&mut [u8]> {
        match self {
            Self::ReadOnly(_) => Err(Error::SharedMemory(
                "segment is attached read-only".to_string(),
            )),
            Self::ReadWrite(map) => Ok(&mut map[..]),
        }
    }
}

struct Parts<'a> {
    header: &'a SegmentHeader,
    slots: &'a [ListSlot],
    arena: &'a [TofEvent],
}

struct PartsMut<'a> {
    header: &'a mut SegmentHeader,
    slots: &'a mut [ListSlot],
    arena: &'a mut [TofEvent],
}

/// Attached view of the `chunks × pixels` event lists of one segment.
pub struct EventsListsShmemManager {
    segment_name: String,
    path: PathBuf,
    layout: SegmentLayout,
    mapping: Mapping,
}

impl EventsListsShmemManager {
    /// Attaches read-write to segment `segment_name` holding the lists of
    /// storage `storage_name`.
    ///
    /// # Errors
    /// Returns an error if the segment does not exist or does not hold a
    /// valid structure with that name.
    pub fn attach(shm_dir: &Path, segment_name: &str, storage_name: &str) -> Result<Self> {
        let path = shm_dir.join(segment_name);
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        // SAFETY: segments are written only by the process holding the
        // storage; attachers agree not to truncate the file while mapped.
        #[allow(unsafe_code)]
        let map = unsafe { MmapMut::map_mut(&file)? };
        Self::validated(segment_name, path, Mapping::ReadWrite(map), storage_name)
    }

    /// Attaches read-only, as the parent does during reassembly.
    ///
    /// # Errors
    /// Same as [`attach`](Self::attach).
    pub fn attach_read_only(
        shm_dir: &Path,
        segment_name: &str,
        storage_name: &str,
    ) -> Result<Self> {
        let path = shm_dir.join(segment_name);
        let file = File::open(&path)?;
        // SAFETY: the writer has exited before read-only attachment, so the
        // mapping is not modified while we read it.
        #[allow(unsafe_code)]
        let map = unsafe { Mmap::map(&file)? };
        Self::validated(segment_name, path, Mapping::ReadOnly(map), storage_name)
    }

    fn validated(
        segment_name: &str,
        path: PathBuf,
        mapping: Mapping,
        storage_name: &str,
    ) -> Result<Self> {
        let bytes = mapping.bytes();
        if bytes.len() < HEADER_SIZE {
            return Err(Error::SharedMemory(format!(
                "segment {segment_name} is too small for a header"
            )));
        }
        let header = *bytemuck::try_from_bytes::<SegmentHeader>(&bytes[..HEADER_SIZE])
            .map_err(layout_error)?;
        if header.magic != MAGIC || header.version != LAYOUT_VERSION {
            return Err(Error::SharedMemory(format!(
                "segment {segment_name} has no event list structure"
            )));
        }
        if header.storage_name != encode_name(storage_name)? {
            return Err(Error::SharedMemory(format!(
                "structure {storage_name} not found in segment {segment_name}"
            )));
        }
        let layout = SegmentLayout {
            num_chunks: stored_count(header.num_chunks, "chunk count")?,
            num_pixels: stored_count(header.num_pixels, "pixel count")?,
            arena_capacity: stored_count(header.arena_capacity, "arena capacity")?,
        };
        let required = SegmentLayout::required_bytes(
            layout.num_chunks,
            layout.num_pixels,
            layout.arena_capacity,
        )?;
        if required > bytes.len() || header.arena_used > header.arena_capacity {
            return Err(Error::SharedMemory(format!(
                "segment {segment_name} is smaller than its declared layout"
            )));
        }

        let manager = Self {
            segment_name: segment_name.to_string(),
            path,
            layout,
            mapping,
        };
        let parts = manager.parts()?;
        for slot in parts.slots {
            let fits = slot
                .offset
                .checked_add(slot.capacity)
                .is_some_and(|end| end <= parts.header.arena_used);
            if slot.len > slot.capacity || !fits {
                return Err(Error::SharedMemory(format!(
                    "segment {segment_name} has a corrupt list slot {slot:?}"
                )));
            }
        }
        Ok(manager)
    }

    #[must_use]
    pub fn segment_name(&self) -> &str {
        &self.segment_name
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn layout(&self) -> SegmentLayout {
        self.layout
    }

    #[must_use]
    pub fn num_chunks(&self) -> usize {
        self.layout.num_chunks
    }

    #[must_use]
    pub fn num_pixels(&self) -> usize {
        self.layout.num_pixels
    }

    /// Events of arena space handed out so far.
    ///
    /// # Errors
    /// Returns an error if the mapping cannot be viewed.
    pub fn arena_used(&self) -> Result<usize> {
        Ok(widen(self.parts()?.header.arena_used))
    }

    /// The events of list `(chunk, pixel)`.
    ///
    /// # Errors
    /// Returns an out-of-range error for indices outside the structure.
    pub fn event_list(&self, chunk: usize, pixel: usize) -> Result<&[TofEvent]> {
        let slot_index = self.slot_index(chunk, pixel)?;
        let parts = self.parts()?;
        Ok(&parts.arena[parts.slots[slot_index].events()])
    }

    /// Total number of events over all lists.
    ///
    /// # Errors
    /// Returns an error if the mapping cannot be viewed.
    pub fn total_events(&self) -> Result<usize> {
        Ok(self.parts()?.slots.iter().map(|slot| slot.len()).sum())
    }

    /// Appends one event to list `(chunk, pixel)`.
    ///
    /// # Errors
    /// Returns an out-of-range error for indices outside the structure, or a
    /// shared-memory error if the arena is exhausted or the segment is
    /// attached read-only.
    pub fn append_event(&mut self, chunk: usize, pixel: usize, event: TofEvent) -> Result<()> {
        self.append_events(chunk, pixel, std::slice::from_ref(&event))
    }

    /// Appends `events` to list `(chunk, pixel)`.
    ///
    /// # Errors
    /// Same as [`append_event`](Self::append_event).
    pub fn append_events(&mut self, chunk: usize, pixel: usize, events: &[TofEvent]) -> Result<()> {
        let slot_index = self.slot_index(chunk, pixel)?;
        let mut parts = self.parts_mut()?;
        let slot = parts.slots[slot_index];
        let needed = slot.len() + events.len();
        if needed > slot.capacity() {
            let grown = needed.max(slot.capacity() * 2).max(MIN_GROWTH);
            parts.relocate(slot_index, grown)?;
        }
        let slot = &mut parts.slots[slot_index];
        let start = slot.offset() + slot.len();
        parts.arena[start..start + events.len()].copy_from_slice(events);
        slot.len = narrow(needed);
        Ok(())
    }

    /// Writers over the reserved space of every pixel list of `chunk`,
    /// indexed by pixel; they can be filled from different threads.
    ///
    /// # Errors
    /// Returns an error if `chunk` is out of range or slots overlap.
    pub fn reserved_lists_mut(&mut self, chunk: usize) -> Result<Vec<ReservedList<'_>>> {
        nxevent_core::error::check_range("chunk index", chunk, 1, self.layout.num_chunks)?;
        let num_pixels = self.layout.num_pixels;
        let first = chunk * num_pixels;
        let segment = self.segment_name.clone();
        let PartsMut { slots, arena, .. } = self.parts_mut()?;
        let slots = &mut slots[first..first + num_pixels];

        let mut order: Vec<usize> = (0..num_pixels).collect();
        order.sort_by_key(|&pixel| slots[pixel].offset);
        let mut regions: Vec<&mut [TofEvent]> = std::iter::repeat_with(<&mut [TofEvent]>::default)
            .take(num_pixels)
            .collect();
        let mut rest: &mut [TofEvent] = arena;
        let mut base = 0;
        for pixel in order {
            let slot = slots[pixel];
            if slot.capacity == 0 {
                continue;
            }
            let overlap =
                || Error::SharedMemory(format!("overlapping lists in segment {segment}"));
            let skip = slot.offset().checked_sub(base).ok_or_else(overlap)?;
            if skip + slot.capacity() > rest.len() {
                return Err(overlap());
            }
            let (_, tail) = std::mem::take(&mut rest).split_at_mut(skip);
            let (region, tail) = tail.split_at_mut(slot.capacity());
            regions[pixel] = region;
            rest = tail;
            base = slot.offset() + slot.capacity();
        }
        Ok(slots
            .iter_mut()
            .zip(regions)
            .map(|(slot, events)| ReservedList { slot, events })
            .collect())
    }

    /// Unmaps and deletes the segment.
    ///
    /// # Errors
    /// Returns an I/O error if the file cannot be removed.
    pub fn destroy(self) -> Result<()> {
        let Self { path, mapping, .. } = self;
        drop(mapping);
        match std::fs::remove_file(&path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    fn slot_index(&self, chunk: usize, pixel: usize) -> Result<usize> {
        nxevent_core::error::check_range("chunk index", chunk, 1, self.layout.num_chunks)?;
        nxevent_core::error::check_range("pixel index", pixel, 1, self.layout.num_pixels)?;
        Ok(chunk * self.layout.num_pixels + pixel)
    }

    fn table_bytes(&self) -> usize {
        self.layout.slot_count() * SLOT_SIZE
    }

    fn arena_bytes(&self) -> usize {
        self.layout.arena_capacity * EVENT_SIZE
    }

    fn parts(&self) -> Result<Parts<'_>> {
        let slots_end = HEADER_SIZE + self.table_bytes();
        let arena_start = self.layout.arena_offset();
        let arena_end = arena_start + self.arena_bytes();
        let bytes = self.mapping.bytes();
        Ok(Parts {
            header: bytemuck::try_from_bytes(&bytes[..HEADER_SIZE]).map_err(layout_error)?,
            slots: bytemuck::try_cast_slice(&bytes[HEADER_SIZE..slots_end])
                .map_err(layout_error)?,
            arena: bytemuck::try_cast_slice(&bytes[arena_start..arena_end])
                .map_err(layout_error)?,
        })
    }

    fn parts_mut(&mut self) -> Result<PartsMut<'_>> {
        let table_bytes = self.table_bytes();
        let arena_bytes = self.arena_bytes();
        let arena_start = self.layout.arena_offset();
        let bytes = self.mapping.bytes_mut()?;
        let (header, rest) = bytes.split_at_mut(HEADER_SIZE);
        let (slots, rest) = rest.split_at_mut(arena_start - HEADER_SIZE);
        Ok(PartsMut {
            header: bytemuck::try_from_bytes_mut(header).map_err(layout_error)?,
            slots: bytemuck::try_cast_slice_mut(&mut slots[..table_bytes])
                .map_err(layout_error)?,
            arena: bytemuck::try_cast_slice_mut(&mut rest[..arena_bytes])
                .map_err(layout_error)?,
        })
    }
}

impl PartsMut<'_> {
    /// Moves list `slot_index` to a fresh block of `capacity` events.
    fn relocate(&mut self, slot_index: usize, capacity: usize) -> Result<()> {
        let used = widen(self.header.arena_used);
        let available = widen(self.header.arena_capacity);
        let end = used
            .checked_add(capacity)
            .filter(|&end| end <= available)
            .ok_or_else(|| {
                Error::SharedMemory(format!(
                    "arena exhausted: {used} of {available} events used, {capacity} requested"
                ))
            })?;
        let slot = &mut self.slots[slot_index];
        self.arena.copy_within(slot.events(), used);
        slot.offset = narrow(used);
        slot.capacity = narrow(capacity);
        self.header.arena_used = narrow(end);
        Ok(())
    }
}

/// Exclusive access to the reserved space of one list.
pub struct ReservedList<'a> {
    slot: &'a mut ListSlot,
    events: &'a mut [TofEvent],
}

impl ReservedList<'_> {
    #[must_use]
    pub fn len(&self) -> usize {
        self.slot.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slot.len == 0
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slot.capacity()
    }

    /// Appends within the reserved capacity.
    ///
    /// # Errors
    /// Returns a shared-memory error if `events` does not fit.
    pub fn extend_from_slice(&mut self, events: &[TofEvent]) -> Result<()> {
        let start = self.len();
        let end = start + events.len();
        if end > self.capacity() {
            return Err(Error::SharedMemory(format!(
                "{end} events exceed reserved capacity {}",
                self.capacity()
            )));
        }
        self.events[start..end].copy_from_slice(events);
        self.slot.len = narrow(end);
        Ok(())
    }
}

/// Owner of a newly created segment.
///
/// The segment outlives this value; the process that consumes it deletes it
/// with [`EventsListsShmemManager::destroy`] or [`remove_segment`].
pub struct EventsListsShmemStorage {
    manager: EventsListsShmemManager,
}

impl EventsListsShmemStorage {
    /// Creates segment `segment_name` of `byte_budget` bytes holding
    /// `num_chunks × num_pixels` empty lists named `storage_name`.
    ///
    /// The segment file is created world read-write so processes running
    /// under other user ids can attach.
    ///
    /// # Errors
    /// Returns an error if the segment already exists, the budget cannot
    /// hold the list table, or the name is too long.
    pub fn create(
        shm_dir: &Path,
        segment_name: &str,
        storage_name: &str,
        byte_budget: usize,
        num_chunks: usize,
        num_pixels: usize,
    ) -> Result<Self> {
        let layout = SegmentLayout::for_budget(num_chunks, num_pixels, byte_budget)?;
        let storage_name_bytes = encode_name(storage_name)?;
        let path = shm_dir.join(segment_name);

        let mut options = OpenOptions::new();
        options.read(true).write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o666);
        }
        let file = options.open(&path)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(std::fs::Permissions::from_mode(0o666))?;
        }
        file.set_len(layout.total_size() as u64)?;

        // SAFETY: the file was just created by this process and is not
        // resized while mapped.
        #[allow(unsafe_code)]
        let mut map = unsafe { MmapMut::map_mut(&file)? };
        let header = SegmentHeader {
            magic: MAGIC,
            version: LAYOUT_VERSION,
            storage_name: storage_name_bytes,
            num_chunks: narrow(num_chunks),
            num_pixels: narrow(num_pixels),
            arena_capacity: narrow(layout.arena_capacity),
            arena_used: 0,
        };
        map[..HEADER_SIZE].copy_from_slice(bytemuck::bytes_of(&header));
        log::debug!(
            "created segment {segment_name}: {num_chunks}x{num_pixels} lists, {} event arena",
            layout.arena_capacity
        );

        Ok(Self {
            manager: EventsListsShmemManager {
                segment_name: segment_name.to_string(),
                path,
                layout,
                mapping: Mapping::ReadWrite(map),
            },
        })
    }

    /// Ensures list `(chunk, pixel)` can hold `size` events without
    /// relocating.
    ///
    /// # Errors
    /// Returns an error for out-of-range indices or an exhausted arena.
    pub fn reserve(&mut self, chunk: usize, pixel: usize, size: usize) -> Result<()> {
        let slot_index = self.manager.slot_index(chunk, pixel)?;
        let mut parts = self.manager.parts_mut()?;
        if parts.slots[slot_index].capacity() >= size {
            return Ok(());
        }
        parts.relocate(slot_index, size)
    }

    #[must_use]
    pub fn manager(&self) -> &EventsListsShmemManager {
        &self.manager
    }

    pub fn manager_mut(&mut self) -> &mut EventsListsShmemManager {
        &mut self.manager
    }

    /// See [`EventsListsShmemManager::append_event`].
    ///
    /// # Errors
    /// Same as the manager method.
    pub fn append_event(&mut self, chunk: usize, pixel: usize, event: TofEvent) -> Result<()> {
        self.manager.append_event(chunk, pixel, event)
    }

    /// Flushes the mapping to its backing file.
    ///
    /// # Errors
    /// Returns an I/O error from the flush.
    pub fn flush(&self) -> Result<()> {
        if let Mapping::ReadWrite(map) = &self.manager.mapping {
            map.flush()?;
        }
        Ok(())
    }
}

fn encode_name(name: &str) -> Result<[u8; NAME_LEN]> {
    let bytes = name.as_bytes();
    if bytes.len() >= NAME_LEN {
        return Err(Error::SharedMemory(format!(
            "storage name {name} is longer than {} bytes",
            NAME_LEN - 1
        )));
    }
    let mut encoded = [0u8; NAME_LEN];
    encoded[..bytes.len()].copy_from_slice(bytes);
    Ok(encoded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nxevent_core::PulseTime;
    use tempfile::TempDir;

    fn event(tof: f64) -> TofEvent {
        TofEvent::new(tof, PulseTime::from_nanoseconds(7))
    }

    fn storage(dir: &TempDir, budget: usize) -> EventsListsShmemStorage {
        EventsListsShmemStorage::create(dir.path(), "seg0", "lists", budget, 2, 3).unwrap()
    }

    #[test]
    fn test_header_layout() {
        assert_eq!(HEADER_SIZE, 112);
        assert_eq!(HEADER_SIZE % EVENT_SIZE, 0);
        assert_eq!(SLOT_SIZE, 24);
        let layout = SegmentLayout::for_budget(2, 3, 10_000).unwrap();
        assert!(layout.total_size() <= 10_000);
        assert!(SegmentLayout::for_budget(1000, 1000, 100).is_err());
    }

    #[test]
    fn test_append_and_attach() {
        let dir = TempDir::new().unwrap();
        let mut storage = storage(&dir, 4096);
        storage.reserve(1, 2, 3).unwrap();
        storage.append_event(1, 2, event(1.0)).unwrap();
        storage.append_event(1, 2, event(2.0)).unwrap();
        storage.append_event(0, 0, event(3.0)).unwrap();
        storage.flush().unwrap();

        let manager =
            EventsListsShmemManager::attach_read_only(dir.path(), "seg0", "lists").unwrap();
        assert_eq!(manager.num_chunks(), 2);
        assert_eq!(manager.num_pixels(), 3);
        assert_eq!(manager.event_list(1, 2).unwrap(), &[event(1.0), event(2.0)]);
        assert_eq!(manager.event_list(0, 0).unwrap(), &[event(3.0)]);
        assert!(manager.event_list(0, 1).unwrap().is_empty());
        assert_eq!(manager.total_events().unwrap(), 3);
    }

    #[test]
    fn test_bounds_checked() {
        let dir = TempDir::new().unwrap();
        let mut storage = storage(&dir, 4096);
        assert!(matches!(
            storage.append_event(2, 0, event(1.0)),
            Err(Error::CoreError(nxevent_core::Error::OutOfRange { .. }))
        ));
        assert!(matches!(
            storage.append_event(0, 3, event(1.0)),
            Err(Error::CoreError(nxevent_core::Error::OutOfRange { .. }))
        ));
    }

    #[test]
    fn test_growth_relocates() {
        let dir = TempDir::new().unwrap();
        let mut storage = storage(&dir, 8192);
        for i in 0..10 {
            storage.append_event(0, 1, event(f64::from(i))).unwrap();
            storage.append_event(0, 2, event(f64::from(100 + i))).unwrap();
        }
        let manager = storage.manager();
        let tofs: Vec<f64> = manager.event_list(0, 1).unwrap().iter().map(|e| e.tof).collect();
        assert_eq!(tofs, (0..10).map(f64::from).collect::<Vec<_>>());
        assert_eq!(manager.event_list(0, 2).unwrap()[9], event(109.0));
    }

    #[test]
    fn test_reserve_avoids_relocation() {
        let dir = TempDir::new().unwrap();
        let mut storage = storage(&dir, 4096);
        storage.reserve(0, 0, 5).unwrap();
        let used = storage.manager().arena_used().unwrap();
        for i in 0..5 {
            storage.append_event(0, 0, event(f64::from(i))).unwrap();
        }
        assert_eq!(storage.manager().arena_used().unwrap(), used);
    }

    #[test]
    fn test_arena_exhausted() {
        let dir = TempDir::new().unwrap();
        let layout_bytes = SegmentLayout::required_bytes(2, 3, 4).unwrap();
        let mut storage = storage(&dir, layout_bytes);
        storage.reserve(0, 0, 4).unwrap();
        assert!(matches!(
            storage.reserve(0, 1, 1),
            Err(Error::SharedMemory(_))
        ));
    }

    #[test]
    fn test_attach_validates_name() {
        let dir = TempDir::new().unwrap();
        let _storage = storage(&dir, 4096);
        assert!(EventsListsShmemManager::attach(dir.path(), "seg0", "other").is_err());
        assert!(EventsListsShmemManager::attach(dir.path(), "missing", "lists").is_err());
        std::fs::write(dir.path().join("junk"), vec![0u8; 512]).unwrap();
        assert!(EventsListsShmemManager::attach(dir.path(), "junk", "lists").is_err());
    }

    #[test]
    fn test_truncated_segment_rejected() {
        let dir = TempDir::new().unwrap();
        drop(storage(&dir, 4096));
        let file = OpenOptions::new().write(true).open(dir.path().join("seg0")).unwrap();
        file.set_len((HEADER_SIZE + SLOT_SIZE) as u64).unwrap();
        drop(file);
        assert!(matches!(
            EventsListsShmemManager::attach_read_only(dir.path(), "seg0", "lists"),
            Err(Error::SharedMemory(_))
        ));
    }

    #[test]
    fn test_header_round_trips_through_bytes() {
        let dir = TempDir::new().unwrap();
        drop(storage(&dir, 4096));
        let bytes = std::fs::read(dir.path().join("seg0")).unwrap();
        let header: SegmentHeader = bytemuck::pod_read_unaligned(&bytes[..HEADER_SIZE]);
        assert_eq!(header.magic, MAGIC);
        assert_eq!((header.num_chunks, header.num_pixels), (2, 3));
        assert_eq!(header.arena_used, 0);
        assert_eq!(&header.storage_name[..6], b"lists\0");
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let dir = TempDir::new().unwrap();
        let _storage = storage(&dir, 4096);
        let mut manager =
            EventsListsShmemManager::attach_read_only(dir.path(), "seg0", "lists").unwrap();
        assert!(matches!(
            manager.append_event(0, 0, event(1.0)),
            Err(Error::SharedMemory(_))
        ));
    }

    #[test]
    fn test_reserved_lists_fill_in_parallel() {
        let dir = TempDir::new().unwrap();
        let mut storage = storage(&dir, 4096);
        storage.reserve(1, 2, 2).unwrap();
        storage.reserve(1, 0, 3).unwrap();
        let mut lists = storage.manager_mut().reserved_lists_mut(1).unwrap();
        assert_eq!(lists.len(), 3);
        assert_eq!(lists[1].capacity(), 0);
        std::thread::scope(|scope| {
            for (pixel, list) in lists.iter_mut().enumerate() {
                scope.spawn(move || {
                    #[allow(clippy::cast_precision_loss)]
                    let events = vec![event(pixel as f64); list.capacity()];
                    list.extend_from_slice(&events).unwrap();
                });
            }
        });
        assert!(lists[0].extend_from_slice(&[event(0.0)]).is_err());
        drop(lists);

        let manager = storage.manager();
        assert_eq!(manager.event_list(1, 0).unwrap(), &[event(0.0); 3]);
        assert_eq!(manager.event_list(1, 2).unwrap(), &[event(2.0); 2]);
    }

    #[cfg(unix)]
    #[test]
    fn test_segment_is_world_writable() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        let _storage = storage(&dir, 4096);
        let mode = std::fs::metadata(dir.path().join("seg0")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o666);
    }

    #[test]
    fn test_destroy_removes_file() {
        let dir = TempDir::new().unwrap();
        drop(storage(&dir, 4096));
        let manager =
            EventsListsShmemManager::attach_read_only(dir.path(), "seg0", "lists").unwrap();
        manager.destroy().unwrap();
        assert!(!dir.path().join("seg0").exists());
        remove_segment(dir.path(), "seg0").unwrap();
    }
}
