//! Memory View Module
//!
//! One mapped region with its own allocation table. Everything a view does
//! happens under its own mutex, so compacting one view never blocks another.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::path::Path;

use memmap2::{MmapMut, MmapOptions};
use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use serde::Serialize;

use super::ObjectPointer;
use crate::error::{CacheError, Result};

/// Allocations are rounded up to this many bytes.
pub const AREA_ALIGN: usize = 8;

#[derive(Debug, Clone, Copy)]
struct Area {
    serial: u64,
    offset: usize,
    len: usize,
    capacity: usize,
}

struct ViewInner {
    map: MmapMut,
    epoch: u64,
    next_serial: u64,
    areas: Vec<Option<Area>>,
    free_areas: Vec<u32>,
    /// Free extents, offset -> length, coalesced
    free: BTreeMap<usize, usize>,
    used: usize,
}

/// Occupancy of a single view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ViewStats {
    pub view: u32,
    pub epoch: u64,
    pub capacity: usize,
    pub used: usize,
    pub live_areas: usize,
    /// Largest contiguous free extent
    pub largest_free: usize,
}

// == Mem View ==
pub struct MemView {
    id: u32,
    capacity: usize,
    inner: Mutex<ViewInner>,
}

impl MemView {
    /// Maps an anonymous region of `capacity` bytes.
    pub fn anonymous(id: u32, capacity: usize) -> Result<Self> {
        let map = MmapMut::map_anon(capacity)?;
        Ok(Self::from_map(id, map))
    }

    /// Maps `capacity` bytes of the file at `path`, creating or resizing it.
    pub fn file_backed(id: u32, capacity: usize, path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        file.set_len(capacity as u64)?;

        // Safety: the file is owned by this view for its whole lifetime and
        // is not resized while mapped.
        let map = unsafe { MmapOptions::new().len(capacity).map_mut(&file)? };
        Ok(Self::from_map(id, map))
    }

    fn from_map(id: u32, map: MmapMut) -> Self {
        let capacity = map.len();
        let mut free = BTreeMap::new();
        if capacity > 0 {
            free.insert(0, capacity);
        }
        Self {
            id,
            capacity,
            inner: Mutex::new(ViewInner {
                map,
                epoch: 0,
                next_serial: 0,
                areas: Vec::new(),
                free_areas: Vec::new(),
                free,
                used: 0,
            }),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    // == Allocate ==
    /// Reserves room for `len` bytes with first-fit placement.
    ///
    /// Returns `None` if no free extent is large enough.
    pub fn allocate(&self, len: usize) -> Option<ObjectPointer> {
        let mut inner = self.inner.lock();
        self.reserve(&mut inner, len)
    }

    /// Allocates an area and copies `bytes` into it under one lock, so no
    /// compaction can slip between the two.
    pub fn store(&self, bytes: &[u8]) -> Option<ObjectPointer> {
        let mut inner = self.inner.lock();
        let ptr = self.reserve(&mut inner, bytes.len())?;
        inner.map[ptr.offset..ptr.offset + ptr.len].copy_from_slice(bytes);
        Some(ptr)
    }

    fn reserve(&self, inner: &mut ViewInner, len: usize) -> Option<ObjectPointer> {
        let capacity = len.max(1).div_ceil(AREA_ALIGN) * AREA_ALIGN;

        let (offset, extent) = inner
            .free
            .iter()
            .find(|(_, extent)| **extent >= capacity)
            .map(|(&offset, &extent)| (offset, extent))?;
        inner.free.remove(&offset);
        if extent > capacity {
            inner.free.insert(offset + capacity, extent - capacity);
        }

        let serial = inner.next_serial;
        inner.next_serial += 1;
        let area = Area {
            serial,
            offset,
            len,
            capacity,
        };
        let index = match inner.free_areas.pop() {
            Some(index) => {
                inner.areas[index as usize] = Some(area);
                index
            }
            None => {
                inner.areas.push(Some(area));
                (inner.areas.len() - 1) as u32
            }
        };
        inner.used += capacity;

        Some(ObjectPointer {
            view: self.id,
            area: index,
            serial,
            epoch: inner.epoch,
            offset,
            len,
        })
    }

    fn live_area(inner: &ViewInner, ptr: &ObjectPointer) -> Option<Area> {
        inner
            .areas
            .get(ptr.area as usize)
            .copied()
            .flatten()
            .filter(|area| area.serial == ptr.serial)
    }

    fn check(inner: &ViewInner, ptr: &ObjectPointer) -> Result<Area> {
        match Self::live_area(inner, ptr) {
            Some(area) if ptr.epoch == inner.epoch && area.offset == ptr.offset => Ok(area),
            _ => Err(CacheError::StalePointer(*ptr)),
        }
    }

    // == Resolve ==
    /// Borrows the payload bytes. The view stays locked while the span is
    /// held.
    ///
    /// # Errors
    /// `StalePointer` if the area was released or the view compacted since
    /// the pointer was issued.
    pub fn resolve(&self, ptr: &ObjectPointer) -> Result<MappedMutexGuard<'_, [u8]>> {
        let inner = self.inner.lock();
        let area = Self::check(&inner, ptr)?;
        Ok(MutexGuard::map(inner, |inner| {
            &mut inner.map[area.offset..area.offset + area.len]
        }))
    }

    // == Release ==
    pub fn release(&self, ptr: &ObjectPointer) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::free_area(&mut inner, ptr)
    }

    fn free_area(inner: &mut ViewInner, ptr: &ObjectPointer) -> Result<()> {
        let area = Self::check(inner, ptr)?;

        inner.areas[ptr.area as usize] = None;
        inner.free_areas.push(ptr.area);
        inner.used -= area.capacity;
        Self::free_extent(&mut inner.free, area.offset, area.capacity);
        Ok(())
    }

    fn free_extent(free: &mut BTreeMap<usize, usize>, offset: usize, len: usize) {
        let mut start = offset;
        let mut len = len;

        // merge with the extent just before
        if let Some((&prev, &prev_len)) = free.range(..offset).next_back() {
            if prev + prev_len == offset {
                free.remove(&prev);
                start = prev;
                len += prev_len;
            }
        }
        // and the one just after
        if let Some(next_len) = free.remove(&(start + len)) {
            len += next_len;
        }
        free.insert(start, len);
    }

    // == Refresh ==
    /// Re-issues a pointer for the current epoch if its area is still live.
    pub fn refresh(&self, ptr: &ObjectPointer) -> Result<ObjectPointer> {
        let inner = self.inner.lock();
        Self::reissue(&inner, ptr)
    }

    fn reissue(inner: &ViewInner, ptr: &ObjectPointer) -> Result<ObjectPointer> {
        let area = Self::live_area(inner, ptr).ok_or(CacheError::StalePointer(*ptr))?;
        Ok(ObjectPointer {
            epoch: inner.epoch,
            offset: area.offset,
            ..*ptr
        })
    }

    /// Refreshes `ptr` and copies the payload out under one lock. Returns
    /// the current pointer with the bytes.
    ///
    /// # Errors
    /// `StalePointer` only if the area itself was released.
    pub fn read_refreshed(&self, ptr: &ObjectPointer) -> Result<(ObjectPointer, Vec<u8>)> {
        let inner = self.inner.lock();
        let current = Self::reissue(&inner, ptr)?;
        let bytes = inner.map[current.offset..current.offset + current.len].to_vec();
        Ok((current, bytes))
    }

    /// Releases the area behind `ptr` even if a compaction moved it since.
    pub fn release_refreshed(&self, ptr: &ObjectPointer) -> Result<()> {
        let mut inner = self.inner.lock();
        let current = Self::reissue(&inner, ptr)?;
        Self::free_area(&mut inner, &current)
    }

    // == Compact ==
    /// Slides every live area down to the start of the view, leaving one
    /// free extent at the end. Bumps the epoch if anything moved and returns
    /// the number of relocated areas.
    pub fn compact(&self) -> usize {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;

        let mut live: Vec<(usize, u64, usize, usize)> = inner
            .areas
            .iter()
            .enumerate()
            .filter_map(|(i, a)| a.map(|a| (a.offset, a.serial, i, a.capacity)))
            .collect();
        live.sort_unstable();

        let mut cursor = 0;
        let mut relocated = 0;
        for (offset, _, index, capacity) in live {
            if offset != cursor {
                inner.map.copy_within(offset..offset + capacity, cursor);
                if let Some(area) = inner.areas[index].as_mut() {
                    area.offset = cursor;
                }
                relocated += 1;
            }
            cursor += capacity;
        }

        inner.free.clear();
        if cursor < self.capacity {
            inner.free.insert(cursor, self.capacity - cursor);
        }
        if relocated > 0 {
            inner.epoch += 1;
        }
        relocated
    }

    pub fn stats(&self) -> ViewStats {
        let inner = self.inner.lock();
        ViewStats {
            view: self.id,
            epoch: inner.epoch,
            capacity: self.capacity,
            used: inner.used,
            live_areas: inner.areas.iter().filter(|a| a.is_some()).count(),
            largest_free: inner.free.values().copied().max().unwrap_or(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_rounds_to_alignment() {
        let view = MemView::anonymous(0, 64).unwrap();
        let a = view.allocate(3).unwrap();
        let b = view.allocate(3).unwrap();
        assert_eq!(a.offset(), 0);
        assert_eq!(b.offset(), AREA_ALIGN);
        assert_eq!(view.stats().used, 2 * AREA_ALIGN);
    }

    #[test]
    fn test_allocate_fails_when_full() {
        let view = MemView::anonymous(0, 16).unwrap();
        assert!(view.allocate(16).is_some());
        assert!(view.allocate(1).is_none());
    }

    #[test]
    fn test_release_coalesces() {
        let view = MemView::anonymous(0, 32).unwrap();
        let a = view.allocate(8).unwrap();
        let b = view.allocate(8).unwrap();
        let c = view.allocate(8).unwrap();
        view.release(&a).unwrap();
        view.release(&c).unwrap();
        view.release(&b).unwrap();
        assert_eq!(view.stats().largest_free, 32);
    }

    #[test]
    fn test_released_area_is_stale_even_if_reused() {
        let view = MemView::anonymous(0, 32).unwrap();
        let a = view.allocate(8).unwrap();
        view.release(&a).unwrap();
        let b = view.allocate(8).unwrap();
        assert_eq!(a.area(), b.area());
        assert!(matches!(view.resolve(&a), Err(CacheError::StalePointer(_))));
        assert!(view.resolve(&b).is_ok());
    }

    #[test]
    fn test_compact_moves_and_invalidates() {
        let view = MemView::anonymous(0, 64).unwrap();
        let a = view.allocate(8).unwrap();
        let b = view.allocate(8).unwrap();
        view.resolve(&b).unwrap().copy_from_slice(b"survivor");
        view.release(&a).unwrap();

        assert_eq!(view.compact(), 1);
        assert!(matches!(view.resolve(&b), Err(CacheError::StalePointer(_))));

        let moved = view.refresh(&b).unwrap();
        assert_eq!(moved.offset(), 0);
        assert_eq!(&*view.resolve(&moved).unwrap(), b"survivor");
    }

    #[test]
    fn test_store_copies_in_place() {
        let view = MemView::anonymous(0, 16).unwrap();
        let ptr = view.store(b"payload").unwrap();
        assert_eq!(ptr.len(), 7);
        assert_eq!(&*view.resolve(&ptr).unwrap(), b"payload");
        assert!(view.store(&[0u8; 9]).is_none());
    }

    #[test]
    fn test_stale_pointer_still_reads_and_releases() {
        let view = MemView::anonymous(0, 64).unwrap();
        let gap = view.store(b"gap").unwrap();
        let kept = view.store(b"kept").unwrap();
        let freed = view.store(b"freed").unwrap();
        view.release(&gap).unwrap();
        assert_eq!(view.compact(), 2);

        let (current, bytes) = view.read_refreshed(&kept).unwrap();
        assert_eq!(bytes, b"kept");
        assert_eq!(current.offset(), 0);

        view.release_refreshed(&freed).unwrap();
        assert_eq!(view.stats().live_areas, 1);
        assert!(matches!(
            view.read_refreshed(&freed),
            Err(CacheError::StalePointer(_))
        ));
    }

    #[test]
    fn test_compact_without_moves_keeps_epoch() {
        let view = MemView::anonymous(0, 64).unwrap();
        let a = view.allocate(8).unwrap();
        assert_eq!(view.compact(), 0);
        assert!(view.resolve(&a).is_ok());
    }

    #[test]
    fn test_file_backed_view() {
        let dir = tempfile::tempdir().unwrap();
        let view = MemView::file_backed(0, 4096, &dir.path().join("view-0.bin")).unwrap();
        let ptr = view.allocate(5).unwrap();
        view.resolve(&ptr).unwrap().copy_from_slice(b"hello");
        assert_eq!(&*view.resolve(&ptr).unwrap(), b"hello");
        assert_eq!(view.capacity(), 4096);
    }
}
