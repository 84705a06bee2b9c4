//! Backing Store Module
//!
//! A fixed set of mapped views addressed by [`ObjectPointer`].

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::MappedMutexGuard;
use serde::Serialize;
use tracing::{debug, info};

use super::view::{MemView, ViewStats};
use super::ObjectPointer;
use crate::config::ArenaConfig;
use crate::error::{CacheError, Result};

/// Outcome of a compaction pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CompactionReport {
    /// Views in which at least one area moved
    pub views_compacted: usize,
    /// Total areas moved
    pub relocated: usize,
}

/// Aggregate occupancy across all views.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ArenaStats {
    pub capacity: usize,
    pub used: usize,
    pub live_areas: usize,
    pub views: Vec<ViewStats>,
}

// == Backing Store ==
pub struct BackingStore {
    views: Vec<MemView>,
    view_size: usize,
    cursor: AtomicUsize,
}

impl BackingStore {
    /// Maps the views described by `config`.
    ///
    /// With `config.path` set, view `n` is backed by `view-n.bin` in that
    /// directory; otherwise the views are anonymous mappings.
    pub fn new(config: &ArenaConfig) -> Result<Self> {
        if config.view_size == 0 || config.view_count == 0 {
            return Err(CacheError::InvalidRequest(
                "arena needs at least one non-empty view".to_string(),
            ));
        }

        let mut views = Vec::with_capacity(config.view_count);
        for id in 0..config.view_count as u32 {
            let view = match &config.path {
                Some(dir) => {
                    MemView::file_backed(id, config.view_size, &dir.join(format!("view-{}.bin", id)))?
                }
                None => MemView::anonymous(id, config.view_size)?,
            };
            views.push(view);
        }

        info!(
            "Backing store mapped {} view(s) of {} bytes",
            config.view_count, config.view_size
        );

        Ok(Self {
            views,
            view_size: config.view_size,
            cursor: AtomicUsize::new(0),
        })
    }

    pub fn view_count(&self) -> usize {
        self.views.len()
    }

    fn view(&self, ptr: &ObjectPointer) -> Result<&MemView> {
        self.views
            .get(ptr.view as usize)
            .ok_or(CacheError::StalePointer(*ptr))
    }

    // == Allocate ==
    /// Reserves `len` bytes in some view, starting from a rotating cursor.
    ///
    /// # Errors
    /// `OutOfArenaSpace` if no view has a large enough free run.
    pub fn allocate(&self, len: usize) -> Result<ObjectPointer> {
        self.place(len, |view| view.allocate(len))
    }

    /// Allocates and copies `bytes` in one step. The copy happens under the
    /// same view lock as the allocation, so the pointer is current when
    /// returned.
    pub fn store(&self, bytes: &[u8]) -> Result<ObjectPointer> {
        self.place(bytes.len(), |view| view.store(bytes))
    }

    fn place(
        &self,
        len: usize,
        attempt: impl Fn(&MemView) -> Option<ObjectPointer>,
    ) -> Result<ObjectPointer> {
        if len > self.view_size {
            return Err(CacheError::OutOfArenaSpace { requested: len });
        }

        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        let count = self.views.len();
        for step in 0..count {
            if let Some(ptr) = attempt(&self.views[(start + step) % count]) {
                return Ok(ptr);
            }
        }

        debug!("No view can hold {} bytes", len);
        Err(CacheError::OutOfArenaSpace { requested: len })
    }

    // == Resolve ==
    /// Borrows the payload bytes in place. Its view is locked while the span
    /// is alive, so keep it short.
    pub fn resolve(&self, ptr: &ObjectPointer) -> Result<MappedMutexGuard<'_, [u8]>> {
        self.view(ptr)?.resolve(ptr)
    }

    /// Copies the payload out.
    pub fn read(&self, ptr: &ObjectPointer) -> Result<Vec<u8>> {
        Ok(self.resolve(ptr)?.to_vec())
    }

    /// Overwrites the payload. `bytes` must be exactly the allocated length.
    pub fn write(&self, ptr: &ObjectPointer, bytes: &[u8]) -> Result<()> {
        let mut span = self.resolve(ptr)?;
        if span.len() != bytes.len() {
            return Err(CacheError::InvalidRequest(format!(
                "write of {} bytes into a {} byte area",
                bytes.len(),
                span.len()
            )));
        }
        span.copy_from_slice(bytes);
        Ok(())
    }

    // == Release ==
    pub fn release(&self, ptr: &ObjectPointer) -> Result<()> {
        self.view(ptr)?.release(ptr)
    }

    /// Re-issues `ptr` for its view's current epoch.
    pub fn refresh(&self, ptr: &ObjectPointer) -> Result<ObjectPointer> {
        self.view(ptr)?.refresh(ptr)
    }

    /// Reads through a pointer that may predate a compaction, returning the
    /// current pointer alongside the bytes.
    pub fn read_refreshed(&self, ptr: &ObjectPointer) -> Result<(ObjectPointer, Vec<u8>)> {
        self.view(ptr)?.read_refreshed(ptr)
    }

    /// Releases through a pointer that may predate a compaction.
    pub fn release_refreshed(&self, ptr: &ObjectPointer) -> Result<()> {
        self.view(ptr)?.release_refreshed(ptr)
    }

    // == Compact ==
    /// Compacts every view in turn. Pointers into views that moved anything
    /// must be refreshed before they resolve again.
    pub fn compact(&self) -> CompactionReport {
        let mut report = CompactionReport::default();
        for view in &self.views {
            let moved = view.compact();
            if moved > 0 {
                report.views_compacted += 1;
                report.relocated += moved;
            }
        }

        if report.relocated > 0 {
            info!(
                "Compacted {} view(s), relocated {} area(s)",
                report.views_compacted, report.relocated
            );
        }
        report
    }

    pub fn stats(&self) -> ArenaStats {
        let views: Vec<ViewStats> = self.views.iter().map(MemView::stats).collect();
        ArenaStats {
            capacity: views.iter().map(|v| v.capacity).sum(),
            used: views.iter().map(|v| v.used).sum(),
            live_areas: views.iter().map(|v| v.live_areas).sum(),
            views,
        }
    }
}
