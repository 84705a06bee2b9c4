//! Object Pointer Module

use std::fmt;

use serde::Serialize;

// == Object Pointer ==
/// Non-owning address of a payload inside a mapped view.
///
/// `area` and `serial` identify the allocation for its whole life; `epoch`
/// and `offset` are its physical placement and go stale when the view is
/// compacted. Resolving checks all of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ObjectPointer {
    pub(crate) view: u32,
    pub(crate) area: u32,
    pub(crate) serial: u64,
    pub(crate) epoch: u64,
    pub(crate) offset: usize,
    pub(crate) len: usize,
}

impl ObjectPointer {
    pub fn view(&self) -> u32 {
        self.view
    }

    pub fn area(&self) -> u32 {
        self.area
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl fmt::Display for ObjectPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "view {} area {} @{}+{} (epoch {})",
            self.view, self.area, self.offset, self.len, self.epoch
        )
    }
}
