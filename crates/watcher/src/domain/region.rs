#![forbid(unsafe_code)]

use crate::domain::RegionId;
use bitflags::bitflags;
use std::ops::Range;
use std::time::SystemTime;

bitflags! {
    /// What context to attach to mutations of a region. The bit values are
    /// part of the adapter-facing contract.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TrackFlags: u32 {
        const THREADS = 1;
        const SQL = 2;
        const ALL = 4;
        const LOCALS = 8;
    }
}

impl TrackFlags {
    pub fn wants_sql(self) -> bool {
        self.intersects(Self::SQL | Self::ALL)
    }

    pub fn wants_scope(self) -> bool {
        self.intersects(Self::LOCALS | Self::ALL)
    }
}

/// Which part of a region is compared when a mutation is observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MutationDepth {
    #[default]
    Full,
    /// Only `offset..offset + len` is compared. Offsets in the resulting
    /// deltas are still relative to the region base.
    Range { offset: usize, len: usize },
}

impl MutationDepth {
    /// Byte window inside a region of `size` bytes, clamped to the region.
    pub fn window(self, size: usize) -> Range<usize> {
        match self {
            Self::Full => 0..size,
            Self::Range { offset, len } => {
                let start = offset.min(size);
                start..start.saturating_add(len).min(size)
            }
        }
    }
}

/// Mutable descriptive fields of a region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionMetadata {
    pub name: String,
    pub flags: TrackFlags,
    pub depth: MutationDepth,
}

#[derive(Debug, Clone)]
pub struct WatchedRegion {
    pub id: RegionId,
    pub base_address: usize,
    pub size: usize,
    pub name: String,
    pub flags: TrackFlags,
    pub depth: MutationDepth,
    /// Last observed contents: the registration-time copy until the first
    /// mutation is enriched, then the post-mutation bytes of the latest one.
    pub snapshot: Vec<u8>,
    pub registered_at: SystemTime,
    /// Whether write protection is currently installed.
    pub armed: bool,
}

impl WatchedRegion {
    pub fn contains(&self, address: usize) -> bool {
        (self.base_address..self.base_address + self.size).contains(&address)
    }
}
