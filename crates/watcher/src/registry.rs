#![allow(unsafe_code)]

use crate::domain::{MutationDepth, RegionId, RegionMetadata, TrackFlags, WatchedRegion};
use crate::error::Error;
use crate::memory;
use parking_lot::{Mutex, MutexGuard};
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::time::SystemTime;
use tracing::debug;

/// Everything enrichment needs to know about a region, minus its snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionInfo {
    pub id: RegionId,
    pub base_address: usize,
    pub size: usize,
    pub name: String,
    pub flags: TrackFlags,
    pub depth: MutationDepth,
    pub armed: bool,
}

impl From<&WatchedRegion> for RegionInfo {
    fn from(region: &WatchedRegion) -> Self {
        Self {
            id: region.id.clone(),
            base_address: region.base_address,
            size: region.size,
            name: region.name.clone(),
            flags: region.flags,
            depth: region.depth,
            armed: region.armed,
        }
    }
}

/// Region contents around one mutation.
#[derive(Debug, Clone)]
pub struct Observation {
    pub region: RegionInfo,
    pub before: Vec<u8>,
    pub after: Vec<u8>,
}

#[derive(Debug, Default)]
struct Inner {
    regions: FxHashMap<RegionId, WatchedRegion>,
    by_base: BTreeMap<usize, RegionId>,
}

impl Inner {
    fn containing(&self, address: usize) -> Option<&WatchedRegion> {
        let (_, id) = self.by_base.range(..=address).next_back()?;
        self.regions.get(id).filter(|r| r.contains(address))
    }

    fn overlaps(&self, base: usize, size: usize) -> bool {
        let end = base + size;
        self.by_base
            .range(..end)
            .next_back()
            .and_then(|(_, id)| self.regions.get(id))
            .is_some_and(|r| r.base_address + r.size > base)
    }
}

/// Owner of every watched region. A single mutex guards it: registration is
/// rare and per-event access is one small copy.
#[derive(Debug, Default)]
pub struct Registry {
    inner: Mutex<Inner>,
}

impl Registry {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock()
    }

    /// Validate the range and record it together with a copy of its current
    /// contents.
    ///
    /// # Safety
    ///
    /// `base_address..base_address + size` must be mapped, readable and
    /// resident, and must stay mapped until the region is unregistered.
    pub unsafe fn register(
        &self,
        base_address: usize,
        size: usize,
        name: &str,
        flags: TrackFlags,
        depth: MutationDepth,
    ) -> Result<RegionId, Error> {
        let page = memory::page_size();
        if base_address == 0 {
            return Err(Error::Allocation("null base address".into()));
        }
        if !memory::is_page_aligned(base_address) {
            return Err(Error::Allocation(format!(
                "base address {base_address:#x} is not aligned to {page} bytes"
            )));
        }
        if size == 0 || size % page != 0 {
            return Err(Error::Allocation(format!(
                "size {size} is not a positive multiple of the page size {page}"
            )));
        }
        if base_address.checked_add(size).is_none() {
            return Err(Error::Allocation("region wraps the address space".into()));
        }

        let mut inner = self.lock();
        if inner.overlaps(base_address, size) {
            return Err(Error::Allocation(format!(
                "{base_address:#x}+{size} overlaps a watched region"
            )));
        }

        // SAFETY: forwarded from the caller's contract.
        let snapshot = unsafe { memory::read_bytes(base_address, size) };
        let id = RegionId::next();
        inner.by_base.insert(base_address, id.clone());
        inner.regions.insert(
            id.clone(),
            WatchedRegion {
                id: id.clone(),
                base_address,
                size,
                name: name.to_owned(),
                flags,
                depth,
                snapshot,
                registered_at: SystemTime::now(),
                armed: false,
            },
        );
        debug!(region = %id, base = format_args!("{base_address:#x}"), size, name, "region registered");
        Ok(id)
    }

    pub fn unregister(&self, id: &RegionId) -> Option<WatchedRegion> {
        let mut inner = self.lock();
        let region = inner.regions.remove(id)?;
        inner.by_base.remove(&region.base_address);
        debug!(region = %id, "region unregistered");
        Some(region)
    }

    pub fn get(&self, id: &RegionId) -> Option<RegionInfo> {
        self.lock().regions.get(id).map(RegionInfo::from)
    }

    /// The region whose range contains `address`.
    pub fn locate(&self, address: usize) -> Option<RegionInfo> {
        self.lock().containing(address).map(RegionInfo::from)
    }

    /// Base address of the region containing `address`. Cheap enough for
    /// the fault handler: no clones, one lock.
    pub fn base_of(&self, address: usize) -> Option<usize> {
        self.lock().containing(address).map(|r| r.base_address)
    }

    /// Stored snapshot, or an empty buffer for an unknown id.
    pub fn read_snapshot(&self, id: &RegionId) -> Vec<u8> {
        self.lock()
            .regions
            .get(id)
            .map(|r| r.snapshot.clone())
            .unwrap_or_default()
    }

    /// Replace the stored snapshot. Rejected when the id is unknown or the
    /// length differs from the region size.
    pub fn write_snapshot(&self, id: &RegionId, bytes: Vec<u8>) -> bool {
        let mut inner = self.lock();
        match inner.regions.get_mut(id) {
            Some(region) if region.size == bytes.len() => {
                region.snapshot = bytes;
                true
            }
            _ => false,
        }
    }

    /// Copy the live bytes of the region containing `address`, store them as
    /// the new snapshot and return both versions.
    ///
    /// Runs under the registry lock, so a region is never read after it has
    /// been unregistered.
    pub fn observe(&self, address: usize) -> Option<Observation> {
        let mut inner = self.lock();
        let id = {
            let region = inner.containing(address)?;
            region.id.clone()
        };
        let region = inner.regions.get_mut(&id)?;
        // SAFETY: registration guarantees the range stays mapped until it is
        // unregistered, which needs the lock we are holding.
        let after = unsafe { memory::read_bytes(region.base_address, region.size) };
        let before = std::mem::replace(&mut region.snapshot, after.clone());
        Some(Observation {
            region: RegionInfo::from(&*region),
            before,
            after,
        })
    }

    pub fn update_metadata(&self, id: &RegionId, metadata: RegionMetadata) -> bool {
        let mut inner = self.lock();
        let Some(region) = inner.regions.get_mut(id) else {
            return false;
        };
        region.name = metadata.name;
        region.flags = metadata.flags;
        region.depth = metadata.depth;
        true
    }

    pub fn set_armed(&self, id: &RegionId, armed: bool) -> bool {
        let mut inner = self.lock();
        match inner.regions.get_mut(id) {
            Some(region) => {
                region.armed = armed;
                true
            }
            None => false,
        }
    }

    /// Regions registered but not yet write protected.
    pub fn unarmed(&self) -> Vec<RegionInfo> {
        self.lock()
            .regions
            .values()
            .filter(|r| !r.armed)
            .map(RegionInfo::from)
            .collect()
    }

    pub fn regions(&self) -> Vec<RegionInfo> {
        self.lock().regions.values().map(RegionInfo::from).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) -> Vec<WatchedRegion> {
        let mut inner = self.lock();
        inner.by_base.clear();
        inner.regions.drain().map(|(_, r)| r).collect()
    }
}
