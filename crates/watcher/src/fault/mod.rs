//! Write interception.
//!
//! A [`FaultBackend`] turns "a thread wrote to a watched page" into a
//! [`RawFault`]. The handler thread in [`handler`] is the only consumer; it
//! converts faults to fast-path events and lets the writer continue.

pub(crate) mod handler;
pub mod ip;
mod manual;
mod uffd;

pub use manual::ManualBackend;
pub use uffd::UffdBackend;

use crate::error::Error;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::time::Duration;

/// What the kernel (or adapter) reports about one intercepted write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawFault {
    pub address: usize,
    pub thread_id: Option<u32>,
    /// Set when the backend already knows where the write came from. The
    /// handler probes the faulting thread otherwise.
    pub instruction_pointer: Option<u64>,
}

/// Interface to an interception mechanism.
///
/// All methods take `&self`: registration threads call `arm`/`disarm` while
/// the handler thread polls.
pub trait FaultBackend: Send + Sync + Debug {
    fn name(&self) -> &'static str;

    /// Acquire the notification channel. Called once by `initialize`.
    fn open(&self) -> Result<(), Error>;

    /// Start intercepting writes to `base..base + len`.
    fn arm(&self, base: usize, len: usize) -> Result<(), Error>;

    /// Stop intercepting writes to `base..base + len` and release any thread
    /// still blocked on it.
    fn disarm(&self, base: usize, len: usize) -> Result<(), Error>;

    /// Wait up to `timeout` for faults. An empty result means the timeout
    /// expired.
    fn poll_faults(&self, timeout: Duration) -> Result<Vec<RawFault>, Error>;

    /// Make the faulted page writable and wake the faulting thread.
    fn release(&self, fault: &RawFault) -> Result<(), Error>;

    /// Write protect a single page again after [`FaultBackend::release`].
    fn rearm(&self, page: usize) -> Result<(), Error>;

    /// Make a pending (or the next) `poll_faults` return without waiting
    /// for its timeout.
    fn wake(&self) -> Result<(), Error>;
}

/// Non-overlapping `[base, base + len)` ranges keyed by base.
#[derive(Debug, Default, Clone)]
pub struct ArmedRanges {
    ranges: BTreeMap<usize, usize>,
}

impl ArmedRanges {
    pub fn insert(&mut self, base: usize, len: usize) {
        self.ranges.insert(base, len);
    }

    pub fn remove(&mut self, base: usize) -> bool {
        self.ranges.remove(&base).is_some()
    }

    pub fn contains(&self, address: usize) -> bool {
        self.ranges
            .range(..=address)
            .next_back()
            .is_some_and(|(&base, &len)| address < base + len)
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}
