#![forbid(unsafe_code)]

use super::{ArmedRanges, FaultBackend, RawFault};
use crate::error::Error;
use flume::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, trace};

/// Backend driven by the embedding adapter instead of the kernel.
///
/// Adapters that already see assignments (or tests) perform the write and
/// then call [`ManualBackend::notify_write`]. Only writes into armed ranges
/// are reported, so pause and unregistration behave exactly as with kernel
/// interception.
#[derive(Debug)]
pub struct ManualBackend {
    /// `None` only wakes the poller.
    tx: Sender<Option<RawFault>>,
    rx: Receiver<Option<RawFault>>,
    armed: Mutex<ArmedRanges>,
    open: AtomicBool,
    unavailable: Option<String>,
}

impl Default for ManualBackend {
    fn default() -> Self {
        let (tx, rx) = flume::unbounded();
        Self {
            tx,
            rx,
            armed: Mutex::new(ArmedRanges::default()),
            open: AtomicBool::new(false),
            unavailable: None,
        }
    }
}

impl ManualBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// A backend whose `open` always fails with `reason`.
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            unavailable: Some(reason.into()),
            ..Self::default()
        }
    }

    /// Report that the calling thread wrote to `address`. Returns whether the
    /// address was armed and a fault was raised.
    #[inline(never)]
    pub fn notify_write(&self, address: usize) -> bool {
        let this = Self::notify_write as fn(&Self, usize) -> bool;
        let ip = caller_of(this as usize);
        self.notify_write_at(address, ip)
    }

    /// Like [`ManualBackend::notify_write`] with a caller-supplied
    /// instruction pointer.
    pub fn notify_write_at(&self, address: usize, instruction_pointer: Option<u64>) -> bool {
        if !self.open.load(Ordering::Acquire) || !self.armed.lock().contains(address) {
            trace!(address = format_args!("{address:#x}"), "write outside armed ranges");
            return false;
        }
        let fault = RawFault {
            address,
            thread_id: Some(nix::unistd::gettid().as_raw() as u32),
            instruction_pointer,
        };
        self.tx.send(Some(fault)).is_ok()
    }

    pub fn is_armed(&self, address: usize) -> bool {
        self.armed.lock().contains(address)
    }

    pub fn armed_ranges(&self) -> usize {
        self.armed.lock().len()
    }
}

/// Instruction pointer in the frame that called `function`.
fn caller_of(function: usize) -> Option<u64> {
    let mut found = false;
    let mut caller = None;
    backtrace::trace(|frame| {
        if found {
            caller = Some(frame.ip() as u64);
            return false;
        }
        found = frame.symbol_address() as usize == function;
        true
    });
    caller
}

impl FaultBackend for ManualBackend {
    fn name(&self) -> &'static str {
        "manual"
    }

    fn open(&self) -> Result<(), Error> {
        if let Some(reason) = &self.unavailable {
            return Err(Error::Platform(reason.clone()));
        }
        self.open.store(true, Ordering::Release);
        debug!("manual fault backend ready");
        Ok(())
    }

    fn arm(&self, base: usize, len: usize) -> Result<(), Error> {
        if !self.open.load(Ordering::Acquire) {
            return Err(Error::Platform("manual backend is not open".into()));
        }
        self.armed.lock().insert(base, len);
        Ok(())
    }

    fn disarm(&self, base: usize, _len: usize) -> Result<(), Error> {
        self.armed.lock().remove(base);
        Ok(())
    }

    fn poll_faults(&self, timeout: Duration) -> Result<Vec<RawFault>, Error> {
        let first = match self.rx.recv_timeout(timeout) {
            Ok(message) => message,
            Err(RecvTimeoutError::Timeout) => return Ok(Vec::new()),
            Err(RecvTimeoutError::Disconnected) => {
                return Err(Error::Platform("manual fault channel closed".into()));
            }
        };
        Ok(first.into_iter().chain(self.rx.try_iter().flatten()).collect())
    }

    fn release(&self, _fault: &RawFault) -> Result<(), Error> {
        Ok(())
    }

    fn rearm(&self, _page: usize) -> Result<(), Error> {
        Ok(())
    }

    fn wake(&self) -> Result<(), Error> {
        let _ = self.tx.send(None);
        Ok(())
    }
}
