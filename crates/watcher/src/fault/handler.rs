use super::{FaultBackend, RawFault, ip};
use crate::clock::Clock;
use crate::domain::{EventId, FastPathEvent};
use crate::memory::page_base;
use crate::metrics::Metrics;
use crate::queue::PartitionedQueue;
use crate::registry::Registry;
use crate::state::Lifecycle;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{error, info, trace, warn};

/// A released page waiting to be write protected again.
#[derive(Debug, Clone, Copy)]
struct Released {
    page: usize,
    due: Instant,
}

/// The single thread that turns faults into fast-path events.
///
/// Per fault it does one registry lookup, one optional `/proc` read for the
/// instruction pointer, one queue push and one protection change. Anything
/// slower belongs in the enrichment workers.
pub(crate) struct FaultHandler {
    pub backend: Arc<dyn FaultBackend>,
    pub registry: Arc<Registry>,
    pub queue: Arc<PartitionedQueue>,
    pub metrics: Arc<Metrics>,
    pub lifecycle: Arc<Lifecycle>,
    pub clock: Arc<dyn Clock>,
    pub poll_interval: Duration,
    pub rearm_delay: Duration,
}

impl FaultHandler {
    pub fn spawn(self, stop: Arc<AtomicBool>) -> std::io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name("memwatch-faults".into())
            .spawn(move || self.run(&stop))
    }

    fn run(self, stop: &AtomicBool) {
        info!(backend = self.backend.name(), "fault handler started");
        let mut sequence = 0u64;
        let mut released = VecDeque::new();
        let mut overflowing = false;

        while !stop.load(Ordering::Acquire) {
            self.rearm_due(&mut released);

            let mut timeout = self.poll_interval;
            if let Some(next) = released.front() {
                let remaining = next.due.saturating_duration_since(Instant::now());
                if remaining < Duration::from_millis(1) {
                    // Poll granularity is a millisecond; wait out short
                    // grace periods here instead.
                    std::thread::sleep(remaining);
                    timeout = Duration::ZERO;
                } else {
                    timeout = timeout.min(remaining);
                }
            }

            let faults = match self.backend.poll_faults(timeout) {
                Ok(faults) => faults,
                Err(err) => {
                    error!(%err, "fault channel failed, handler exiting");
                    self.lifecycle.fail(err.to_string());
                    // Nobody will serve faults any more: armed pages must
                    // not stay protected.
                    self.disarm_all();
                    return;
                }
            };

            self.handle(faults, &mut sequence, &mut overflowing, &mut released);
        }

        // Faults reported before the stop request still become events.
        match self.backend.poll_faults(Duration::ZERO) {
            Ok(faults) => self.handle(faults, &mut sequence, &mut overflowing, &mut released),
            Err(err) => trace!(%err, "final fault drain skipped"),
        }
        for page in released.drain(..) {
            self.rearm(page.page);
        }
        trace!("fault handler loop exited");
    }

    fn disarm_all(&self) {
        for region in self.registry.regions().iter().filter(|r| r.armed) {
            if let Err(err) = self.backend.disarm(region.base_address, region.size) {
                self.metrics.record_protection_failure();
                warn!(%err, region = %region.id, "failed to disarm region");
            }
            self.registry.set_armed(&region.id, false);
        }
    }

    fn handle(
        &self,
        faults: Vec<RawFault>,
        sequence: &mut u64,
        overflowing: &mut bool,
        released: &mut VecDeque<Released>,
    ) {
        for fault in faults {
            let accepted = self.capture(&fault, sequence);
            if !accepted && !*overflowing {
                warn!(
                    dropped = self.queue.dropped(),
                    "fast-path queue full, dropping mutation events"
                );
            }
            *overflowing = !accepted;
            self.release(&fault, released);
        }
    }

    /// Queue a fast-path event for `fault`. Returns `false` only when the
    /// queue rejected it.
    fn capture(&self, fault: &RawFault, sequence: &mut u64) -> bool {
        let timestamp_ns = self.clock.unix_nanos();
        let Some(region_base) = self.registry.base_of(fault.address) else {
            trace!(address = format_args!("{:#x}", fault.address), "fault outside watched regions");
            return true;
        };
        // Must run before release: the probe reads where the thread is parked.
        let instruction_pointer = fault
            .instruction_pointer
            .unwrap_or_else(|| fault.thread_id.map_or(0, ip::probe));

        let event = FastPathEvent {
            id: EventId(*sequence),
            timestamp_ns,
            region_base,
            fault_address: fault.address,
            thread_id: fault.thread_id,
            instruction_pointer,
        };
        *sequence += 1;

        if self.queue.enqueue(event) {
            self.metrics.record_received();
            trace!(event = %event.id, address = format_args!("{:#x}", fault.address), "fault queued");
            true
        } else {
            self.metrics.record_queue_full();
            false
        }
    }

    fn release(&self, fault: &RawFault, released: &mut VecDeque<Released>) {
        match self.backend.release(fault) {
            Ok(()) => released.push_back(Released {
                page: page_base(fault.address),
                due: Instant::now() + self.rearm_delay,
            }),
            Err(err) => {
                self.metrics.record_protection_failure();
                warn!(%err, "failed to release faulted page");
            }
        }
    }

    fn rearm_due(&self, released: &mut VecDeque<Released>) {
        let now = Instant::now();
        while released.front().is_some_and(|r| r.due <= now) {
            let Some(page) = released.pop_front() else {
                break;
            };
            self.rearm(page.page);
        }
    }

    fn rearm(&self, page: usize) {
        if let Err(err) = self.backend.rearm(page) {
            self.metrics.record_protection_failure();
            warn!(%err, "failed to re-protect page");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::domain::{MutationDepth, TrackFlags};
    use crate::error::Error;
    use crate::fault::ManualBackend;
    use crate::memory::PageBuffer;
    use crate::writer::WriterStats;

    struct Rig {
        backend: Arc<ManualBackend>,
        queue: Arc<PartitionedQueue>,
        metrics: Arc<Metrics>,
        stop: Arc<AtomicBool>,
        handle: JoinHandle<()>,
    }

    fn rig(registry: Arc<Registry>, capacity: usize) -> Rig {
        let backend = Arc::new(ManualBackend::new());
        backend.open().unwrap();
        let queue = Arc::new(PartitionedQueue::new(capacity, 1));
        let metrics = Arc::new(Metrics::default());
        let stop = Arc::new(AtomicBool::new(false));
        let handler = FaultHandler {
            backend: backend.clone(),
            registry,
            queue: queue.clone(),
            metrics: metrics.clone(),
            lifecycle: Arc::new(Lifecycle::default()),
            clock: Arc::new(ManualClock::new()),
            poll_interval: Duration::from_millis(5),
            rearm_delay: Duration::from_micros(50),
        };
        let handle = handler.spawn(stop.clone()).unwrap();
        Rig {
            backend,
            queue,
            metrics,
            stop,
            handle,
        }
    }

    fn wait_for(mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() {
            assert!(Instant::now() < deadline, "timed out");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    #[allow(unsafe_code)]
    fn faults_become_ordered_fast_path_events() {
        let buffer = PageBuffer::new(1).unwrap();
        let registry = Arc::new(Registry::default());
        // SAFETY: buffer outlives the handler.
        unsafe {
            registry.register(
                buffer.base_address(),
                buffer.len(),
                "x",
                TrackFlags::THREADS,
                MutationDepth::Full,
            )
        }
        .unwrap();
        let rig = rig(registry, 16);
        rig.backend.arm(buffer.base_address(), buffer.len()).unwrap();

        for offset in [0, 8, 16] {
            assert!(rig.backend.notify_write(buffer.base_address() + offset));
        }
        wait_for(|| rig.queue.depth() == 3);

        let events: Vec<_> = std::iter::from_fn(|| rig.queue.dequeue(0)).collect();
        assert_eq!(
            events.iter().map(|e| e.id.0).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert!(events.iter().all(|e| e.region_base == buffer.base_address()));
        assert_eq!(events[1].fault_address, buffer.base_address() + 8);

        rig.stop.store(true, Ordering::Release);
        rig.handle.join().unwrap();
        let snapshot = rig.metrics.snapshot(0, WriterStats::default());
        assert_eq!(snapshot.events_received, 3);
        assert_eq!(snapshot.events_dropped, 0);
    }

    #[test]
    #[allow(unsafe_code)]
    fn overflow_is_counted_not_blocking() {
        let buffer = PageBuffer::new(1).unwrap();
        let registry = Arc::new(Registry::default());
        // SAFETY: buffer outlives the handler.
        unsafe {
            registry.register(
                buffer.base_address(),
                buffer.len(),
                "x",
                TrackFlags::empty(),
                MutationDepth::Full,
            )
        }
        .unwrap();
        let rig = rig(registry, 2);
        rig.backend.arm(buffer.base_address(), buffer.len()).unwrap();

        for _ in 0..10 {
            rig.backend.notify_write(buffer.base_address());
        }
        wait_for(|| rig.metrics.snapshot(0, WriterStats::default()).events_dropped == 8);
        assert_eq!(rig.queue.depth(), 2);

        rig.stop.store(true, Ordering::Release);
        rig.handle.join().unwrap();
    }

    /// Manual backend whose fault channel can be broken on demand.
    #[derive(Debug, Default)]
    struct Breakable {
        inner: ManualBackend,
        broken: AtomicBool,
    }

    impl FaultBackend for Breakable {
        fn name(&self) -> &'static str {
            "breakable"
        }

        fn open(&self) -> Result<(), Error> {
            self.inner.open()
        }

        fn arm(&self, base: usize, len: usize) -> Result<(), Error> {
            self.inner.arm(base, len)
        }

        fn disarm(&self, base: usize, len: usize) -> Result<(), Error> {
            self.inner.disarm(base, len)
        }

        fn poll_faults(&self, timeout: Duration) -> Result<Vec<RawFault>, Error> {
            if self.broken.load(Ordering::Acquire) {
                return Err(Error::Platform("descriptor gone".into()));
            }
            self.inner.poll_faults(timeout)
        }

        fn release(&self, fault: &RawFault) -> Result<(), Error> {
            self.inner.release(fault)
        }

        fn rearm(&self, page: usize) -> Result<(), Error> {
            self.inner.rearm(page)
        }

        fn wake(&self) -> Result<(), Error> {
            self.inner.wake()
        }
    }

    #[test]
    #[allow(unsafe_code)]
    fn failed_channel_disarms_every_region() {
        let buffers = [PageBuffer::new(1).unwrap(), PageBuffer::new(2).unwrap()];
        let registry = Arc::new(Registry::default());
        let backend = Arc::new(Breakable::default());
        backend.open().unwrap();
        for buffer in &buffers {
            // SAFETY: buffers outlive the handler.
            let id = unsafe {
                registry.register(
                    buffer.base_address(),
                    buffer.len(),
                    "x",
                    TrackFlags::empty(),
                    MutationDepth::Full,
                )
            }
            .unwrap();
            backend.arm(buffer.base_address(), buffer.len()).unwrap();
            registry.set_armed(&id, true);
        }

        let lifecycle = Arc::new(Lifecycle::default());
        let handler = FaultHandler {
            backend: backend.clone(),
            registry: registry.clone(),
            queue: Arc::new(PartitionedQueue::new(16, 1)),
            metrics: Arc::new(Metrics::default()),
            lifecycle: lifecycle.clone(),
            clock: Arc::new(ManualClock::new()),
            poll_interval: Duration::from_millis(5),
            rearm_delay: Duration::from_micros(50),
        };
        let handle = handler.spawn(Arc::new(AtomicBool::new(false))).unwrap();
        backend.broken.store(true, Ordering::Release);
        backend.wake().unwrap();
        handle.join().unwrap();

        assert_eq!(lifecycle.state(), crate::state::CoreState::Error);
        assert!(lifecycle.error_message().contains("descriptor gone"));
        assert_eq!(backend.inner.armed_ranges(), 0);
        assert!(registry.regions().iter().all(|r| !r.armed));
    }
}
