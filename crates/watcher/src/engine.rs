use crate::clock::{Clock, SystemClock};
use crate::context::{ScopeClassifier, SqlContextRegistry};
use crate::domain::{MutationDepth, RegionId, RegionMetadata, TrackFlags};
use crate::enrich::{Enricher, Shutdown, Worker};
use crate::error::Error;
use crate::fault::handler::FaultHandler;
use crate::fault::{FaultBackend, ManualBackend, UffdBackend};
use crate::filter::{EventFilter, TimedFilter};
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::queue::PartitionedQueue;
use crate::registry::{RegionInfo, Registry};
use crate::state::{CoreState, Lifecycle, Transition};
use crate::symbols::{BacktraceSymbolizer, SymbolCache, SymbolResolver, Symbolizer};
use crate::writer::{EventLog, WriterStats};
use config::{Backend, Config, ScopeMap};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Pluggable collaborators of a [`Watcher`].
pub struct Services {
    pub backend: Arc<dyn FaultBackend>,
    pub clock: Arc<dyn Clock>,
    pub symbolizer: Box<dyn Symbolizer>,
    pub filter: Option<Arc<dyn EventFilter>>,
    pub scopes: Option<ScopeMap>,
}

impl Services {
    /// Production services for `config`: the configured backend, the system
    /// clock, debug-info symbolization and the scope file if one is set.
    pub fn from_config(config: &Config) -> Result<Self, Error> {
        let backend: Arc<dyn FaultBackend> = match config.engine.backend {
            Backend::Userfaultfd => Arc::new(UffdBackend::new()),
            Backend::Manual => Arc::new(ManualBackend::new()),
        };
        let scopes = config
            .enrichment
            .scope_file
            .as_ref()
            .map(ScopeMap::load)
            .transpose()?;
        Ok(Self {
            backend,
            clock: Arc::new(SystemClock),
            symbolizer: Box::new(BacktraceSymbolizer),
            filter: None,
            scopes,
        })
    }

    pub fn with_filter(mut self, filter: Arc<dyn EventFilter>) -> Self {
        self.filter = Some(filter);
        self
    }
}

struct Threads {
    stop_handler: Arc<AtomicBool>,
    handler: JoinHandle<()>,
    shutdown: Arc<Shutdown>,
    workers: Vec<JoinHandle<()>>,
}

/// Resources acquired by `initialize` and released by `stop`.
struct Runtime {
    queue: Arc<PartitionedQueue>,
    log: Arc<EventLog>,
    threads: Option<Threads>,
}

/// The mutation watcher.
///
/// One instance owns the fault backend, the region registry, the fast-path
/// queues, the enrichment workers and the event log. Construct it once and
/// share it (`Arc<Watcher>`) with every adapter that registers regions.
pub struct Watcher {
    config: Config,
    lifecycle: Arc<Lifecycle>,
    registry: Arc<Registry>,
    metrics: Arc<Metrics>,
    sql: Arc<SqlContextRegistry>,
    resolver: Arc<SymbolResolver>,
    scopes: ScopeClassifier,
    backend: Arc<dyn FaultBackend>,
    clock: Arc<dyn Clock>,
    filter: Option<Arc<dyn EventFilter>>,
    /// Serializes lifecycle transitions and arming decisions.
    runtime: Mutex<Option<Runtime>>,
    /// Writer stats captured when the log was closed.
    final_writer: Mutex<WriterStats>,
}

impl std::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher")
            .field("state", &self.state())
            .field("backend", &self.backend.name())
            .field("regions", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl Watcher {
    pub fn new(mut config: Config, services: Services) -> Self {
        config.apply_defaults();
        let cache = SymbolCache::new(
            config.enrichment.symbol_cache_capacity,
            config.enrichment.symbol_cache_ttl,
            services.clock.clone(),
        );
        Self {
            lifecycle: Arc::new(Lifecycle::default()),
            registry: Arc::new(Registry::default()),
            metrics: Arc::new(Metrics::default()),
            sql: Arc::new(SqlContextRegistry::default()),
            resolver: Arc::new(SymbolResolver::new(cache, services.symbolizer)),
            scopes: ScopeClassifier::new(services.scopes),
            backend: services.backend,
            clock: services.clock,
            filter: services.filter,
            runtime: Mutex::new(None),
            final_writer: Mutex::new(WriterStats::default()),
            config,
        }
    }

    /// Initialize with the output directory and queue size from the config.
    pub fn initialize_from_config(&self) -> Result<(), Error> {
        let output_dir = self.config.persistence.output_dir.clone();
        self.initialize(output_dir, self.config.engine.max_queue_size)
    }

    /// Acquire the fault channel and open the event log.
    ///
    /// Any failure leaves the watcher in [`CoreState::Error`] with the reason
    /// available from [`Watcher::error_message`].
    #[tracing::instrument(skip_all)]
    pub fn initialize(&self, output_dir: impl AsRef<Path>, max_queue_size: usize) -> Result<(), Error> {
        let mut runtime = self.runtime.lock();
        self.lifecycle.check(Transition::Initialize)?;

        let prepared = self.backend.open().and_then(|()| {
            let log = EventLog::open(output_dir.as_ref(), &self.config.persistence)?;
            let queue = PartitionedQueue::new(max_queue_size.max(1), self.config.engine.workers);
            Ok(Runtime {
                queue: Arc::new(queue),
                log: Arc::new(log),
                threads: None,
            })
        });
        match prepared {
            Ok(prepared) => {
                *runtime = Some(prepared);
                self.lifecycle.apply(Transition::Initialize)?;
                info!(
                    backend = self.backend.name(),
                    output = %output_dir.as_ref().display(),
                    max_queue_size,
                    "watcher initialized"
                );
                Ok(())
            }
            Err(err) => {
                warn!(%err, "initialization failed");
                self.lifecycle.fail(err.to_string());
                Err(err)
            }
        }
    }

    /// Spawn the fault handler and the enrichment workers, then arm every
    /// region registered so far.
    #[tracing::instrument(skip_all)]
    pub fn start(&self) -> Result<(), Error> {
        let mut runtime = self.runtime.lock();
        self.lifecycle.check(Transition::Start)?;
        let Some(rt) = runtime.as_mut() else {
            return Err(Error::state("start", self.state()));
        };

        match self.spawn_threads(rt) {
            Ok(threads) => rt.threads = Some(threads),
            Err(err) => {
                self.lifecycle.fail(format!("failed to spawn watcher threads: {err}"));
                return Err(err.into());
            }
        }
        self.lifecycle.apply(Transition::Start)?;
        self.arm_pending();
        info!(workers = rt.queue.len(), regions = self.registry.len(), "watcher running");
        Ok(())
    }

    fn spawn_threads(&self, rt: &Runtime) -> std::io::Result<Threads> {
        let stop_handler = Arc::new(AtomicBool::new(false));
        let handler = FaultHandler {
            backend: self.backend.clone(),
            registry: self.registry.clone(),
            queue: rt.queue.clone(),
            metrics: self.metrics.clone(),
            lifecycle: self.lifecycle.clone(),
            clock: self.clock.clone(),
            poll_interval: self.config.engine.poll_interval,
            rearm_delay: self.config.engine.rearm_delay,
        }
        .spawn(stop_handler.clone())?;

        let enricher = Arc::new(Enricher {
            registry: self.registry.clone(),
            resolver: self.resolver.clone(),
            sql: self.sql.clone(),
            scopes: self.scopes.clone(),
            metrics: self.metrics.clone(),
            log: rt.log.clone(),
        });
        let shutdown = Arc::new(Shutdown::default());
        let workers = (0..rt.queue.len())
            .map(|index| self.spawn_worker(index, &enricher, &rt.queue, &shutdown))
            .collect::<std::io::Result<Vec<_>>>();
        let workers = match workers {
            Ok(workers) => workers,
            Err(err) => {
                // Already spawned threads notice the flags and exit on their own.
                stop_handler.store(true, Ordering::Release);
                self.wake_handler();
                shutdown.abort.store(true, Ordering::Release);
                return Err(err);
            }
        };

        Ok(Threads {
            stop_handler,
            handler,
            shutdown,
            workers,
        })
    }

    fn spawn_worker(
        &self,
        index: usize,
        enricher: &Arc<Enricher>,
        queue: &Arc<PartitionedQueue>,
        shutdown: &Arc<Shutdown>,
    ) -> std::io::Result<JoinHandle<()>> {
        let filter = self
            .filter
            .clone()
            .map(|filter| {
                TimedFilter::spawn(
                    filter,
                    self.config.enrichment.filter_timeout,
                    format!("memwatch-filter-{index}"),
                )
            })
            .transpose()?;
        Worker {
            index,
            enricher: enricher.clone(),
            filter,
            queue: queue.clone(),
            shutdown: shutdown.clone(),
        }
        .spawn()
    }

    /// Faults keep being captured and enriched while paused; only arming of
    /// new registrations is deferred until [`Watcher::resume`].
    #[tracing::instrument(skip_all)]
    pub fn pause(&self) -> Result<(), Error> {
        let _runtime = self.runtime.lock();
        self.lifecycle.apply(Transition::Pause)?;
        info!("watcher paused");
        Ok(())
    }

    #[tracing::instrument(skip_all)]
    pub fn resume(&self) -> Result<(), Error> {
        let _runtime = self.runtime.lock();
        self.lifecycle.apply(Transition::Resume)?;
        self.arm_pending();
        info!("watcher resumed");
        Ok(())
    }

    /// Stop with the configured default timeout.
    pub fn stop_default(&self) -> Result<bool, Error> {
        self.stop(self.config.engine.stop_timeout)
    }

    /// Stop intercepting, drain queued events for up to `timeout`, then
    /// detach whatever is still running.
    ///
    /// Returns `Ok(true)` when everything drained and `Ok(false)` when
    /// threads had to be detached. Events abandoned that way are counted in
    /// `events_lost_on_stop`.
    #[tracing::instrument(skip_all)]
    pub fn stop(&self, timeout: Duration) -> Result<bool, Error> {
        let mut runtime = self.runtime.lock();
        self.lifecycle.check(Transition::Stop)?;
        let graceful = match runtime.take() {
            Some(rt) => self.shutdown(rt, timeout),
            None => true,
        };
        self.lifecycle.apply(Transition::Stop)?;

        let metrics = self.snapshot(None);
        info!(
            graceful,
            received = metrics.events_received,
            processed = metrics.events_processed,
            dropped = metrics.events_dropped,
            callbacks_failed = metrics.callbacks_failed,
            "watcher stopped"
        );
        Ok(graceful)
    }

    fn shutdown(&self, rt: Runtime, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut graceful = true;

        if let Some(threads) = rt.threads {
            threads.stop_handler.store(true, Ordering::Release);
            self.wake_handler();
            graceful &= wait_until(deadline, || threads.handler.is_finished());
            if graceful {
                let _ = threads.handler.join();
            } else {
                self.metrics.record_forced_detach();
                warn!("fault handler did not exit in time, detaching");
            }

            self.disarm_all();

            threads.shutdown.drain.store(true, Ordering::Release);
            let drained = wait_until(deadline, || {
                threads.workers.iter().all(JoinHandle::is_finished)
            });
            if !drained {
                graceful = false;
                threads.shutdown.abort.store(true, Ordering::Release);
            }
            for worker in threads.workers {
                if worker.is_finished() {
                    let _ = worker.join();
                } else {
                    self.metrics.record_forced_detach();
                }
            }
        } else {
            self.disarm_all();
        }

        let abandoned = rt.queue.discard_all();
        if abandoned > 0 {
            warn!(abandoned, "events lost at shutdown");
            self.metrics.record_lost_on_stop(abandoned);
        }
        self.registry.clear();
        if let Err(err) = rt.log.close() {
            warn!(%err, "failed to flush event log");
        }
        *self.final_writer.lock() = rt.log.stats();
        graceful
    }

    pub fn state(&self) -> CoreState {
        self.lifecycle.state()
    }

    pub fn error_message(&self) -> String {
        self.lifecycle.error_message()
    }

    /// Watch `size` bytes at `base_address`.
    ///
    /// Allowed in every state except `Stopped` and `Error`. The region is
    /// write protected immediately while running, otherwise on the next
    /// `start` or `resume`.
    ///
    /// # Safety
    ///
    /// The range must be mapped, readable and resident, and must stay mapped
    /// until the region is unregistered or the watcher is stopped.
    #[allow(unsafe_code)]
    pub unsafe fn register_region(
        &self,
        base_address: usize,
        size: usize,
        name: &str,
        flags: TrackFlags,
        depth: MutationDepth,
    ) -> Result<RegionId, Error> {
        let _runtime = self.runtime.lock();
        let state = self
            .lifecycle
            .require("register a region", CoreState::accepts_registration)?;

        // SAFETY: forwarded from the caller's contract.
        let id = unsafe { self.registry.register(base_address, size, name, flags, depth)? };

        if state == CoreState::Running {
            if let Err(err) = self.backend.arm(base_address, size) {
                self.registry.unregister(&id);
                return Err(err);
            }
            self.registry.set_armed(&id, true);
            // A handler that failed meanwhile no longer serves this region.
            if self.state() == CoreState::Error {
                self.disarm_all();
            }
        }
        info!(region = %id, name, size, ?state, "watching region");
        Ok(id)
    }

    /// Stop watching a region. Unknown ids return `false`.
    pub fn unregister(&self, id: &RegionId) -> bool {
        let _runtime = self.runtime.lock();
        let Some(region) = self.registry.get(id) else {
            return false;
        };
        if region.armed {
            self.disarm(&region);
        }
        self.registry.unregister(id).is_some()
    }

    pub fn read_snapshot(&self, id: &RegionId) -> Vec<u8> {
        self.registry.read_snapshot(id)
    }

    pub fn write_snapshot(&self, id: &RegionId, bytes: Vec<u8>) -> bool {
        self.registry.write_snapshot(id, bytes)
    }

    pub fn update_metadata(&self, id: &RegionId, metadata: RegionMetadata) -> bool {
        self.registry.update_metadata(id, metadata)
    }

    pub fn regions(&self) -> Vec<RegionInfo> {
        self.registry.regions()
    }

    /// Where adapters publish the SQL activity of their threads.
    pub fn sql_contexts(&self) -> Arc<SqlContextRegistry> {
        self.sql.clone()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Force buffered records to storage.
    pub fn flush(&self) -> Result<(), Error> {
        let runtime = self.runtime.lock();
        match runtime.as_ref() {
            Some(rt) => rt.log.flush(),
            None => Ok(()),
        }
    }

    /// Blocks while a lifecycle operation (including `stop`) is in progress.
    pub fn metrics(&self) -> MetricsSnapshot {
        let runtime = self.runtime.lock();
        self.snapshot(runtime.as_ref())
    }

    fn snapshot(&self, runtime: Option<&Runtime>) -> MetricsSnapshot {
        match runtime {
            Some(rt) => self.metrics.snapshot(rt.queue.depth(), rt.log.stats()),
            None => self.metrics.snapshot(0, self.final_writer.lock().clone()),
        }
    }

    fn wake_handler(&self) {
        if let Err(err) = self.backend.wake() {
            warn!(%err, "failed to wake the fault handler");
        }
    }

    fn arm_pending(&self) {
        for region in self.registry.unarmed() {
            match self.backend.arm(region.base_address, region.size) {
                Ok(()) => {
                    self.registry.set_armed(&region.id, true);
                    debug!(region = %region.id, "region armed");
                }
                Err(err) => {
                    self.metrics.record_protection_failure();
                    warn!(%err, region = %region.id, "failed to arm region");
                }
            }
        }
    }

    fn disarm(&self, region: &RegionInfo) {
        if let Err(err) = self.backend.disarm(region.base_address, region.size) {
            self.metrics.record_protection_failure();
            warn!(%err, region = %region.id, "failed to disarm region");
        }
        self.registry.set_armed(&region.id, false);
    }

    fn disarm_all(&self) {
        for region in self.registry.regions().iter().filter(|r| r.armed) {
            self.disarm(region);
        }
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        if self.state().is_active() {
            if let Err(err) = self.stop_default() {
                warn!(%err, "stop on drop failed");
            }
            return;
        }
        // Error or Initialized: release what initialize/start acquired.
        if let Some(rt) = self.runtime.lock().take() {
            self.shutdown(rt, self.config.engine.stop_timeout);
        }
    }
}

fn wait_until(deadline: Instant, mut done: impl FnMut() -> bool) -> bool {
    loop {
        if done() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}
