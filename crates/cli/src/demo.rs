//! Counter workload used by `memwatch watch`.

use crate::cli::WatchArgs;
use crate::filter::CommandFilter;
use config::{Backend, Config};
use std::sync::Arc;
use tracing::{debug, info};
use watcher::{
    LoggingFilter, ManualBackend, MetricsSnapshot, MutationDepth, PageBuffer, RegionId, Services,
    TrackFlags, Watcher,
};

/// Apply command-line overrides on top of the loaded configuration.
pub fn apply_overrides(config: &mut Config, args: &WatchArgs) {
    if let Some(backend) = args.backend {
        config.engine.backend = backend.into();
    }
    if let Some(output) = &args.output {
        config.persistence.output_dir = output.clone();
    }
}

struct Counter {
    id: RegionId,
    memory: PageBuffer,
}

/// A running watcher plus the counters it watches.
pub struct Workload {
    // Declared first so it stops before the counters are unmapped.
    watcher: Watcher,
    manual: Option<Arc<ManualBackend>>,
    counters: Vec<Counter>,
}

impl Workload {
    pub fn start(config: Config, args: &WatchArgs) -> anyhow::Result<Self> {
        let mut services = Services::from_config(&config)?;
        let manual = (config.engine.backend == Backend::Manual).then(|| {
            let backend = Arc::new(ManualBackend::new());
            services.backend = backend.clone();
            backend
        });
        if let Some(command) = &args.filter_cmd {
            services = services.with_filter(Arc::new(CommandFilter::spawn(command)?));
        } else if args.log_events {
            services = services.with_filter(Arc::new(LoggingFilter));
        }

        let watcher = Watcher::new(config, services);
        watcher.initialize_from_config()?;
        watcher.start()?;

        let mut workload = Self {
            watcher,
            manual,
            counters: Vec::with_capacity(args.regions),
        };
        for i in 0..args.regions {
            let memory = PageBuffer::new(1)?;
            // SAFETY: the buffer is owned by the workload and outlives the
            // watcher, see the field order of `Workload`.
            #[allow(unsafe_code)]
            let id = unsafe {
                workload.watcher.register_region(
                    memory.base_address(),
                    memory.len(),
                    &format!("counter-{i}"),
                    TrackFlags::THREADS,
                    MutationDepth::Full,
                )
            }?;
            workload.counters.push(Counter { id, memory });
        }
        info!(regions = args.regions, "demo workload running");
        Ok(workload)
    }

    /// Increment byte 0 of every counter once.
    pub fn tick(&self) {
        for counter in &self.counters {
            let value = counter.memory.read(0).wrapping_add(1);
            counter.memory.write(0, &[value]);
            if let Some(manual) = &self.manual {
                manual.notify_write(counter.memory.base_address());
            }
            debug!(region = %counter.id, value, "counter incremented");
        }
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.watcher.metrics()
    }

    /// Stop the watcher and return the final metrics.
    pub fn finish(self) -> anyhow::Result<MetricsSnapshot> {
        let graceful = self.watcher.stop_default()?;
        if !graceful {
            tracing::warn!("watcher did not drain in time");
        }
        Ok(self.watcher.metrics())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::{BackendArg, WatchArgs};
    use std::time::{Duration, Instant};

    fn args(dir: &std::path::Path) -> WatchArgs {
        WatchArgs {
            regions: 2,
            iterations: Some(3),
            interval: 1,
            backend: Some(BackendArg::Manual),
            filter_cmd: None,
            log_events: false,
            output: Some(dir.to_path_buf()),
        }
    }

    #[test]
    fn overrides_replace_backend_and_output() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        apply_overrides(&mut config, &args(dir.path()));
        assert_eq!(config.engine.backend, Backend::Manual);
        assert_eq!(config.persistence.output_dir, dir.path());
    }

    #[test]
    fn workload_records_every_tick() {
        let dir = tempfile::tempdir().unwrap();
        let args = args(dir.path());
        let mut config = Config::default();
        config.persistence.fsync = false;
        apply_overrides(&mut config, &args);

        let workload = Workload::start(config, &args).unwrap();
        for round in 1..=3u64 {
            workload.tick();
            let deadline = Instant::now() + Duration::from_secs(10);
            while workload.metrics().events_received < round * 2 {
                assert!(Instant::now() < deadline, "timed out");
                std::thread::sleep(Duration::from_millis(2));
            }
        }
        let metrics = workload.finish().unwrap();
        assert_eq!(metrics.events_processed, 6);
        assert_eq!(metrics.events_dropped, 0);
    }
}
