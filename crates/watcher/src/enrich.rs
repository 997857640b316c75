//! Background enrichment: fast-path event in, persisted record out.

use crate::context::{ScopeClassifier, SqlContextRegistry};
use crate::delta::compute_region_deltas;
use crate::domain::{EnrichedEvent, FastPathEvent, MutationDepth};
use crate::filter::{FilterAction, TimedFilter};
use crate::metrics::Metrics;
use crate::queue::PartitionedQueue;
use crate::registry::Registry;
use crate::symbols::SymbolResolver;
use crate::writer::EventLog;
use serde_json::Map;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Shared, stateless part of enrichment. One instance serves every worker.
pub(crate) struct Enricher {
    pub registry: Arc<Registry>,
    pub resolver: Arc<SymbolResolver>,
    pub sql: Arc<SqlContextRegistry>,
    pub scopes: ScopeClassifier,
    pub metrics: Arc<Metrics>,
    pub log: Arc<EventLog>,
}

impl Enricher {
    /// Build the enriched event. `None` when the region is gone or nothing
    /// inside its tracked window changed.
    pub fn enrich(&self, event: &FastPathEvent) -> Option<EnrichedEvent> {
        let Some(observation) = self.registry.observe(event.region_base) else {
            self.metrics.record_unresolved();
            trace!(event = %event.id, "region unregistered before enrichment");
            return None;
        };
        let region = observation.region;

        let deltas = match compute_region_deltas(&observation.before, &observation.after, region.depth)
        {
            Ok(deltas) => deltas,
            Err(err) => {
                warn!(%err, region = %region.id, "snapshot out of sync with region");
                Vec::new()
            }
        };
        if deltas.is_empty() && matches!(region.depth, MutationDepth::Range { .. }) {
            self.metrics.record_filtered();
            trace!(event = %event.id, "write outside tracked range");
            return None;
        }

        let symbol = self.resolver.resolve(event.instruction_pointer);
        let sql_context = region
            .flags
            .wants_sql()
            .then(|| event.thread_id.and_then(|tid| self.sql.get(tid)))
            .flatten();
        let scope = region
            .flags
            .wants_scope()
            .then(|| self.scopes.classify(&symbol.file, &region.name));

        Some(EnrichedEvent {
            id: event.id,
            timestamp_ns: event.timestamp_ns,
            symbol,
            thread_id: event.thread_id,
            deltas,
            region_id: region.id,
            region_name: region.name,
            sql_context,
            scope,
            annotations: Map::new(),
        })
    }

    /// Enrich, filter and persist one event.
    pub fn process(&self, event: &FastPathEvent, filter: Option<&TimedFilter>) {
        let started = Instant::now();
        let Some(mut enriched) = self.enrich(event) else {
            return;
        };

        if let Some(filter) = filter {
            match filter.apply(enriched.record()) {
                Ok(FilterAction::Pass) => {}
                Ok(FilterAction::Drop) => {
                    self.metrics.record_filtered();
                    self.metrics.record_enrichment(started.elapsed());
                    trace!(event = %event.id, "dropped by filter");
                    return;
                }
                Ok(FilterAction::Annotate { annotations }) => enriched.merge_annotations(annotations),
                Ok(FilterAction::Enrich { extra }) => enriched.merge_annotations(extra),
                Err(err) => {
                    self.metrics.record_callback_failure();
                    debug!(%err, event = %event.id, "filter failed, passing event");
                }
            }
        }

        self.metrics.record_enrichment(started.elapsed());
        self.log.submit(&enriched.record());
    }
}

/// How workers should wind down.
#[derive(Debug, Default)]
pub(crate) struct Shutdown {
    /// Finish whatever is queued, then exit.
    pub drain: AtomicBool,
    /// Exit as soon as the current event is done.
    pub abort: AtomicBool,
}

/// One enrichment thread bound to one queue partition.
pub(crate) struct Worker {
    pub index: usize,
    pub enricher: Arc<Enricher>,
    pub filter: Option<TimedFilter>,
    pub queue: Arc<PartitionedQueue>,
    pub shutdown: Arc<Shutdown>,
}

impl Worker {
    const MIN_BACKOFF: Duration = Duration::from_micros(50);
    const MAX_BACKOFF: Duration = Duration::from_millis(5);

    pub fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name(format!("memwatch-enrich-{}", self.index))
            .spawn(move || self.run())
    }

    fn run(self) {
        debug!(worker = self.index, "enrichment worker started");
        let mut backoff = Self::MIN_BACKOFF;

        while !self.shutdown.abort.load(Ordering::Acquire) {
            match self.queue.dequeue(self.index) {
                Some(event) => {
                    backoff = Self::MIN_BACKOFF;
                    self.enricher.process(&event, self.filter.as_ref());
                }
                None if self.shutdown.drain.load(Ordering::Acquire) => break,
                None => {
                    std::thread::sleep(backoff);
                    backoff = (backoff * 2).min(Self::MAX_BACKOFF);
                }
            }
        }
        debug!(worker = self.index, "enrichment worker exited");
    }
}
