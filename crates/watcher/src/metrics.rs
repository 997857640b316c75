#![forbid(unsafe_code)]

use crate::writer::WriterStats;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Counters shared by the handler, the workers and the lifecycle code.
#[derive(Debug, Default)]
pub struct Metrics {
    events_received: AtomicU64,
    queue_full: AtomicU64,
    unresolved: AtomicU64,
    events_filtered: AtomicU64,
    callbacks_failed: AtomicU64,
    events_lost_on_stop: AtomicU64,
    protection_failures: AtomicU64,
    forced_detaches: AtomicU64,
    enriched: AtomicU64,
    enrichment_nanos: AtomicU64,
}

impl Metrics {
    pub fn record_received(&self) {
        self.events_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_queue_full(&self) {
        self.queue_full.fetch_add(1, Ordering::Relaxed);
    }

    /// The event's region was unregistered before it could be enriched.
    pub fn record_unresolved(&self) {
        self.unresolved.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_filtered(&self) {
        self.events_filtered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_callback_failure(&self) {
        self.callbacks_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lost_on_stop(&self, count: u64) {
        self.events_lost_on_stop.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_protection_failure(&self) {
        self.protection_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_forced_detach(&self) {
        self.forced_detaches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_enrichment(&self, took: Duration) {
        self.enriched.fetch_add(1, Ordering::Relaxed);
        self.enrichment_nanos
            .fetch_add(took.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn callbacks_failed(&self) -> u64 {
        self.callbacks_failed.load(Ordering::Relaxed)
    }

    /// Combine the counters with the live queue depth and writer stats.
    pub fn snapshot(&self, queue_depth: usize, writer: WriterStats) -> MetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        let enriched = load(&self.enriched);
        let mean_enrichment_latency_ms = if enriched == 0 {
            0.0
        } else {
            load(&self.enrichment_nanos) as f64 / enriched as f64 / 1_000_000.0
        };
        let events_lost_on_stop = load(&self.events_lost_on_stop);

        MetricsSnapshot {
            events_received: load(&self.events_received),
            events_processed: writer.written,
            events_dropped: load(&self.queue_full)
                + load(&self.unresolved)
                + writer.lost
                + events_lost_on_stop,
            callbacks_failed: load(&self.callbacks_failed),
            queue_depth,
            mean_enrichment_latency_ms,
            events_filtered: load(&self.events_filtered),
            events_lost_on_stop,
            protection_failures: load(&self.protection_failures),
            forced_detaches: load(&self.forced_detaches),
            writer,
        }
    }
}

/// Point-in-time view of every counter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    /// Faults turned into queued fast-path events.
    pub events_received: u64,
    /// Records handed to the event log.
    pub events_processed: u64,
    /// Queue-full drops, events whose region vanished, persistence losses and
    /// events abandoned at shutdown.
    pub events_dropped: u64,
    pub callbacks_failed: u64,
    pub queue_depth: usize,
    pub mean_enrichment_latency_ms: f64,
    /// Removed on request of the user filter. Not a failure.
    pub events_filtered: u64,
    pub events_lost_on_stop: u64,
    pub protection_failures: u64,
    pub forced_detaches: u64,
    pub writer: WriterStats,
}
