#![deny(unsafe_code)]

//! Page-fault-driven mutation watcher.
//!
//! Watched regions are write protected. Every write faults into a single
//! handler thread that records where and by whom the write happened, lets
//! the write complete and protects the page again. Enrichment workers then
//! diff the region against its last snapshot, resolve the writing code
//! location, attach thread/SQL/scope context, run an optional filter and
//! append one JSON line per mutation to the event log.
//!
//! ```no_run
//! use watcher::{MutationDepth, PageBuffer, Services, TrackFlags, Watcher};
//!
//! # fn main() -> Result<(), watcher::Error> {
//! let config = config::Config::default();
//! let watcher = Watcher::new(config.clone(), Services::from_config(&config)?);
//! watcher.initialize("memwatch-out", 10_000)?;
//! watcher.start()?;
//!
//! let counter = PageBuffer::new(1)?;
//! // SAFETY: `counter` stays mapped until the watcher is stopped.
//! let id = unsafe {
//!     watcher.register_region(
//!         counter.base_address(),
//!         counter.len(),
//!         "counter",
//!         TrackFlags::THREADS,
//!         MutationDepth::Full,
//!     )?
//! };
//! counter.write(0, &[1]);
//! watcher.unregister(&id);
//! watcher.stop_default()?;
//! # Ok(())
//! # }
//! ```

mod clock;
mod context;
mod delta;
mod domain;
mod engine;
mod enrich;
mod error;
pub mod fault;
mod filter;
pub mod memory;
mod metrics;
mod queue;
mod registry;
mod state;
mod symbols;
mod writer;

pub use clock::{Clock, ManualClock, SystemClock};
pub use context::{ScopeClassifier, SqlContextGuard, SqlContextRegistry};
pub use delta::{compute_deltas, compute_region_deltas};
pub use domain::{
    ByteDelta, EnrichedEvent, EventId, EventRecord, FastPathEvent, MutationDepth, RegionId,
    RegionMetadata, SqlContext, Symbol, TrackFlags, WatchedRegion,
};
pub use engine::{Services, Watcher};
pub use error::Error;
pub use fault::{FaultBackend, ManualBackend, RawFault, UffdBackend};
pub use filter::{
    EventFilter, FilterAction, LoggingFilter, PassFilter, PredicateFilter, TimedFilter,
};
pub use memory::PageBuffer;
pub use metrics::MetricsSnapshot;
pub use queue::{EventQueue, PartitionedQueue};
pub use registry::RegionInfo;
pub use state::CoreState;
pub use symbols::{BacktraceSymbolizer, SymbolCache, SymbolResolver, Symbolizer};
pub use writer::{EventWriter, WriterStats};
