#![forbid(unsafe_code)]

mod event;
mod ids;
mod region;

pub use event::{ByteDelta, EnrichedEvent, EventRecord, FastPathEvent, SqlContext, Symbol};
pub use ids::{EventId, RegionId};
pub use region::{MutationDepth, RegionMetadata, TrackFlags, WatchedRegion};
