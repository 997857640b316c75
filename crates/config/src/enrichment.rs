use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use std::path::PathBuf;
use std::time::Duration;

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Enrichment {
    /// Time a user filter gets to answer before the event is passed through
    /// unchanged. **Measured in milliseconds**.
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub filter_timeout: Duration,

    /// Maximum number of resolved instruction pointers kept in memory. The
    /// least recently used entry is evicted first.
    pub symbol_cache_capacity: usize,

    /// Age after which a cached symbol is resolved again. **Measured in
    /// seconds**.
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    pub symbol_cache_ttl: Duration,

    /// Optional scope declaration file used to classify variables as
    /// `local`, `global` or `both`. See [`crate::ScopeMap`] for the format.
    pub scope_file: Option<PathBuf>,
}

impl Default for Enrichment {
    fn default() -> Self {
        Self {
            filter_timeout: Duration::from_millis(100),
            symbol_cache_capacity: 1000,
            symbol_cache_ttl: Duration::from_secs(3600),
            scope_file: None,
        }
    }
}
