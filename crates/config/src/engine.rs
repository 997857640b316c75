use crate::backend::Backend;
use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use std::time::Duration;

/// Upper bound on the enrichment worker pool.
pub const MAX_WORKERS: usize = 8;

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Engine {
    /// Capacity of the fast-path event queue, shared by all worker
    /// partitions. A fault that finds it full is dropped and counted.
    pub max_queue_size: usize,

    /// Number of enrichment workers. Every region is pinned to one worker,
    /// so mutations of a single region are always enriched in order.
    pub workers: usize,

    /// Poll timeout of the fault-handling loop. **Measured in milliseconds**.
    ///
    /// ## Note
    ///
    /// This bounds how long `stop()` waits for the handler thread to notice
    /// the shutdown request.
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub poll_interval: Duration,

    /// Grace period between releasing a faulted page and write-protecting
    /// it again. **Measured in microseconds**.
    ///
    /// Writes that land inside this window are folded into the next
    /// observed mutation of the region.
    #[serde_as(as = "serde_with::DurationMicroSeconds<u64>")]
    pub rearm_delay: Duration,

    /// Default drain timeout used by `stop()`. **Measured in milliseconds**.
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub stop_timeout: Duration,

    /// Fault interception backend. See [`Backend`].
    pub backend: Backend,
}

impl Default for Engine {
    fn default() -> Self {
        Self {
            max_queue_size: 10_000,
            workers: 3,
            poll_interval: Duration::from_millis(100),
            rearm_delay: Duration::from_micros(200),
            stop_timeout: Duration::from_millis(5000),
            backend: Backend::default(),
        }
    }
}

impl Engine {
    pub fn clamp(&mut self) {
        self.workers = self.workers.clamp(1, MAX_WORKERS);
        self.max_queue_size = self.max_queue_size.max(1);
        if self.poll_interval.is_zero() {
            self.poll_interval = Duration::from_millis(1);
        }
    }
}
