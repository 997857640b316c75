use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// How enriched events reach the log file.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteMode {
    /// Every record is written and line-flushed by the enrichment worker.
    #[default]
    #[serde(rename = "sync")]
    Sync,

    /// Records go through a bounded buffer drained by a dedicated writer
    /// thread. Records that do not fit the buffer are counted as lost.
    #[serde(rename = "batched")]
    Batched,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Persistence {
    /// Directory that receives the event log. Created if missing.
    pub output_dir: PathBuf,

    /// Name of the JSON-lines log inside `output_dir`.
    pub file_name: String,

    pub mode: WriteMode,

    /// Capacity of the in-memory buffer in batched mode.
    pub buffer_events: usize,

    /// Number of records the writer thread collects before flushing.
    pub batch_size: usize,

    /// Whether `flush()` also syncs file data to the device.
    pub fsync: bool,

    /// Extra attempts for a record whose write failed. A record that still
    /// fails is counted as lost.
    pub write_retries: u32,
}

impl Default for Persistence {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("memwatch-out"),
            file_name: "events.jsonl".into(),
            mode: WriteMode::default(),
            buffer_events: 10_000,
            batch_size: 100,
            fsync: true,
            write_retries: 1,
        }
    }
}
