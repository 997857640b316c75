use crate::state::CoreState;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Fault interception unavailable: {0}")]
    Platform(String),

    #[error("Cannot {operation} while {state:?}")]
    State {
        operation: &'static str,
        state: CoreState,
    },

    #[error("Region registration failed: {0}")]
    Allocation(String),

    #[error("Snapshot length mismatch: before has {before} bytes, after has {after}")]
    LengthMismatch { before: usize, after: usize },

    #[error("Failed to persist event: {0}")]
    Persistence(std::io::Error),

    #[error("Filter did not answer within {0:?}")]
    CallbackTimeout(Duration),

    #[error("Filter failed: {0}")]
    Callback(String),

    #[error("Failed to load config: {0}")]
    Config(#[from] config::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn state(operation: &'static str, state: CoreState) -> Self {
        Self::State { operation, state }
    }
}
