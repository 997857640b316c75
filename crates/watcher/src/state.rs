#![forbid(unsafe_code)]

//! Lifecycle of a [`crate::Watcher`].
//!
//! ```text
//! Uninitialized --initialize--> Initialized --start--> Running <--pause/resume--> Paused
//!        |                                                 \                        /
//!        +--initialize fails--> Error                       +------stop-----> Stopped
//! ```
//!
//! Any state may move to `Error` on an unrecoverable internal fault.

use crate::error::Error;
use parking_lot::Mutex;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CoreState {
    Uninitialized,
    Initialized,
    Running,
    Paused,
    Stopped,
    Error,
}

impl CoreState {
    /// Threads are up and armed regions raise faults.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }

    pub fn accepts_registration(self) -> bool {
        !matches!(self, Self::Stopped | Self::Error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Initialize,
    Start,
    Pause,
    Resume,
    Stop,
}

impl Transition {
    pub const ALL: [Transition; 5] = [
        Self::Initialize,
        Self::Start,
        Self::Pause,
        Self::Resume,
        Self::Stop,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Initialize => "initialize",
            Self::Start => "start",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Stop => "stop",
        }
    }

    /// Target state when fired from `from`, or `None` if illegal there.
    pub fn target(self, from: CoreState) -> Option<CoreState> {
        use CoreState::*;
        match (self, from) {
            (Self::Initialize, Uninitialized) => Some(Initialized),
            (Self::Start, Initialized) => Some(Running),
            (Self::Pause, Running) => Some(Paused),
            (Self::Resume, Paused) => Some(Running),
            (Self::Stop, Running | Paused) => Some(Stopped),
            _ => None,
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: CoreState,
    error: String,
}

/// The single state cell every component consults before mutating anything.
#[derive(Debug)]
pub struct Lifecycle {
    inner: Mutex<Inner>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: CoreState::Uninitialized,
                error: String::new(),
            }),
        }
    }
}

impl Lifecycle {
    pub fn state(&self) -> CoreState {
        self.inner.lock().state
    }

    pub fn error_message(&self) -> String {
        self.inner.lock().error.clone()
    }

    /// Validate `transition` without applying it.
    pub fn check(&self, transition: Transition) -> Result<CoreState, Error> {
        let state = self.state();
        transition
            .target(state)
            .ok_or_else(|| Error::state(transition.name(), state))
    }

    pub fn apply(&self, transition: Transition) -> Result<CoreState, Error> {
        let mut inner = self.inner.lock();
        let target = transition
            .target(inner.state)
            .ok_or_else(|| Error::state(transition.name(), inner.state))?;
        inner.state = target;
        Ok(target)
    }

    /// Move to `Error`. An empty message is replaced so callers always get a
    /// diagnostic.
    pub fn fail(&self, message: impl Into<String>) {
        let mut message = message.into();
        if message.is_empty() {
            message = "internal error".into();
        }
        let mut inner = self.inner.lock();
        inner.state = CoreState::Error;
        inner.error = message;
    }

    /// Fail fast unless the current state satisfies `allowed`.
    pub fn require(
        &self,
        operation: &'static str,
        allowed: impl Fn(CoreState) -> bool,
    ) -> Result<CoreState, Error> {
        let state = self.state();
        if allowed(state) {
            Ok(state)
        } else {
            Err(Error::state(operation, state))
        }
    }
}
