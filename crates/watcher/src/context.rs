#![forbid(unsafe_code)]

//! Context supplied by the adapter layer and attached during enrichment.

use crate::domain::SqlContext;
use config::{Scope, ScopeMap};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::Arc;

fn current_tid() -> u32 {
    nix::unistd::gettid().as_raw() as u32
}

/// SQL activity per OS thread.
///
/// Database adapters publish what a thread is executing; enrichment looks up
/// the thread that caused a mutation. The core never interprets the context
/// beyond serializing it.
#[derive(Debug, Default)]
pub struct SqlContextRegistry {
    by_thread: RwLock<FxHashMap<u32, SqlContext>>,
}

impl SqlContextRegistry {
    pub fn set(&self, thread_id: u32, context: SqlContext) -> Option<SqlContext> {
        self.by_thread.write().insert(thread_id, context)
    }

    pub fn clear(&self, thread_id: u32) -> Option<SqlContext> {
        self.by_thread.write().remove(&thread_id)
    }

    pub fn get(&self, thread_id: u32) -> Option<SqlContext> {
        self.by_thread.read().get(&thread_id).cloned()
    }

    /// Publish `context` for the calling thread until the guard is dropped.
    /// The previous context of the thread, if any, is restored afterwards.
    pub fn enter(self: &Arc<Self>, context: SqlContext) -> SqlContextGuard {
        let thread_id = current_tid();
        let previous = self.set(thread_id, context);
        SqlContextGuard {
            registry: Arc::clone(self),
            thread_id,
            previous,
        }
    }

    pub fn len(&self) -> usize {
        self.by_thread.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug)]
#[must_use = "the context is cleared when the guard is dropped"]
pub struct SqlContextGuard {
    registry: Arc<SqlContextRegistry>,
    thread_id: u32,
    previous: Option<SqlContext>,
}

impl Drop for SqlContextGuard {
    fn drop(&mut self) {
        match self.previous.take() {
            Some(previous) => {
                self.registry.set(self.thread_id, previous);
            }
            None => {
                self.registry.clear(self.thread_id);
            }
        }
    }
}

/// Classifies variables using an optional scope declaration file.
#[derive(Debug, Default, Clone)]
pub struct ScopeClassifier {
    map: Option<Arc<ScopeMap>>,
}

impl ScopeClassifier {
    pub fn new(map: Option<ScopeMap>) -> Self {
        Self {
            map: map.map(Arc::new),
        }
    }

    /// Scope of `name` as declared for `file`; [`Scope::Unknown`] when nothing
    /// matches or no declarations were loaded.
    pub fn classify(&self, file: &str, name: &str) -> Scope {
        self.map
            .as_deref()
            .and_then(|map| map.scope_of(file, name))
            .unwrap_or(Scope::Unknown)
    }
}
