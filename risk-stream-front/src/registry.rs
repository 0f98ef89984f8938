//! Active run registry.
//!
//! Maps a thread to the run currently considered active for it. A single
//! instance is built at startup and shared by every component as
//! `Arc<dyn RunRegistry>`.

use crate::types::ids::{RunId, ThreadId};
use dashmap::DashMap;
use std::sync::Arc;

pub trait RunRegistry: Send + Sync {
    /// Active run for the thread.
    ///
    /// Returns the thread id itself (as a run id) when nothing is registered.
    /// Callers must tolerate that value.
    fn get(&self, thread_id: &ThreadId) -> RunId;

    fn set(&self, thread_id: &ThreadId, run_id: RunId);

    fn clear(&self, thread_id: &ThreadId);

    /// Registered run, without the thread id fallback
    fn active(&self, thread_id: &ThreadId) -> Option<RunId>;

    /// Clear the entry only if it still holds `run_id`. Returns whether it did.
    fn clear_if(&self, thread_id: &ThreadId, run_id: &RunId) -> bool;

    fn contains(&self, thread_id: &ThreadId) -> bool {
        self.active(thread_id).is_some()
    }
}

pub type SharedRunRegistry = Arc<dyn RunRegistry>;

/// In-memory registry with per-entry locking.
#[derive(Debug, Default)]
pub struct InMemoryRunRegistry {
    runs: DashMap<ThreadId, RunId>,
}

impl InMemoryRunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedRunRegistry {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}

impl RunRegistry for InMemoryRunRegistry {
    fn get(&self, thread_id: &ThreadId) -> RunId {
        self.active(thread_id)
            .unwrap_or_else(|| thread_id.as_run_id())
    }

    fn set(&self, thread_id: &ThreadId, run_id: RunId) {
        tracing::debug!("active run for thread {} set to {}", thread_id, run_id);
        self.runs.insert(thread_id.clone(), run_id);
    }

    fn clear(&self, thread_id: &ThreadId) {
        if let Some((_, run_id)) = self.runs.remove(thread_id) {
            tracing::debug!("active run {} cleared for thread {}", run_id, thread_id);
        }
    }

    fn active(&self, thread_id: &ThreadId) -> Option<RunId> {
        self.runs.get(thread_id).map(|r| r.value().clone())
    }

    fn clear_if(&self, thread_id: &ThreadId, run_id: &RunId) -> bool {
        let removed = self
            .runs
            .remove_if(thread_id, |_, current| current == run_id)
            .is_some();
        if !removed {
            tracing::debug!(
                "registry entry for thread {} no longer holds run {}, left untouched",
                thread_id,
                run_id
            );
        }
        removed
    }
}
