//! In-memory registry of live jobs and their cancel handles.

use std::sync::Arc;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use ra_core::JobId;

/// Process-wide `job id -> cancel token` map.
///
/// An entry exists exactly while the job's unit of work is alive: it is
/// inserted at submission and removed by the task's completion path.
#[derive(Debug, Clone, Default)]
pub struct CancelRegistry {
    tokens: Arc<DashMap<JobId, CancellationToken>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: JobId, token: CancellationToken) {
        self.tokens.insert(id, token);
    }

    pub fn remove(&self, id: JobId) -> Option<CancellationToken> {
        self.tokens.remove(&id).map(|(_, token)| token)
    }

    pub fn get(&self, id: JobId) -> Option<CancellationToken> {
        self.tokens.get(&id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, id: JobId) -> bool {
        self.tokens.contains_key(&id)
    }

    /// Ids of every live job.
    pub fn ids(&self) -> Vec<JobId> {
        self.tokens.iter().map(|entry| *entry.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Remove `id` when the returned guard drops, including during a panic unwind.
    pub fn guard(&self, id: JobId) -> Registration {
        Registration {
            registry: self.clone(),
            id,
        }
    }
}

/// Drop guard returned by [`CancelRegistry::guard`].
#[derive(Debug)]
pub struct Registration {
    registry: CancelRegistry,
    id: JobId,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}
