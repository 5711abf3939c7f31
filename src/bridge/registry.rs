use super::sink::ResultSink;
use crate::transfer::TransferId;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::warn;

/// A caller-initiated download that has not been resolved yet.
#[derive(Debug)]
pub struct PendingRequest {
    pub destination_path: String,
    pub sink: ResultSink,
}

impl PendingRequest {
    pub fn new(destination_path: impl Into<String>, sink: ResultSink) -> Self {
        Self {
            destination_path: destination_path.into(),
            sink,
        }
    }
}

/// Maps transfer identifiers to the requests waiting on them.
///
/// Every removal goes through [`take_and_remove`](Self::take_and_remove), so
/// a given entry is handed out at most once no matter how many callers race
/// for it.
#[derive(Debug, Default)]
pub struct CompletionRegistry {
    entries: Mutex<HashMap<TransferId, PendingRequest>>,
}

impl CompletionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<TransferId, PendingRequest>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, id: TransferId, pending: PendingRequest) {
        if let Some(previous) = self.entries().insert(id, pending) {
            // Identifiers are fresh per enqueue; a collision means the service reused one.
            warn!(
                "Transfer {} was already registered for {}, replacing it",
                id, previous.destination_path
            );
        }
    }

    pub fn take_and_remove(&self, id: TransferId) -> Option<PendingRequest> {
        self.entries().remove(&id)
    }

    pub fn contains(&self, id: TransferId) -> bool {
        self.entries().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    pub fn ids(&self) -> Vec<TransferId> {
        self.entries().keys().copied().collect()
    }
}
