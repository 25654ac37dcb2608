use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

use crate::models::SyncRecord;

/// FIFO of local writes waiting for the backing store
///
/// Shared by every component that writes; push order is the local causal
/// order replay follows.
#[derive(Debug, Clone, Default)]
pub struct Outbox {
    queue: Arc<Mutex<VecDeque<SyncRecord>>>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<SyncRecord>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, record: SyncRecord) {
        self.lock().push_back(record);
    }

    pub fn front(&self) -> Option<SyncRecord> {
        self.lock().front().cloned()
    }

    /// Remove the head, but only if it is still the record we replayed
    pub fn pop_if(&self, record_id: Uuid) -> bool {
        let mut queue = self.lock();
        if queue.front().map(|r| r.id) == Some(record_id) {
            queue.pop_front();
            true
        } else {
            false
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn snapshot(&self) -> Vec<SyncRecord> {
        self.lock().iter().cloned().collect()
    }
}
