//! In-process exclusion for runs sharing a batch key.
//!
//! Only covers one process. Two collector processes can still race on the
//! same key; the store's unique partition key is the backstop there.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use crate::pipeline::model::BatchKey;

type Slot = (String, BatchKey);

#[derive(Debug, Clone, Default)]
pub struct RunGuard {
    active: Arc<Mutex<HashSet<Slot>>>,
}

impl RunGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` when a run for the same collection and batch key is in flight.
    pub fn try_acquire(&self, collection: &str, key: &BatchKey) -> Option<RunLease> {
        let slot = (collection.to_string(), key.clone());
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if !active.insert(slot.clone()) {
            return None;
        }
        Some(RunLease {
            active: Arc::clone(&self.active),
            slot,
        })
    }

    pub fn is_active(&self, collection: &str, key: &BatchKey) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&(collection.to_string(), key.clone()))
    }
}

/// Released on drop.
#[derive(Debug)]
pub struct RunLease {
    active: Arc<Mutex<HashSet<Slot>>>,
    slot: Slot,
}

impl Drop for RunLease {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.slot);
    }
}
