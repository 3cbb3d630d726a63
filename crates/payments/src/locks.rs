//! Per-transaction single-writer tokens.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use common::TransactionId;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type Slots = Arc<Mutex<HashMap<TransactionId, Arc<AsyncMutex<()>>>>>;

/// In-process exclusivity per transaction id.
///
/// Only the holder of a transaction's token may advance it. Across
/// processes the store's version check rejects concurrent writers instead.
#[derive(Clone, Default)]
pub struct TransactionLocks {
    slots: Slots,
}

impl TransactionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for the token of `id`.
    pub async fn acquire(&self, id: TransactionId) -> TransactionGuard {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots.entry(id).or_default().clone()
        };

        TransactionGuard {
            id,
            slots: self.slots.clone(),
            guard: Some(slot.lock_owned().await),
        }
    }

    /// Number of transactions with a held or awaited token.
    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Holds a transaction's token until dropped.
pub struct TransactionGuard {
    id: TransactionId,
    slots: Slots,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for TransactionGuard {
    fn drop(&mut self) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        // The map and this guard hold the only references: nobody is waiting.
        if let Some(guard) = &self.guard
            && Arc::strong_count(OwnedMutexGuard::mutex(guard)) <= 2
        {
            slots.remove(&self.id);
        }
        self.guard.take();
    }
}
