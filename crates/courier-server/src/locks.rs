//! Per-conversation locks.
//!
//! Message sends within one conversation are serialized so stored order,
//! timestamps, and last-message updates agree. Different conversations
//! proceed in parallel.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Clone)]
pub struct ConversationLocks {
    inner: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl ConversationLocks {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Acquire the lock for `conversation_id`, waiting if another send in
    /// the same conversation is in flight.
    pub async fn acquire(&self, conversation_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().await;
            map.entry(conversation_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Drop locks nobody is holding or waiting on.
    pub async fn gc(&self) {
        let mut map = self.inner.lock().await;
        map.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    #[cfg(test)]
    async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }
}

impl Default for ConversationLocks {
    fn default() -> Self {
        Self::new()
    }
}
