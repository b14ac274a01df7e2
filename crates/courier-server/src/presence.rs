//! In-memory presence registry.
//!
//! Maps authenticated identities to the push channel of their live
//! connection. One connection per identity: a later sign-in displaces the
//! earlier one (the displaced entry is returned so the server can notify
//! that connection before dropping it).

use courier_core::messages::Envelope;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

/// A live connection for one identity.
#[derive(Clone)]
pub struct PresenceEntry {
    /// Connection id assigned at handshake, used to guard unregistration.
    pub connection_id: String,
    /// Push channel into the connection's session loop.
    pub sender: mpsc::Sender<Envelope>,
}

#[derive(Clone)]
pub struct PresenceRegistry {
    entries: Arc<RwLock<HashMap<String, PresenceEntry>>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a connection for `identity`.
    ///
    /// Returns the entry it displaced, if the identity was already online.
    pub async fn register(&self, identity: &str, entry: PresenceEntry) -> Option<PresenceEntry> {
        let mut entries = self.entries.write().await;
        let displaced = entries.insert(identity.to_string(), entry);
        debug!(identity = %identity, displaced = displaced.is_some(), "presence registered");
        displaced
    }

    /// Remove the registration for `identity`, but only if it still belongs
    /// to `connection_id`. A connection displaced by a newer sign-in must
    /// not tear down its successor's entry.
    pub async fn unregister(&self, identity: &str, connection_id: &str) {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get(identity) {
            if entry.connection_id == connection_id {
                entries.remove(identity);
                debug!(identity = %identity, "presence unregistered");
            }
        }
    }

    /// Look up the live connection for `identity`.
    pub async fn lookup(&self, identity: &str) -> Option<PresenceEntry> {
        self.entries.read().await.get(identity).cloned()
    }

    pub async fn is_online(&self, identity: &str) -> bool {
        self.entries.read().await.contains_key(identity)
    }

    /// Number of identities currently online.
    pub async fn count(&self) -> usize {
        self.entries.read().await.len()
    }
}

impl Default for PresenceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
