//! SQLite persistence for users, conversations, and messages.
//!
//! The connection lives behind a mutex and all queries run on the blocking
//! pool. Conversation uniqueness is enforced at the storage level: the
//! participant pair is stored ordered (`user_lo` < `user_hi`) under a UNIQUE
//! constraint, and find-or-create races resolve to the surviving row.

use courier_core::messages::{ConversationSummary, WireMessage};
use courier_core::{CourierError, CourierResult};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS users (
        identity    TEXT PRIMARY KEY,
        created_at  INTEGER NOT NULL,
        last_seen   INTEGER
    );

    CREATE TABLE IF NOT EXISTS conversations (
        id              TEXT PRIMARY KEY,
        user_lo         TEXT NOT NULL REFERENCES users(identity),
        user_hi         TEXT NOT NULL REFERENCES users(identity),
        last_message_id TEXT,
        created_at      INTEGER NOT NULL,
        updated_at      INTEGER NOT NULL,
        UNIQUE (user_lo, user_hi)
    );

    CREATE TABLE IF NOT EXISTS messages (
        id              TEXT PRIMARY KEY,
        conversation_id TEXT NOT NULL REFERENCES conversations(id),
        sender          TEXT NOT NULL,
        receiver        TEXT NOT NULL,
        body            TEXT NOT NULL,
        timestamp       INTEGER NOT NULL,
        is_read         INTEGER NOT NULL DEFAULT 0
    );

    CREATE INDEX IF NOT EXISTS idx_messages_conversation
        ON messages(conversation_id, timestamp);
    CREATE INDEX IF NOT EXISTS idx_conversations_lo
        ON conversations(user_lo, updated_at);
    CREATE INDEX IF NOT EXISTS idx_conversations_hi
        ON conversations(user_hi, updated_at);
";

/// A registered user.
#[derive(Debug, Clone)]
pub struct UserRow {
    pub identity: String,
    pub created_at_ms: u64,
    pub last_seen_ms: Option<u64>,
}

/// A conversation between two users, participants stored ordered.
#[derive(Debug, Clone)]
pub struct ConversationRow {
    pub id: String,
    pub user_lo: String,
    pub user_hi: String,
    pub last_message_id: Option<String>,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
}

impl ConversationRow {
    pub fn involves(&self, identity: &str) -> bool {
        self.user_lo == identity || self.user_hi == identity
    }

    /// The other participant.
    pub fn peer_of(&self, identity: &str) -> &str {
        if self.user_lo == identity {
            &self.user_hi
        } else {
            &self.user_lo
        }
    }
}

/// Handle to the message database. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open or create a database at `path`. Creates the schema if needed.
    pub fn open(path: &Path) -> CourierResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .map_err(|e| CourierError::Persistence(format!("open {}: {e}", path.display())))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(|e| CourierError::Persistence(e.to_string()))?;
        Self::init(conn)
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> CourierResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| CourierError::Persistence(e.to_string()))?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(|e| CourierError::Persistence(e.to_string()))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> CourierResult<Self> {
        conn.execute_batch(SCHEMA)
            .map_err(|e| CourierError::Persistence(format!("schema init: {e}")))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn call<F, T>(&self, f: F) -> CourierResult<T>
    where
        F: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = match conn.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            f(&mut *guard)
        })
        .await
        .map_err(|e| CourierError::Persistence(format!("storage task failed: {e}")))?
        .map_err(|e| CourierError::Persistence(e.to_string()))
    }

    /// Create the user if absent, refresh `last_seen` either way.
    pub async fn upsert_user(&self, identity: &str, now_ms: u64) -> CourierResult<()> {
        let identity = identity.to_string();
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO users (identity, created_at, last_seen) VALUES (?1, ?2, ?2)
                 ON CONFLICT(identity) DO UPDATE SET last_seen = ?2",
                params![identity, now_ms as i64],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn find_user(&self, identity: &str) -> CourierResult<Option<UserRow>> {
        let identity = identity.to_string();
        self.call(move |conn| {
            let mut stmt =
                conn.prepare("SELECT identity, created_at, last_seen FROM users WHERE identity = ?1")?;
            let mut rows = stmt.query_map(params![identity], |row| {
                Ok(UserRow {
                    identity: row.get(0)?,
                    created_at_ms: row.get::<_, i64>(1)? as u64,
                    last_seen_ms: row.get::<_, Option<i64>>(2)?.map(|v| v as u64),
                })
            })?;
            rows.next().transpose()
        })
        .await
    }

    /// Best-effort activity stamp; callers log failures and move on.
    pub async fn touch_last_seen(&self, identity: &str, now_ms: u64) -> CourierResult<()> {
        let identity = identity.to_string();
        self.call(move |conn| {
            conn.execute(
                "UPDATE users SET last_seen = ?2 WHERE identity = ?1",
                params![identity, now_ms as i64],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_conversation(&self, id: &str) -> CourierResult<Option<ConversationRow>> {
        let id = id.to_string();
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_lo, user_hi, last_message_id, created_at, updated_at
                 FROM conversations WHERE id = ?1",
            )?;
            let mut rows = stmt.query_map(params![id], conversation_from_row)?;
            rows.next().transpose()
        })
        .await
    }

    /// Atomically find or create the conversation between `a` and `b`.
    ///
    /// Concurrent callers racing on the same pair both land on the row that
    /// won the insert: the UNIQUE constraint swallows the losing insert and
    /// the follow-up select inside the transaction returns the winner.
    pub async fn find_or_create_conversation(
        &self,
        a: &str,
        b: &str,
        now_ms: u64,
    ) -> CourierResult<ConversationRow> {
        let (lo, hi) = normalize_pair(a, b);
        let id = new_id();
        self.call(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO conversations (id, user_lo, user_hi, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)
                 ON CONFLICT(user_lo, user_hi) DO NOTHING",
                params![id, lo, hi, now_ms as i64],
            )?;
            let row = tx.query_row(
                "SELECT id, user_lo, user_hi, last_message_id, created_at, updated_at
                 FROM conversations WHERE user_lo = ?1 AND user_hi = ?2",
                params![lo, hi],
                conversation_from_row,
            )?;
            tx.commit()?;
            Ok(row)
        })
        .await
    }

    pub async fn insert_message(&self, message: WireMessage) -> CourierResult<()> {
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO messages (id, conversation_id, sender, receiver, body, timestamp, is_read)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    message.id,
                    message.conversation_id,
                    message.sender,
                    message.receiver,
                    message.text,
                    message.timestamp_ms as i64,
                    message.read as i32,
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Point the conversation at its newest message and bump `updated_at`.
    pub async fn set_last_message(
        &self,
        conversation_id: &str,
        message_id: &str,
        now_ms: u64,
    ) -> CourierResult<()> {
        let conversation_id = conversation_id.to_string();
        let message_id = message_id.to_string();
        self.call(move |conn| {
            conn.execute(
                "UPDATE conversations SET last_message_id = ?2, updated_at = ?3 WHERE id = ?1",
                params![conversation_id, message_id, now_ms as i64],
            )?;
            Ok(())
        })
        .await
    }

    /// Mark every unread message from `sender` to `reader` in the
    /// conversation as read. Returns how many rows changed; zero when there
    /// was nothing to mark (repeat call, or a caller who is not the
    /// receiver of anything there).
    pub async fn mark_read(
        &self,
        conversation_id: &str,
        sender: &str,
        reader: &str,
    ) -> CourierResult<u64> {
        let conversation_id = conversation_id.to_string();
        let sender = sender.to_string();
        let reader = reader.to_string();
        self.call(move |conn| {
            let affected = conn.execute(
                "UPDATE messages SET is_read = 1
                 WHERE conversation_id = ?1 AND sender = ?2 AND receiver = ?3 AND is_read = 0",
                params![conversation_id, sender, reader],
            )?;
            Ok(affected as u64)
        })
        .await
    }

    /// All conversations involving `identity`, most recently updated first,
    /// each with its last message and the caller's unread count.
    pub async fn list_conversations(
        &self,
        identity: &str,
    ) -> CourierResult<Vec<ConversationSummary>> {
        let identity = identity.to_string();
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT c.id,
                        CASE WHEN c.user_lo = ?1 THEN c.user_hi ELSE c.user_lo END,
                        c.updated_at,
                        (SELECT COUNT(*) FROM messages u
                          WHERE u.conversation_id = c.id AND u.receiver = ?1 AND u.is_read = 0),
                        m.id, m.sender, m.receiver, m.body, m.timestamp, m.is_read
                 FROM conversations c
                 LEFT JOIN messages m ON m.id = c.last_message_id
                 WHERE c.user_lo = ?1 OR c.user_hi = ?1
                 ORDER BY c.updated_at DESC",
            )?;
            let rows = stmt.query_map(params![identity], |row| {
                let conversation_id: String = row.get(0)?;
                let last_message = match row.get::<_, Option<String>>(4)? {
                    Some(id) => Some(WireMessage {
                        id,
                        conversation_id: conversation_id.clone(),
                        sender: row.get(5)?,
                        receiver: row.get(6)?,
                        text: row.get(7)?,
                        timestamp_ms: row.get::<_, i64>(8)? as u64,
                        read: row.get::<_, i32>(9)? != 0,
                    }),
                    None => None,
                };
                Ok(ConversationSummary {
                    conversation_id,
                    peer: row.get(1)?,
                    last_message,
                    unread: row.get::<_, i64>(3)? as u64,
                    updated_at_ms: row.get::<_, i64>(2)? as u64,
                })
            })?;
            rows.collect()
        })
        .await
    }

    /// The most recent `limit` messages of a conversation, oldest first.
    pub async fn list_messages(
        &self,
        conversation_id: &str,
        limit: u32,
    ) -> CourierResult<Vec<WireMessage>> {
        let conversation_id = conversation_id.to_string();
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, conversation_id, sender, receiver, body, timestamp, is_read
                 FROM messages WHERE conversation_id = ?1
                 ORDER BY timestamp DESC, id DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![conversation_id, limit as i64], |row| {
                Ok(WireMessage {
                    id: row.get(0)?,
                    conversation_id: row.get(1)?,
                    sender: row.get(2)?,
                    receiver: row.get(3)?,
                    text: row.get(4)?,
                    timestamp_ms: row.get::<_, i64>(5)? as u64,
                    read: row.get::<_, i32>(6)? != 0,
                })
            })?;
            let mut messages: Vec<WireMessage> = rows.collect::<rusqlite::Result<_>>()?;
            messages.reverse();
            Ok(messages)
        })
        .await
    }
}

fn conversation_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConversationRow> {
    Ok(ConversationRow {
        id: row.get(0)?,
        user_lo: row.get(1)?,
        user_hi: row.get(2)?,
        last_message_id: row.get(3)?,
        created_at_ms: row.get::<_, i64>(4)? as u64,
        updated_at_ms: row.get::<_, i64>(5)? as u64,
    })
}

/// Order a participant pair so storage sees one canonical form.
pub fn normalize_pair(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

/// Fresh random row id, 16 bytes as hex.
pub fn new_id() -> String {
    let bytes: [u8; 16] = rand::random();
    hex::encode(bytes)
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALICE: &str = "+15550001111";
    const BOB: &str = "+15550002222";
    const CARA: &str = "+15550003333";

    async fn store_with_users() -> Store {
        let store = Store::open_in_memory().unwrap();
        store.upsert_user(ALICE, 1_000).await.unwrap();
        store.upsert_user(BOB, 1_000).await.unwrap();
        store.upsert_user(CARA, 1_000).await.unwrap();
        store
    }

    fn message(id: &str, conversation_id: &str, sender: &str, receiver: &str, ts: u64) -> WireMessage {
        WireMessage {
            id: id.to_string(),
            conversation_id: conversation_id.to_string(),
            sender: sender.to_string(),
            receiver: receiver.to_string(),
            text: format!("message {id}"),
            timestamp_ms: ts,
            read: false,
        }
    }

    #[test]
    fn normalize_pair_orders_lexicographically() {
        assert_eq!(normalize_pair(BOB, ALICE), normalize_pair(ALICE, BOB));
        let (lo, hi) = normalize_pair(BOB, ALICE);
        assert!(lo < hi);
    }

    #[tokio::test]
    async fn upsert_user_creates_then_refreshes() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_user(ALICE, 1_000).await.unwrap();
        store.upsert_user(ALICE, 2_000).await.unwrap();

        let user = store.find_user(ALICE).await.unwrap().unwrap();
        assert_eq!(user.created_at_ms, 1_000);
        assert_eq!(user.last_seen_ms, Some(2_000));
        assert!(store.find_user(BOB).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn conversation_is_stable_across_argument_order() {
        let store = store_with_users().await;
        let first = store
            .find_or_create_conversation(ALICE, BOB, 1_000)
            .await
            .unwrap();
        let second = store
            .find_or_create_conversation(BOB, ALICE, 2_000)
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert!(first.involves(ALICE) && first.involves(BOB));
        assert_eq!(first.peer_of(ALICE), BOB);

        // The losing insert leaves the original row untouched.
        assert_eq!(second.created_at_ms, 1_000);
        assert_eq!(second.updated_at_ms, 1_000);
    }

    #[tokio::test]
    async fn concurrent_first_contact_yields_one_conversation() {
        let store = store_with_users().await;
        let (a, b) = tokio::join!(
            store.find_or_create_conversation(ALICE, BOB, 1_000),
            store.find_or_create_conversation(BOB, ALICE, 1_000),
        );
        assert_eq!(a.unwrap().id, b.unwrap().id);
    }

    #[tokio::test]
    async fn distinct_pairs_get_distinct_conversations() {
        let store = store_with_users().await;
        let ab = store
            .find_or_create_conversation(ALICE, BOB, 1_000)
            .await
            .unwrap();
        let ac = store
            .find_or_create_conversation(ALICE, CARA, 1_000)
            .await
            .unwrap();
        assert_ne!(ab.id, ac.id);
    }

    #[tokio::test]
    async fn list_messages_returns_most_recent_oldest_first() {
        let store = store_with_users().await;
        let conv = store
            .find_or_create_conversation(ALICE, BOB, 1_000)
            .await
            .unwrap();
        for i in 0..5u64 {
            store
                .insert_message(message(&format!("m{i}"), &conv.id, ALICE, BOB, 1_000 + i))
                .await
                .unwrap();
        }

        let recent = store.list_messages(&conv.id, 3).await.unwrap();
        let ids: Vec<&str> = recent.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m2", "m3", "m4"]);
    }

    #[tokio::test]
    async fn mark_read_counts_only_unread_from_sender() {
        let store = store_with_users().await;
        let conv = store
            .find_or_create_conversation(ALICE, BOB, 1_000)
            .await
            .unwrap();
        store
            .insert_message(message("m1", &conv.id, ALICE, BOB, 1_001))
            .await
            .unwrap();
        store
            .insert_message(message("m2", &conv.id, ALICE, BOB, 1_002))
            .await
            .unwrap();
        store
            .insert_message(message("m3", &conv.id, BOB, ALICE, 1_003))
            .await
            .unwrap();

        // Bob marks Alice's messages read; Bob's own message is untouched.
        let marked = store.mark_read(&conv.id, ALICE, BOB).await.unwrap();
        assert_eq!(marked, 2);

        // Nothing left to mark.
        let again = store.mark_read(&conv.id, ALICE, BOB).await.unwrap();
        assert_eq!(again, 0);

        let messages = store.list_messages(&conv.id, 10).await.unwrap();
        assert!(messages.iter().filter(|m| m.sender == ALICE).all(|m| m.read));
        assert!(!messages.iter().find(|m| m.id == "m3").unwrap().read);
    }

    #[tokio::test]
    async fn mark_read_by_outsider_changes_nothing() {
        let store = store_with_users().await;
        let conv = store
            .find_or_create_conversation(ALICE, BOB, 1_000)
            .await
            .unwrap();
        store
            .insert_message(message("m1", &conv.id, ALICE, BOB, 1_001))
            .await
            .unwrap();

        let marked = store.mark_read(&conv.id, ALICE, CARA).await.unwrap();
        assert_eq!(marked, 0);

        let messages = store.list_messages(&conv.id, 10).await.unwrap();
        assert!(!messages[0].read);
    }

    #[tokio::test]
    async fn list_conversations_reports_unread_and_order() {
        let store = store_with_users().await;
        let ab = store
            .find_or_create_conversation(ALICE, BOB, 1_000)
            .await
            .unwrap();
        let ac = store
            .find_or_create_conversation(ALICE, CARA, 1_100)
            .await
            .unwrap();

        store
            .insert_message(message("m1", &ab.id, BOB, ALICE, 1_200))
            .await
            .unwrap();
        store
            .insert_message(message("m2", &ab.id, BOB, ALICE, 1_300))
            .await
            .unwrap();
        store.set_last_message(&ab.id, "m2", 1_300).await.unwrap();

        store
            .insert_message(message("m3", &ac.id, ALICE, CARA, 1_400))
            .await
            .unwrap();
        store.set_last_message(&ac.id, "m3", 1_400).await.unwrap();

        let for_alice = store.list_conversations(ALICE).await.unwrap();
        assert_eq!(for_alice.len(), 2);

        // Newest first: the Cara conversation was updated last.
        assert_eq!(for_alice[0].conversation_id, ac.id);
        assert_eq!(for_alice[0].peer, CARA);
        assert_eq!(for_alice[0].unread, 0);
        assert_eq!(for_alice[0].last_message.as_ref().unwrap().id, "m3");

        assert_eq!(for_alice[1].conversation_id, ab.id);
        assert_eq!(for_alice[1].peer, BOB);
        assert_eq!(for_alice[1].unread, 2);
        assert_eq!(for_alice[1].last_message.as_ref().unwrap().id, "m2");

        // Cara has one unread from Alice.
        let for_cara = store.list_conversations(CARA).await.unwrap();
        assert_eq!(for_cara.len(), 1);
        assert_eq!(for_cara[0].peer, ALICE);
        assert_eq!(for_cara[0].unread, 1);
    }

    #[tokio::test]
    async fn empty_conversation_lists_without_last_message() {
        let store = store_with_users().await;
        store
            .find_or_create_conversation(ALICE, BOB, 1_000)
            .await
            .unwrap();

        let conversations = store.list_conversations(ALICE).await.unwrap();
        assert_eq!(conversations.len(), 1);
        assert!(conversations[0].last_message.is_none());
        assert_eq!(conversations[0].unread, 0);
    }
}
