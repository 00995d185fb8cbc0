//! Client-side durable state.
//!
//! Everything the delivery pipeline must not lose across a process restart
//! lives here: the outbox (including the pending buffer), the seen-id set
//! used for inbound deduplication, the received-message feed, and a small
//! key/value table for the remembered peer id and the last relay sync
//! watermark.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};

use crate::protocol::{DeliveryStatus, Message, MessageId, MessageKind};

#[derive(Debug)]
pub enum StoreError {
    Sqlite(rusqlite::Error),
    Io(std::io::Error),
    Corrupt(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Sqlite(e) => write!(f, "sqlite error: {e}"),
            StoreError::Io(e) => write!(f, "io error: {e}"),
            StoreError::Corrupt(msg) => write!(f, "corrupt row: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Sqlite(e)
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e)
    }
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS outbox (
    id TEXT PRIMARY KEY,
    sender_id TEXT NOT NULL,
    recipient_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    body TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    status TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS seen_ids (
    id TEXT PRIMARY KEY,
    seen_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS feed (
    id TEXT PRIMARY KEY,
    sender_id TEXT NOT NULL,
    recipient_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    body TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    received_at INTEGER NOT NULL
);
";

const KV_LAST_PEER: &str = "last_peer_id";
const KV_LAST_SYNC: &str = "last_sync_ts";

/// Durable client state backing one identity.
pub struct ClientStore {
    conn: Connection,
}

impl ClientStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(SCHEMA)?;
        Ok(ClientStore { conn })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(ClientStore { conn })
    }

    // -----------------------------------------------------------------------
    // Key/value
    // -----------------------------------------------------------------------

    pub fn set_value(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn get_value(&self, key: &str) -> Result<Option<String>, StoreError> {
        let value = self
            .conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    pub fn delete_value(&self, key: &str) -> Result<(), StoreError> {
        self.conn
            .execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(())
    }

    /// Remembered peer id for reconnect-on-resume.
    pub fn last_peer(&self) -> Result<Option<String>, StoreError> {
        self.get_value(KV_LAST_PEER)
    }

    pub fn set_last_peer(&self, peer_id: &str) -> Result<(), StoreError> {
        self.set_value(KV_LAST_PEER, peer_id)
    }

    pub fn clear_last_peer(&self) -> Result<(), StoreError> {
        self.delete_value(KV_LAST_PEER)
    }

    /// High-water mark for relay sync `since` queries.
    pub fn last_sync(&self) -> Result<u64, StoreError> {
        Ok(self
            .get_value(KV_LAST_SYNC)?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }

    pub fn set_last_sync(&self, timestamp: u64) -> Result<(), StoreError> {
        self.set_value(KV_LAST_SYNC, &timestamp.to_string())
    }

    // -----------------------------------------------------------------------
    // Outbox / pending buffer
    // -----------------------------------------------------------------------

    pub fn insert_outbox(&self, message: &Message) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO outbox
             (id, sender_id, recipient_id, kind, body, created_at, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                message.id.0,
                message.sender_id,
                message.recipient_id,
                message.kind.as_str(),
                message.body,
                message.created_at,
                message.delivery_status.as_str(),
            ],
        )?;
        Ok(())
    }

    /// Advance a message's delivery status, never regressing.  Returns the
    /// status now stored, or `None` for an unknown id.
    pub fn advance_status(
        &self,
        id: &MessageId,
        next: DeliveryStatus,
    ) -> Result<Option<DeliveryStatus>, StoreError> {
        let current: Option<String> = self
            .conn
            .query_row(
                "SELECT status FROM outbox WHERE id = ?1",
                params![id.0],
                |row| row.get(0),
            )
            .optional()?;
        let Some(current) = current else {
            return Ok(None);
        };
        let current = DeliveryStatus::parse(&current)
            .ok_or_else(|| StoreError::Corrupt(format!("status '{current}'")))?;
        let advanced = current.advance(next);
        if advanced != current {
            self.conn.execute(
                "UPDATE outbox SET status = ?1 WHERE id = ?2",
                params![advanced.as_str(), id.0],
            )?;
        }
        Ok(Some(advanced))
    }

    pub fn message_status(&self, id: &MessageId) -> Result<Option<DeliveryStatus>, StoreError> {
        let status: Option<String> = self
            .conn
            .query_row(
                "SELECT status FROM outbox WHERE id = ?1",
                params![id.0],
                |row| row.get(0),
            )
            .optional()?;
        status
            .map(|s| {
                DeliveryStatus::parse(&s).ok_or_else(|| StoreError::Corrupt(format!("status '{s}'")))
            })
            .transpose()
    }

    /// All messages still awaiting a path, oldest first.
    pub fn list_pending(&self) -> Result<Vec<Message>, StoreError> {
        self.query_outbox("WHERE status = 'pending' ORDER BY created_at ASC, id ASC")
    }

    pub fn list_outbox(&self) -> Result<Vec<Message>, StoreError> {
        self.query_outbox("ORDER BY created_at ASC, id ASC")
    }

    /// Latest sender-assigned timestamp in the outbox, for keeping new
    /// timestamps monotonic across restarts.
    pub fn last_created_at(&self) -> Result<u64, StoreError> {
        let max: Option<u64> = self
            .conn
            .query_row("SELECT MAX(created_at) FROM outbox", [], |row| row.get(0))
            .optional()?
            .flatten();
        Ok(max.unwrap_or(0))
    }

    fn query_outbox(&self, tail: &str) -> Result<Vec<Message>, StoreError> {
        let sql = format!(
            "SELECT id, sender_id, recipient_id, kind, body, created_at, status FROM outbox {tail}"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, u64>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?;
        let mut messages = Vec::new();
        for row in rows {
            let (id, sender_id, recipient_id, kind, body, created_at, status) = row?;
            messages.push(Message {
                id: MessageId(id),
                sender_id,
                recipient_id,
                kind: MessageKind::parse(&kind)
                    .ok_or_else(|| StoreError::Corrupt(format!("kind '{kind}'")))?,
                body,
                created_at,
                delivery_status: DeliveryStatus::parse(&status)
                    .ok_or_else(|| StoreError::Corrupt(format!("status '{status}'")))?,
            });
        }
        Ok(messages)
    }

    // -----------------------------------------------------------------------
    // Seen-id set
    // -----------------------------------------------------------------------

    pub fn has_seen(&self, id: &MessageId) -> Result<bool, StoreError> {
        let found: Option<String> = self
            .conn
            .query_row(
                "SELECT id FROM seen_ids WHERE id = ?1",
                params![id.0],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn record_seen(&self, id: &MessageId, seen_at: u64) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT OR IGNORE INTO seen_ids (id, seen_at) VALUES (?1, ?2)",
            params![id.0, seen_at],
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Feed (received messages)
    // -----------------------------------------------------------------------

    pub fn insert_feed(&self, message: &Message, received_at: u64) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT OR IGNORE INTO feed
             (id, sender_id, recipient_id, kind, body, created_at, received_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                message.id.0,
                message.sender_id,
                message.recipient_id,
                message.kind.as_str(),
                message.body,
                message.created_at,
                received_at,
            ],
        )?;
        Ok(())
    }

    /// Received messages in sender-timestamp order.
    pub fn list_feed(&self) -> Result<Vec<Message>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, sender_id, recipient_id, kind, body, created_at FROM feed
             ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, u64>(5)?,
            ))
        })?;
        let mut messages = Vec::new();
        for row in rows {
            let (id, sender_id, recipient_id, kind, body, created_at) = row?;
            messages.push(Message {
                id: MessageId(id),
                sender_id,
                recipient_id,
                kind: MessageKind::parse(&kind)
                    .ok_or_else(|| StoreError::Corrupt(format!("kind '{kind}'")))?,
                body,
                created_at,
                delivery_status: DeliveryStatus::Delivered,
            });
        }
        Ok(messages)
    }
}
