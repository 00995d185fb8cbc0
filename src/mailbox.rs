//! SQLite-backed relay mailbox.
//!
//! One durable queue row per undelivered envelope, keyed by message id so a
//! retried send upserts instead of duplicating.  Reads are non-destructive;
//! rows are removed either by an explicit acknowledgment or by the TTL sweep.
//! A small `users` table holds optional registered identity metadata.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

#[derive(Debug)]
pub enum MailboxError {
    Sqlite(rusqlite::Error),
    Io(std::io::Error),
}

impl std::fmt::Display for MailboxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MailboxError::Sqlite(e) => write!(f, "sqlite error: {e}"),
            MailboxError::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl std::error::Error for MailboxError {}

impl From<rusqlite::Error> for MailboxError {
    fn from(e: rusqlite::Error) -> Self {
        MailboxError::Sqlite(e)
    }
}

impl From<std::io::Error> for MailboxError {
    fn from(e: std::io::Error) -> Self {
        MailboxError::Io(e)
    }
}

/// A queued envelope as stored on the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedEnvelope {
    /// Message id; primary key, so re-enqueueing replaces.
    pub id: String,
    pub to_user: String,
    /// Serialized envelope JSON, opaque to the relay.
    pub payload: String,
    /// Sender-assigned milliseconds; ordering and `since` filtering.
    pub created_at: u64,
    /// Server-assigned milliseconds; retention only.
    pub enqueued_at: u64,
}

/// Registered identity metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: String,
    pub public_key: Option<String>,
    pub avatar: Option<String>,
    pub registered_at: u64,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS queue (
    id TEXT PRIMARY KEY,
    to_user TEXT NOT NULL,
    payload TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    enqueued_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_queue_to_user ON queue(to_user);
CREATE INDEX IF NOT EXISTS idx_queue_enqueued ON queue(enqueued_at);
CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY,
    public_key TEXT,
    avatar TEXT,
    registered_at INTEGER NOT NULL
);
";

/// Durable per-recipient mailbox.
pub struct Mailbox {
    conn: Connection,
}

impl Mailbox {
    /// Open (creating if necessary) a mailbox database at `path`.
    pub fn open(path: &Path) -> Result<Self, MailboxError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Mailbox { conn })
    }

    /// Open an in-memory mailbox, used by tests and throwaway deployments.
    pub fn open_in_memory() -> Result<Self, MailboxError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Mailbox { conn })
    }

    /// Insert or replace by message id.  Calling twice with the same id leaves
    /// exactly one row holding the latest payload.
    pub fn enqueue(&self, entry: &QueuedEnvelope) -> Result<(), MailboxError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO queue (id, to_user, payload, created_at, enqueued_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                entry.id,
                entry.to_user,
                entry.payload,
                entry.created_at,
                entry.enqueued_at
            ],
        )?;
        Ok(())
    }

    /// All live entries for `to_user` newer than `since` (exclusive), oldest
    /// first.  `min_enqueued_at` excludes rows the sweep has not caught yet.
    pub fn fetch_since(
        &self,
        to_user: &str,
        since: Option<u64>,
        min_enqueued_at: u64,
    ) -> Result<Vec<QueuedEnvelope>, MailboxError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, to_user, payload, created_at, enqueued_at FROM queue
             WHERE to_user = ?1 AND created_at > ?2 AND enqueued_at >= ?3
             ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt.query_map(
            params![to_user, since.unwrap_or(0), min_enqueued_at],
            |row| {
                Ok(QueuedEnvelope {
                    id: row.get(0)?,
                    to_user: row.get(1)?,
                    payload: row.get(2)?,
                    created_at: row.get(3)?,
                    enqueued_at: row.get(4)?,
                })
            },
        )?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    /// Delete the named entries for `to_user`.  Already-deleted ids are a
    /// no-op, so ack races harmlessly with the TTL sweep and with itself.
    pub fn ack(&self, to_user: &str, ids: &[String]) -> Result<usize, MailboxError> {
        let tx = self.conn.unchecked_transaction()?;
        let mut removed = 0;
        {
            let mut stmt = tx.prepare("DELETE FROM queue WHERE id = ?1 AND to_user = ?2")?;
            for id in ids {
                removed += stmt.execute(params![id, to_user])?;
            }
        }
        tx.commit()?;
        Ok(removed)
    }

    /// Delete every entry enqueued before `cutoff`, regardless of recipient or
    /// acknowledgment.  Returns the number of rows removed.
    pub fn sweep(&self, cutoff: u64) -> Result<usize, MailboxError> {
        let removed = self
            .conn
            .execute("DELETE FROM queue WHERE enqueued_at < ?1", params![cutoff])?;
        Ok(removed)
    }

    /// Live queue depth for one recipient.
    pub fn queue_depth(&self, to_user: &str) -> Result<usize, MailboxError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM queue WHERE to_user = ?1",
            params![to_user],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Upsert registered identity metadata.
    pub fn register_user(&self, user: &UserRecord) -> Result<(), MailboxError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO users (id, public_key, avatar, registered_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![user.id, user.public_key, user.avatar, user.registered_at],
        )?;
        Ok(())
    }

    pub fn get_user(&self, id: &str) -> Result<Option<UserRecord>, MailboxError> {
        let user = self
            .conn
            .query_row(
                "SELECT id, public_key, avatar, registered_at FROM users WHERE id = ?1",
                params![id],
                |row| {
                    Ok(UserRecord {
                        id: row.get(0)?,
                        public_key: row.get(1)?,
                        avatar: row.get(2)?,
                        registered_at: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, to_user: &str, created_at: u64, enqueued_at: u64) -> QueuedEnvelope {
        QueuedEnvelope {
            id: id.to_string(),
            to_user: to_user.to_string(),
            payload: format!("{{\"id\":\"{id}\"}}"),
            created_at,
            enqueued_at,
        }
    }

    #[test]
    fn enqueue_is_idempotent_and_keeps_latest_payload() {
        let mailbox = Mailbox::open_in_memory().expect("open");
        mailbox.enqueue(&entry("m1", "bob", 10, 100)).expect("first");
        let mut updated = entry("m1", "bob", 10, 200);
        updated.payload = "{\"id\":\"m1\",\"v\":2}".to_string();
        mailbox.enqueue(&updated).expect("second");

        let entries = mailbox.fetch_since("bob", None, 0).expect("fetch");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].payload, updated.payload);
    }

    #[test]
    fn fetch_orders_by_created_at_and_honours_since() {
        let mailbox = Mailbox::open_in_memory().expect("open");
        mailbox.enqueue(&entry("m2", "bob", 20, 100)).expect("m2");
        mailbox.enqueue(&entry("m1", "bob", 10, 101)).expect("m1");
        mailbox.enqueue(&entry("m3", "bob", 30, 102)).expect("m3");
        mailbox.enqueue(&entry("x1", "carol", 5, 103)).expect("x1");

        let all = mailbox.fetch_since("bob", None, 0).expect("all");
        let ids: Vec<&str> = all.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, ["m1", "m2", "m3"]);

        let newer = mailbox.fetch_since("bob", Some(10), 0).expect("since");
        let ids: Vec<&str> = newer.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, ["m2", "m3"]);
    }

    #[test]
    fn ack_deletes_only_named_entries_and_tolerates_unknown_ids() {
        let mailbox = Mailbox::open_in_memory().expect("open");
        mailbox.enqueue(&entry("m1", "bob", 10, 100)).expect("m1");
        mailbox.enqueue(&entry("m2", "bob", 20, 100)).expect("m2");

        let removed = mailbox
            .ack("bob", &["m1".to_string(), "ghost".to_string()])
            .expect("ack");
        assert_eq!(removed, 1);
        let removed = mailbox.ack("bob", &["m1".to_string()]).expect("re-ack");
        assert_eq!(removed, 0);

        let remaining = mailbox.fetch_since("bob", None, 0).expect("fetch");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, "m2");
    }

    #[test]
    fn ack_is_scoped_to_the_recipient() {
        let mailbox = Mailbox::open_in_memory().expect("open");
        mailbox.enqueue(&entry("m1", "bob", 10, 100)).expect("m1");
        mailbox.ack("carol", &["m1".to_string()]).expect("ack");
        assert_eq!(mailbox.queue_depth("bob").expect("depth"), 1);
    }

    #[test]
    fn sweep_removes_expired_rows_only() {
        let mailbox = Mailbox::open_in_memory().expect("open");
        mailbox.enqueue(&entry("old", "bob", 10, 100)).expect("old");
        mailbox.enqueue(&entry("new", "bob", 20, 500)).expect("new");

        assert_eq!(mailbox.sweep(200).expect("sweep"), 1);
        let remaining = mailbox.fetch_since("bob", None, 0).expect("fetch");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, "new");
    }

    #[test]
    fn fetch_hides_rows_past_retention_before_the_sweep_runs() {
        let mailbox = Mailbox::open_in_memory().expect("open");
        mailbox.enqueue(&entry("old", "bob", 10, 100)).expect("old");
        let visible = mailbox.fetch_since("bob", None, 200).expect("fetch");
        assert!(visible.is_empty());
    }

    #[test]
    fn register_and_lookup_user() {
        let mailbox = Mailbox::open_in_memory().expect("open");
        let user = UserRecord {
            id: "ABC123".to_string(),
            public_key: Some("beef".to_string()),
            avatar: None,
            registered_at: 1,
        };
        mailbox.register_user(&user).expect("register");
        let found = mailbox.get_user("ABC123").expect("get").expect("exists");
        assert_eq!(found.public_key.as_deref(), Some("beef"));
        assert!(mailbox.get_user("NOPE").expect("get").is_none());
    }
}
