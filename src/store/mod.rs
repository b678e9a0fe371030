//! Embedded key/value store for tokens, seal-key shares, and run timestamps.
//!
//! A single `kv` table over rusqlite. Key names and the RFC3339-nanosecond
//! timestamp format are a compatibility contract; the close lifecycle rejects
//! new operations once closing starts, then waits a grace period so in-flight
//! background writes finish before the handle is dropped.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::StoreError;

/// Store key holding the authorization token.
pub const KEY_TOKEN: &str = "token";

/// Store key holding the last integrity-check timestamp.
pub const KEY_LAST_CHECK: &str = "timestamp";

/// Store key holding the last successful backup timestamp.
pub const KEY_LAST_BACKUP: &str = "last_backup";

/// Prefix for persisted seal-key shares; the 1-based index is appended.
pub const SEAL_KEY_PREFIX: &str = "vault-key-";

pub struct Store {
    conn: Mutex<Option<Connection>>,
    closing: AtomicBool,
}

impl Store {
    /// Open (or create) the store at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(Some(conn)),
            closing: AtomicBool::new(false),
        })
    }

    /// In-memory store, used by tests and debug runs.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(Some(conn)),
            closing: AtomicBool::new(false),
        })
    }

    fn init_schema(conn: &Connection) -> Result<(), StoreError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS kv (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
            [],
        )?;
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        let conn = self.conn.lock().await;
        let conn = conn.as_ref().ok_or(StoreError::Closed)?;
        let value = conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    pub async fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        let conn = self.conn.lock().await;
        let conn = conn.as_ref().ok_or(StoreError::Closed)?;
        conn.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    /// Delete every key starting with `prefix`.
    pub async fn delete_prefix(&self, prefix: &str) -> Result<(), StoreError> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        let conn = self.conn.lock().await;
        let conn = conn.as_ref().ok_or(StoreError::Closed)?;
        conn.execute(
            "DELETE FROM kv WHERE key LIKE ?1",
            params![format!("{prefix}%")],
        )?;
        Ok(())
    }

    /// Stop accepting operations, wait out the grace period, then drop the
    /// underlying handle.
    pub async fn close(&self, grace: Duration) {
        self.closing.store(true, Ordering::SeqCst);
        tokio::time::sleep(grace).await;
        let conn = self.conn.lock().await.take();
        if let Some(conn) = conn {
            if let Err((_, e)) = conn.close() {
                warn!(error = %e, "store close reported an error");
            }
        }
        debug!("store closed");
    }

    // -- Typed helpers over the stable key names --

    pub async fn token(&self) -> Result<Option<String>, StoreError> {
        self.get(KEY_TOKEN).await
    }

    pub async fn put_token(&self, token: &str) -> Result<(), StoreError> {
        self.put(KEY_TOKEN, token).await
    }

    pub async fn last_backup(&self) -> Result<DateTime<Utc>, StoreError> {
        self.timestamp(KEY_LAST_BACKUP).await
    }

    pub async fn set_last_backup(&self, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.set_timestamp(KEY_LAST_BACKUP, at).await
    }

    pub async fn last_check(&self) -> Result<DateTime<Utc>, StoreError> {
        self.timestamp(KEY_LAST_CHECK).await
    }

    pub async fn set_last_check(&self, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.set_timestamp(KEY_LAST_CHECK, at).await
    }

    pub async fn seal_share(&self, index: usize) -> Result<Option<String>, StoreError> {
        self.get(&format!("{SEAL_KEY_PREFIX}{index}")).await
    }

    pub async fn put_seal_share(&self, index: usize, share: &str) -> Result<(), StoreError> {
        self.put(&format!("{SEAL_KEY_PREFIX}{index}"), share).await
    }

    pub async fn drop_seal_shares(&self) -> Result<(), StoreError> {
        self.delete_prefix(SEAL_KEY_PREFIX).await
    }

    /// Absent or unparseable timestamps read as the Unix epoch ("never ran").
    async fn timestamp(&self, key: &str) -> Result<DateTime<Utc>, StoreError> {
        match self.get(key).await? {
            Some(raw) => match DateTime::parse_from_rfc3339(&raw) {
                Ok(t) => Ok(t.with_timezone(&Utc)),
                Err(e) => {
                    warn!(key, error = %e, "unparseable timestamp, treating as never run");
                    Ok(DateTime::<Utc>::UNIX_EPOCH)
                }
            },
            None => Ok(DateTime::<Utc>::UNIX_EPOCH),
        }
    }

    async fn set_timestamp(&self, key: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.put(key, &at.to_rfc3339_opts(SecondsFormat::Nanos, true))
            .await
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[tokio::test]
    async fn test_get_put_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(store.get("missing").await.unwrap(), None);

        store.put("k", "v1").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v1".to_string()));

        store.put("k", "v2").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v2".to_string()));
    }

    #[tokio::test]
    async fn test_delete_prefix_spares_other_keys() {
        let store = Store::open_in_memory().unwrap();
        store.put_seal_share(1, "a").await.unwrap();
        store.put_seal_share(2, "b").await.unwrap();
        store.put_token("tok").await.unwrap();

        store.drop_seal_shares().await.unwrap();

        assert_eq!(store.seal_share(1).await.unwrap(), None);
        assert_eq!(store.seal_share(2).await.unwrap(), None);
        assert_eq!(store.token().await.unwrap(), Some("tok".to_string()));
    }

    #[tokio::test]
    async fn test_closed_store_rejects_operations() {
        let store = Store::open_in_memory().unwrap();
        store.put("k", "v").await.unwrap();
        store.close(Duration::from_millis(0)).await;

        assert!(matches!(store.get("k").await, Err(StoreError::Closed)));
        assert!(matches!(store.put("k", "v").await, Err(StoreError::Closed)));
        assert!(matches!(
            store.delete_prefix("k").await,
            Err(StoreError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_open_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("agent.db");
        let store = Store::open(&path).unwrap();
        store.put("k", "v").await.unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_absent_timestamps_read_as_epoch() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(store.last_backup().await.unwrap(), DateTime::UNIX_EPOCH);
        assert_eq!(store.last_check().await.unwrap(), DateTime::UNIX_EPOCH);
    }

    #[tokio::test]
    async fn test_timestamp_roundtrip_keeps_nanoseconds() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        store.set_last_backup(now).await.unwrap();
        assert_eq!(store.last_backup().await.unwrap(), now);
    }

    #[tokio::test]
    async fn test_malformed_timestamp_reads_as_epoch() {
        let store = Store::open_in_memory().unwrap();
        store.put(KEY_LAST_BACKUP, "not-a-time").await.unwrap();
        assert_eq!(store.last_backup().await.unwrap(), DateTime::UNIX_EPOCH);
    }

    #[tokio::test]
    async fn test_stable_key_names() {
        let store = Store::open_in_memory().unwrap();
        store.put_token("tok").await.unwrap();
        store.set_last_backup(Utc::now()).await.unwrap();
        store.set_last_check(Utc::now()).await.unwrap();
        store.put_seal_share(3, "share").await.unwrap();

        assert!(store.get("token").await.unwrap().is_some());
        assert!(store.get("last_backup").await.unwrap().is_some());
        assert!(store.get("timestamp").await.unwrap().is_some());
        assert_eq!(
            store.get("vault-key-3").await.unwrap(),
            Some("share".to_string())
        );
    }
}
