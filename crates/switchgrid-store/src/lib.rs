//! Durable key-value store backed by SQLite.
//!
//! The rest of the system only needs get / set / delete, batch writes,
//! prefix scans, and optional per-key expiry. Rows past their expiry are
//! invisible to reads and purged opportunistically on writes.

use chrono::Utc;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;

use switchgrid_core::error::{GridError, Result};

/// One key-value pair, with an optional time-to-live in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_secs: Option<u64>,
}

impl KeyValue {
    pub fn new(key: &str, value: &str) -> Self {
        Self {
            key: key.to_string(),
            value: value.to_string(),
            ttl_secs: None,
        }
    }
}

/// SQLite-backed KV store. All methods are synchronous and cheap; callers
/// in async code invoke them directly.
pub struct KvStore {
    conn: Mutex<Connection>,
}

impl KvStore {
    /// Open (or create) the store at the given file path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| GridError::Store(format!("create store dir: {e}")))?;
        }
        let conn = Connection::open(path).map_err(|e| GridError::Store(e.to_string()))?;
        Self::init(conn)
    }

    /// In-memory store, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| GridError::Store(e.to_string()))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                expires_at INTEGER
            );",
        )
        .map_err(|e| GridError::Store(e.to_string()))?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Get the value for a key. Expired or absent keys return `None`.
    pub fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare("SELECT value FROM kv WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)")
            .map_err(|e| GridError::Store(e.to_string()))?;
        let value = stmt
            .query_row(rusqlite::params![key, Utc::now().timestamp()], |row| {
                row.get::<_, String>(0)
            })
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(GridError::Store(other.to_string())),
            })?;
        Ok(value)
    }

    /// Set one key-value pair, replacing any prior value.
    pub fn set(&self, kv: &KeyValue) -> Result<()> {
        let conn = self.lock();
        purge_expired(&conn);
        conn.execute(
            "INSERT OR REPLACE INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![kv.key, kv.value, expires_at(kv.ttl_secs)],
        )
        .map_err(|e| GridError::Store(e.to_string()))?;
        Ok(())
    }

    /// Set many pairs in one transaction.
    pub fn set_many(&self, kvs: &[KeyValue]) -> Result<()> {
        let mut conn = self.lock();
        purge_expired(&conn);
        let tx = conn
            .transaction()
            .map_err(|e| GridError::Store(e.to_string()))?;
        for kv in kvs {
            tx.execute(
                "INSERT OR REPLACE INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![kv.key, kv.value, expires_at(kv.ttl_secs)],
            )
            .map_err(|e| GridError::Store(e.to_string()))?;
        }
        tx.commit().map_err(|e| GridError::Store(e.to_string()))?;
        Ok(())
    }

    /// Delete one key. Deleting an absent key is not an error.
    pub fn delete(&self, key: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute("DELETE FROM kv WHERE key = ?1", rusqlite::params![key])
            .map_err(|e| GridError::Store(e.to_string()))?;
        Ok(())
    }

    /// All live pairs whose key starts with `prefix`, ordered by key.
    pub fn scan_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT key, value FROM kv
                 WHERE key LIKE ?1 ESCAPE '\\' AND (expires_at IS NULL OR expires_at > ?2)
                 ORDER BY key",
            )
            .map_err(|e| GridError::Store(e.to_string()))?;
        let rows = stmt
            .query_map(
                rusqlite::params![like_prefix(prefix), Utc::now().timestamp()],
                |row| {
                    Ok(KeyValue {
                        key: row.get(0)?,
                        value: row.get(1)?,
                        ttl_secs: None,
                    })
                },
            )
            .map_err(|e| GridError::Store(e.to_string()))?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// All live keys starting with `prefix`, ordered.
    pub fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self.scan_prefix(prefix)?.into_iter().map(|kv| kv.key).collect())
    }

    /// Delete every key starting with `prefix`; returns the deleted keys.
    pub fn delete_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let keys = self.keys_with_prefix(prefix)?;
        let mut conn = self.lock();
        let tx = conn
            .transaction()
            .map_err(|e| GridError::Store(e.to_string()))?;
        for key in &keys {
            tx.execute("DELETE FROM kv WHERE key = ?1", rusqlite::params![key])
                .map_err(|e| GridError::Store(e.to_string()))?;
        }
        tx.commit().map_err(|e| GridError::Store(e.to_string()))?;
        Ok(keys)
    }
}

fn expires_at(ttl_secs: Option<u64>) -> Option<i64> {
    ttl_secs.map(|s| Utc::now().timestamp() + s as i64)
}

/// LIKE pattern matching keys that start with `prefix`, with the LIKE
/// metacharacters escaped.
fn like_prefix(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if c == '%' || c == '_' || c == '\\' {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}

fn purge_expired(conn: &Connection) {
    let _ = conn.execute(
        "DELETE FROM kv WHERE expires_at IS NOT NULL AND expires_at <= ?1",
        rusqlite::params![Utc::now().timestamp()],
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_delete() {
        let store = KvStore::open_in_memory().unwrap();
        assert!(store.get("a").unwrap().is_none());
        store.set(&KeyValue::new("a", "1")).unwrap();
        assert_eq!(store.get("a").unwrap().as_deref(), Some("1"));
        store.set(&KeyValue::new("a", "2")).unwrap();
        assert_eq!(store.get("a").unwrap().as_deref(), Some("2"));
        store.delete("a").unwrap();
        assert!(store.get("a").unwrap().is_none());
        // Deleting again is fine
        store.delete("a").unwrap();
    }

    #[test]
    fn test_prefix_scan_and_delete() {
        let store = KvStore::open_in_memory().unwrap();
        store
            .set_many(&[
                KeyValue::new("controller/c1", "x"),
                KeyValue::new("controller/c2", "y"),
                KeyValue::new("timer/t1", "z"),
            ])
            .unwrap();

        let kvs = store.scan_prefix("controller/").unwrap();
        assert_eq!(kvs.len(), 2);
        assert_eq!(kvs[0].key, "controller/c1");

        let keys = store.keys_with_prefix("timer/").unwrap();
        assert_eq!(keys, vec!["timer/t1"]);

        let deleted = store.delete_prefix("controller/").unwrap();
        assert_eq!(deleted.len(), 2);
        assert!(store.scan_prefix("controller/").unwrap().is_empty());
        assert_eq!(store.get("timer/t1").unwrap().as_deref(), Some("z"));
    }

    #[test]
    fn test_like_metacharacters_in_prefix() {
        let store = KvStore::open_in_memory().unwrap();
        store.set(&KeyValue::new("a%b/1", "v")).unwrap();
        store.set(&KeyValue::new("axb/1", "w")).unwrap();
        let kvs = store.scan_prefix("a%b/").unwrap();
        assert_eq!(kvs.len(), 1);
        assert_eq!(kvs[0].value, "v");
    }

    #[test]
    fn test_expired_key_is_invisible() {
        let store = KvStore::open_in_memory().unwrap();
        // Already expired: expires_at == now fails the `> now` check
        store
            .set(&KeyValue { key: "gone".into(), value: "v".into(), ttl_secs: Some(0) })
            .unwrap();
        assert!(store.get("gone").unwrap().is_none());
        assert!(store.scan_prefix("gone").unwrap().is_empty());

        store
            .set(&KeyValue { key: "alive".into(), value: "v".into(), ttl_secs: Some(3600) })
            .unwrap();
        assert_eq!(store.get("alive").unwrap().as_deref(), Some("v"));
    }

    #[test]
    fn test_open_on_disk() {
        let dir = std::env::temp_dir().join(format!(
            "switchgrid-store-test-{}",
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0)
        ));
        let path = dir.join("store.db");
        {
            let store = KvStore::open(&path).unwrap();
            store.set(&KeyValue::new("k", "v")).unwrap();
        }
        {
            let store = KvStore::open(&path).unwrap();
            assert_eq!(store.get("k").unwrap().as_deref(), Some("v"));
        }
        std::fs::remove_dir_all(&dir).ok();
    }
}
