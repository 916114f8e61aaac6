//! Durable storage area backed by SQLite
//!
//! One `kv` table holds every key. Several handles (one per tab) may open the
//! same file; WAL mode keeps their reads and writes from blocking each other.
//! Schema migrations are embedded and tracked via PRAGMA user_version.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Error, Result};

use super::area::StorageArea;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// SQL migrations, indexed by version number
const MIGRATIONS: &[&str] = &[
    // Version 1: key/value table
    r#"
    CREATE TABLE IF NOT EXISTS kv (
        key              TEXT PRIMARY KEY,
        value            TEXT NOT NULL,
        updated_at       INTEGER NOT NULL
    );
    "#,
];

/// SQLite-backed [`StorageArea`] with an optional byte quota
pub struct SqliteArea {
    conn: Mutex<Connection>,
    quota_bytes: Option<u64>,
}

impl SqliteArea {
    /// Open or create the area at the given path and run migrations
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 1000;
            ",
        )?;

        let area = Self {
            conn: Mutex::new(conn),
            quota_bytes: None,
        };
        area.migrate()?;
        Ok(area)
    }

    /// Open an in-memory area (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let area = Self {
            conn: Mutex::new(conn),
            quota_bytes: None,
        };
        area.migrate()?;
        Ok(area)
    }

    /// Reject writes once stored keys + values would exceed `quota_bytes`
    pub fn with_quota(mut self, quota_bytes: u64) -> Self {
        self.quota_bytes = Some(quota_bytes);
        self
    }

    fn connection(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Storage("sqlite area lock poisoned".to_string()))
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.connection()?;
        let current_version: i32 = conn
            .query_row("PRAGMA user_version", [], |r| r.get(0))
            .unwrap_or(0);

        if current_version > SCHEMA_VERSION {
            tracing::warn!(
                found = current_version,
                supported = SCHEMA_VERSION,
                "Storage was written by a newer tlog, opening it anyway"
            );
        }

        for (i, migration) in MIGRATIONS.iter().enumerate() {
            let version = (i + 1) as i32;
            if version > current_version {
                tracing::debug!(version, "Running storage migration");
                conn.execute_batch(migration)?;
                conn.execute(&format!("PRAGMA user_version = {}", version), [])?;
            }
        }

        Ok(())
    }

    /// Bytes currently used by keys + values, excluding `except_key`
    fn used_bytes(conn: &Connection, except_key: &str) -> Result<u64> {
        let used: i64 = conn.query_row(
            "SELECT COALESCE(SUM(LENGTH(CAST(key AS BLOB)) + LENGTH(CAST(value AS BLOB))), 0)
             FROM kv WHERE key != ?1",
            params![except_key],
            |r| r.get(0),
        )?;
        Ok(used.max(0) as u64)
    }
}

impl StorageArea for SqliteArea {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.connection()?;
        let value = conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |r| {
                r.get(0)
            })
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.connection()?;

        if let Some(quota) = self.quota_bytes {
            let used = Self::used_bytes(&conn, key)?;
            if used + (key.len() + value.len()) as u64 > quota {
                return Err(Error::QuotaExceeded {
                    key: key.to_string(),
                });
            }
        }

        conn.execute(
            r#"
            INSERT INTO kv (key, value, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
            params![key, value, chrono::Utc::now().timestamp_millis()],
        )?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let conn = self.connection()?;
        conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare("SELECT key FROM kv ORDER BY key")?;
        let keys = stmt
            .query_map([], |r| r.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(keys)
    }
}
