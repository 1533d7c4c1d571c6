use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use super::QuotaStore;
use crate::errors::StoreError;

/// [`QuotaStore`] on a single SQLite table.
///
/// Several processes may open the same file; every mutation is one SQL
/// statement, so SQLite's own locking keeps increments and swaps atomic.
#[derive(Clone)]
pub struct SqliteQuotaStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteQuotaStore {
    pub fn open(path: &str) -> Result<Self, StoreError> {
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(include_str!("../../db/schema.sql"))?;
        Ok(SqliteQuotaStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }
}

#[async_trait]
impl QuotaStore for SqliteQuotaStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let conn = self.conn()?;
        let value = conn
            .query_row(
                "SELECT value FROM quota_kv WHERE key = ?",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO quota_kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = CURRENT_TIMESTAMP",
            params![key, value],
        )?;
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        let conn = self.conn()?;
        // A stored value that is not a canonical integer updates no row
        let value: Option<i64> = conn
            .query_row(
                "INSERT INTO quota_kv (key, value) VALUES (?1, '1')
                 ON CONFLICT(key) DO UPDATE SET value = CAST(value AS INTEGER) + 1, updated_at = CURRENT_TIMESTAMP
                 WHERE CAST(CAST(quota_kv.value AS INTEGER) AS TEXT) = quota_kv.value
                 RETURNING CAST(value AS INTEGER)",
                params![key],
                |row| row.get(0),
            )
            .optional()?;

        value.ok_or_else(|| StoreError::Corrupted {
            key: key.to_string(),
            reason: "expected integer counter".to_string(),
        })
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
    ) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let changed = match expected {
            Some(expected) => conn.execute(
                "UPDATE quota_kv SET value = ?1, updated_at = CURRENT_TIMESTAMP
                 WHERE key = ?2 AND value = ?3",
                params![new, key, expected],
            )?,
            None => conn.execute(
                "INSERT OR IGNORE INTO quota_kv (key, value) VALUES (?1, ?2)",
                params![key, new],
            )?,
        };
        Ok(changed == 1)
    }

    async fn reset_period(
        &self,
        period_start_key: &str,
        counter_key: &str,
        expected_start: Option<&str>,
        new_start: &str,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let changed = match expected_start {
            Some(expected) => tx.execute(
                "UPDATE quota_kv SET value = ?1, updated_at = CURRENT_TIMESTAMP
                 WHERE key = ?2 AND value = ?3",
                params![new_start, period_start_key, expected],
            )?,
            None => tx.execute(
                "INSERT OR IGNORE INTO quota_kv (key, value) VALUES (?1, ?2)",
                params![period_start_key, new_start],
            )?,
        };
        if changed != 1 {
            return Ok(false);
        }

        tx.execute(
            "INSERT INTO quota_kv (key, value) VALUES (?1, '0')
             ON CONFLICT(key) DO UPDATE SET value = '0', updated_at = CURRENT_TIMESTAMP",
            params![counter_key],
        )?;
        tx.commit()?;
        Ok(true)
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT key FROM quota_kv WHERE substr(key, 1, length(?1)) = ?1")?;
        let keys = stmt
            .query_map(params![prefix], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(keys)
    }
}
