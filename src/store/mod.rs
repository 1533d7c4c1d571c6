//! Shared counter store behind the key registry.
//!
//! The [`QuotaStore`] trait is the only way the registry touches persistent
//! state. Backends must be reachable from every process instance that
//! serves requests, and must make [`incr`](QuotaStore::incr) and
//! [`compare_and_swap`](QuotaStore::compare_and_swap) atomic on the store
//! side, and [`reset_period`](QuotaStore::reset_period) atomic as a pair:
//! an in-process mutex is not enough once a second instance shares the
//! data.
//!
//! | Backend | Shared across processes | Used for |
//! |---------|-------------------------|----------|
//! | [`MemoryQuotaStore`] | no | tests, single-node development |
//! | [`SqliteQuotaStore`] | yes (same file) | small deployments |
//! | [`RedisQuotaStore`] | yes | production |

pub mod memory;
pub mod redis;
pub mod sqlite;

use async_trait::async_trait;

use crate::errors::StoreError;

pub use self::memory::MemoryQuotaStore;
pub use self::redis::RedisQuotaStore;
pub use self::sqlite::SqliteQuotaStore;

#[async_trait]
pub trait QuotaStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Atomically add one to an integer value, treating a missing key as 0.
    /// Returns the new value.
    async fn incr(&self, key: &str) -> Result<i64, StoreError>;

    /// Write `new` only if the current value equals `expected`
    /// (`None` meaning the key must not exist). Returns whether the write
    /// happened.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
    ) -> Result<bool, StoreError>;

    /// Start a new accounting period in one atomic step: if `period_start_key`
    /// still holds `expected_start` (`None` meaning absent), write
    /// `new_start` there and zero `counter_key`. Returns whether the period
    /// was rolled.
    async fn reset_period(
        &self,
        period_start_key: &str,
        counter_key: &str,
        expected_start: Option<&str>,
        new_start: &str,
    ) -> Result<bool, StoreError>;

    /// All keys starting with `prefix`, in no particular order.
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}
