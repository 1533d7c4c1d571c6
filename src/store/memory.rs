//! In-process [`QuotaStore`] for tests and single-node development.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::QuotaStore;
use crate::errors::StoreError;

#[derive(Debug, Default)]
pub struct MemoryQuotaStore {
    data: Mutex<BTreeMap<String, String>>,
}

impl MemoryQuotaStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QuotaStore for MemoryQuotaStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.data.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.data
            .lock()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        let mut data = self.data.lock().await;
        let current = match data.get(key) {
            Some(value) => value.parse::<i64>().map_err(|e| StoreError::Corrupted {
                key: key.to_string(),
                reason: e.to_string(),
            })?,
            None => 0,
        };
        let next = current + 1;
        data.insert(key.to_string(), next.to_string());
        Ok(next)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
    ) -> Result<bool, StoreError> {
        let mut data = self.data.lock().await;
        if data.get(key).map(String::as_str) != expected {
            return Ok(false);
        }
        data.insert(key.to_string(), new.to_string());
        Ok(true)
    }

    async fn reset_period(
        &self,
        period_start_key: &str,
        counter_key: &str,
        expected_start: Option<&str>,
        new_start: &str,
    ) -> Result<bool, StoreError> {
        let mut data = self.data.lock().await;
        if data.get(period_start_key).map(String::as_str) != expected_start {
            return Ok(false);
        }
        data.insert(period_start_key.to_string(), new_start.to_string());
        data.insert(counter_key.to_string(), "0".to_string());
        Ok(true)
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let data = self.data.lock().await;
        Ok(data
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect())
    }
}
