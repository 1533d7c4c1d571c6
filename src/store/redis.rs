//! # Redis
//!
//! Production [`QuotaStore`]. Every gateway instance connects to the same
//! server, which serialises commands, so `INCR` is atomic across instances
//! and compare-and-swap and the period reset run as Lua scripts.

use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, Client, Script};
use tracing::info;

use super::QuotaStore;
use crate::errors::StoreError;

const COMPARE_AND_SWAP: &str = r"
local current = redis.call('GET', KEYS[1])
if ARGV[1] == '1' then
  if current ~= ARGV[2] then
    return 0
  end
elseif current then
  return 0
end
redis.call('SET', KEYS[1], ARGV[3])
return 1
";

const RESET_PERIOD: &str = r"
local current = redis.call('GET', KEYS[1])
if ARGV[1] == '1' then
  if current ~= ARGV[2] then
    return 0
  end
elseif current then
  return 0
end
redis.call('SET', KEYS[1], ARGV[3])
redis.call('SET', KEYS[2], '0')
return 1
";

#[derive(Clone)]
pub struct RedisQuotaStore {
    conn: ConnectionManager,
    cas: Script,
    reset_period: Script,
}

impl RedisQuotaStore {
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = Client::open(redis_url)?;
        let conn = client.get_connection_manager().await?;
        info!("connected to redis quota store");

        Ok(Self {
            conn,
            cas: Script::new(COMPARE_AND_SWAP),
            reset_period: Script::new(RESET_PERIOD),
        })
    }
}

#[async_trait]
impl QuotaStore for RedisQuotaStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.set(key, value).await?;
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        let mut conn = self.conn.clone();
        let value: i64 = conn.incr(key, 1i64).await?;
        Ok(value)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let (has_expected, expected) = match expected {
            Some(expected) => ("1", expected),
            None => ("0", ""),
        };

        let swapped: i64 = self
            .cas
            .key(key)
            .arg(has_expected)
            .arg(expected)
            .arg(new)
            .invoke_async(&mut conn)
            .await?;
        Ok(swapped == 1)
    }

    async fn reset_period(
        &self,
        period_start_key: &str,
        counter_key: &str,
        expected_start: Option<&str>,
        new_start: &str,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let (has_expected, expected) = match expected_start {
            Some(expected) => ("1", expected),
            None => ("0", ""),
        };

        let reset: i64 = self
            .reset_period
            .key(period_start_key)
            .key(counter_key)
            .arg(has_expected)
            .arg(expected)
            .arg(new_start)
            .invoke_async(&mut conn)
            .await?;
        Ok(reset == 1)
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = conn.keys(format!("{prefix}*")).await?;
        Ok(keys)
    }
}
