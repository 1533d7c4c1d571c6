//! API key lifecycle and windowed usage accounting on top of a shared
//! [`QuotaStore`].
//!
//! Each key `K` owns four store entries:
//!
//! | Entry | Content |
//! |-------|---------|
//! | `apikey:K:info` | JSON [`ApiKeyRecord`] |
//! | `apikey:K:total_usage` | integer, never reset |
//! | `apikey:K:current_period_usage` | integer, zeroed when a period elapses |
//! | `apikey:K:last_refresh_time` | Unix seconds of the current period start |
//!
//! Counters only grow through [`QuotaStore::incr`]. Record blobs are
//! replaced with compare-and-swap, so a stale writer can neither resurrect
//! a deleted key nor move `activated_at`. An elapsed period is rolled with
//! [`QuotaStore::reset_period`], which moves the period start and zeroes the
//! counter in one step: exactly one of several concurrent chargers resets,
//! and the others re-read a period that is already empty.
//!
//! The limit check and the following increment stay separate round trips,
//! so concurrent chargers may overshoot the limit by their number. A charge
//! admitted under the old period whose increment lands after the reset is
//! counted in the new one.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::errors::{KeyError, StoreError};
use crate::models::{secs_i64, Activation, ApiKeyRecord, KeyInfo, KeyUpdate, UsageInfo};
use crate::security::{redact, KeyMinter};
use crate::store::QuotaStore;

pub const REFRESH_INTERVAL_SECONDS: u64 = 3 * 60 * 60;
pub const DEFAULT_USAGE_LIMIT: u64 = 100;

const KEY_NAMESPACE: &str = "apikey:";
const INFO_SUFFIX: &str = ":info";
const MAX_SWAP_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaPolicy {
    pub refresh_interval_seconds: u64,
    pub default_usage_limit: u64,
}

impl Default for QuotaPolicy {
    fn default() -> Self {
        Self {
            refresh_interval_seconds: REFRESH_INTERVAL_SECONDS,
            default_usage_limit: DEFAULT_USAGE_LIMIT,
        }
    }
}

struct StoreKeys {
    info: String,
    total_usage: String,
    current_period_usage: String,
    last_refresh_time: String,
}

impl StoreKeys {
    fn for_key(api_key: &str) -> Self {
        Self {
            info: format!("{KEY_NAMESPACE}{api_key}{INFO_SUFFIX}"),
            total_usage: format!("{KEY_NAMESPACE}{api_key}:total_usage"),
            current_period_usage: format!("{KEY_NAMESPACE}{api_key}:current_period_usage"),
            last_refresh_time: format!("{KEY_NAMESPACE}{api_key}:last_refresh_time"),
        }
    }
}

/// A record as read from the store, with the exact blob it came from so it
/// can be swapped back.
struct Loaded {
    raw: String,
    record: ApiKeyRecord,
}

enum Change<R> {
    Unchanged(R),
    Changed(R),
}

pub struct ApiKeyRegistry {
    store: Arc<dyn QuotaStore>,
    clock: Arc<dyn Clock>,
    minter: KeyMinter,
    policy: QuotaPolicy,
}

impl ApiKeyRegistry {
    pub fn new(store: Arc<dyn QuotaStore>, policy: QuotaPolicy) -> Self {
        Self::with_clock(store, Arc::new(SystemClock), policy)
    }

    pub fn with_clock(store: Arc<dyn QuotaStore>, clock: Arc<dyn Clock>, policy: QuotaPolicy) -> Self {
        Self {
            store,
            clock,
            minter: KeyMinter::default(),
            policy,
        }
    }

    pub fn policy(&self) -> QuotaPolicy {
        self.policy
    }

    /// Mint a new, not yet activated key with zeroed counters.
    pub async fn create(&self, expiration_seconds: u64, usage_limit: Option<u64>) -> Result<String, KeyError> {
        let api_key = self.minter.mint();
        let keys = StoreKeys::for_key(&api_key);
        let now = self.clock.now();
        let usage_limit = usage_limit.unwrap_or(self.policy.default_usage_limit);

        let record = ApiKeyRecord::new(now, expiration_seconds, usage_limit);
        let blob = encode_record(&keys.info, &record)?;

        // Counters first: the key becomes visible only once its info exists.
        self.store.set(&keys.total_usage, "0").await?;
        self.store.set(&keys.current_period_usage, "0").await?;
        self.store.set(&keys.last_refresh_time, &now.to_string()).await?;
        self.store.set(&keys.info, &blob).await?;

        info!(
            api_key = %redact(&api_key),
            expiration_seconds,
            usage_limit,
            "api key created"
        );
        Ok(api_key)
    }

    /// Start the expiry countdown on first use. Repeated calls report the
    /// original activation time.
    pub async fn activate(&self, api_key: &str) -> Result<Activation, KeyError> {
        let (_, activation) = self.activate_record(api_key).await?;
        Ok(activation)
    }

    /// Unknown and deleted keys are invalid; an unactivated key is valid
    /// because its countdown has not started.
    pub async fn validate(&self, api_key: &str) -> Result<bool, KeyError> {
        let Some(loaded) = self.load(api_key).await? else {
            return Ok(false);
        };
        let record = loaded.record;
        Ok(!record.deleted && !record.is_expired_at(self.clock.now()))
    }

    /// Lazily activate, roll the quota period if it elapsed, and charge one
    /// use. Returns the counters after the charge.
    pub async fn check_and_increment(&self, api_key: &str) -> Result<UsageInfo, KeyError> {
        let (record, _) = self.activate_record(api_key).await?;
        let keys = StoreKeys::for_key(api_key);
        let now = self.clock.now();

        self.admit_in_period(api_key, &keys, &record, now).await?;

        let total = self.store.incr(&keys.total_usage).await?;
        let current = self.store.incr(&keys.current_period_usage).await?;
        debug!(
            api_key = %redact(api_key),
            total_usage = total,
            current_period_usage = current,
            usage_limit = record.usage_limit,
            "usage charged"
        );

        self.usage_for(&keys, &record, now).await
    }

    pub async fn get_usage_info(&self, api_key: &str) -> Result<UsageInfo, KeyError> {
        let loaded = self.require(api_key).await?;
        let keys = StoreKeys::for_key(api_key);
        self.usage_for(&keys, &loaded.record, self.clock.now()).await
    }

    pub async fn get_info(&self, api_key: &str) -> Result<KeyInfo, KeyError> {
        let loaded = self.require(api_key).await?;
        let keys = StoreKeys::for_key(api_key);
        let now = self.clock.now();
        let usage = self.usage_for(&keys, &loaded.record, now).await?;
        Ok(KeyInfo::new(api_key, &loaded.record, usage, now))
    }

    /// Change expiry and/or usage limit. Counters are left untouched.
    pub async fn update(&self, api_key: &str, update: KeyUpdate) -> Result<ApiKeyRecord, KeyError> {
        let record = self
            .mutate(api_key, |record, _| {
                if record.deleted {
                    return Err(KeyError::KeyDeleted);
                }
                update.apply(record);
                Ok(Change::Changed(record.clone()))
            })
            .await?;

        info!(
            api_key = %redact(api_key),
            expiration_seconds = ?update.expiration_seconds(),
            usage_limit = ?update.usage_limit(),
            "api key updated"
        );
        Ok(record)
    }

    /// Logical delete. Returns the deletion time.
    pub async fn delete(&self, api_key: &str) -> Result<i64, KeyError> {
        let deleted_at = self
            .mutate(api_key, |record, now| {
                if record.deleted {
                    return Err(KeyError::AlreadyDeleted);
                }
                record.deleted = true;
                record.deleted_at = Some(now);
                Ok(Change::Changed(now))
            })
            .await?;

        info!(api_key = %redact(api_key), deleted_at, "api key deleted");
        Ok(deleted_at)
    }

    /// Snapshot of every known key, oldest first.
    pub async fn list(&self, include_deleted: bool) -> Result<Vec<KeyInfo>, KeyError> {
        let store_keys = self.store.keys_with_prefix(KEY_NAMESPACE).await?;

        let mut infos = Vec::new();
        for store_key in store_keys {
            let Some(api_key) = store_key
                .strip_prefix(KEY_NAMESPACE)
                .and_then(|rest| rest.strip_suffix(INFO_SUFFIX))
            else {
                continue;
            };

            match self.get_info(api_key).await {
                Ok(info) if include_deleted || !info.deleted => infos.push(info),
                Ok(_) | Err(KeyError::KeyNotFound) => {}
                Err(e) => return Err(e),
            }
        }

        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.api_key.cmp(&b.api_key)));
        Ok(infos)
    }

    async fn activate_record(&self, api_key: &str) -> Result<(ApiKeyRecord, Activation), KeyError> {
        let (record, activation) = self
            .mutate(api_key, |record, now| {
                if record.deleted {
                    return Err(KeyError::KeyDeleted);
                }
                if record.is_expired_at(now) {
                    return Err(KeyError::KeyExpired);
                }

                let newly_activated = !record.activated;
                if newly_activated {
                    record.activated = true;
                    record.activated_at = Some(now);
                }
                let activated_at = record.activated_at.unwrap_or(now);
                let activation = Activation {
                    activated_at,
                    expires_at: activated_at.saturating_add(secs_i64(record.expiration_seconds)),
                    newly_activated,
                };

                let result = (record.clone(), activation);
                Ok(if newly_activated {
                    Change::Changed(result)
                } else {
                    Change::Unchanged(result)
                })
            })
            .await?;

        if activation.newly_activated {
            info!(
                api_key = %redact(api_key),
                activated_at = activation.activated_at,
                expires_at = activation.expires_at,
                "api key activated"
            );
        }
        Ok((record, activation))
    }

    /// Roll an elapsed period or reject when the current one is used up.
    async fn admit_in_period(
        &self,
        api_key: &str,
        keys: &StoreKeys,
        record: &ApiKeyRecord,
        now: i64,
    ) -> Result<(), KeyError> {
        let interval = secs_i64(self.policy.refresh_interval_seconds);
        let mut attempts = 0;

        loop {
            let raw_last = self.store.get(&keys.last_refresh_time).await?;
            let last_refresh = parse_counter(&keys.last_refresh_time, raw_last.as_deref())?;
            let next_reset = last_refresh.saturating_add(interval);

            if now >= next_reset {
                if attempts == MAX_SWAP_ATTEMPTS {
                    return Err(StoreError::Contended {
                        key: keys.last_refresh_time.clone(),
                    }
                    .into());
                }
                attempts += 1;

                let reset = self
                    .store
                    .reset_period(
                        &keys.last_refresh_time,
                        &keys.current_period_usage,
                        raw_last.as_deref(),
                        &now.to_string(),
                    )
                    .await?;
                if reset {
                    debug!(api_key = %redact(api_key), period_start = now, "quota period reset");
                    return Ok(());
                }
                warn!(api_key = %redact(api_key), "concurrent quota period reset, re-reading");
                continue;
            }

            let raw_current = self.store.get(&keys.current_period_usage).await?;
            let current = parse_counter(&keys.current_period_usage, raw_current.as_deref())?;
            let current = u64::try_from(current).unwrap_or(0);

            if current >= record.usage_limit {
                let time_until_reset = next_reset.saturating_sub(now).max(0);
                warn!(
                    api_key = %redact(api_key),
                    current_period_usage = current,
                    usage_limit = record.usage_limit,
                    time_until_reset,
                    "usage limit reached"
                );
                return Err(KeyError::QuotaExceeded {
                    current,
                    limit: record.usage_limit,
                    time_until_reset,
                    next_reset_time: next_reset,
                });
            }
            return Ok(());
        }
    }

    async fn usage_for(&self, keys: &StoreKeys, record: &ApiKeyRecord, now: i64) -> Result<UsageInfo, KeyError> {
        let total = self.store.get(&keys.total_usage).await?;
        let current = self.store.get(&keys.current_period_usage).await?;
        let last = self.store.get(&keys.last_refresh_time).await?;

        let last_refresh_time = parse_counter(&keys.last_refresh_time, last.as_deref())?;
        let next_reset_time = last_refresh_time.saturating_add(secs_i64(self.policy.refresh_interval_seconds));

        Ok(UsageInfo {
            total_usage: non_negative(parse_counter(&keys.total_usage, total.as_deref())?),
            current_period_usage: non_negative(parse_counter(&keys.current_period_usage, current.as_deref())?),
            usage_limit: record.usage_limit,
            last_refresh_time,
            next_reset_time,
            time_until_reset: next_reset_time.saturating_sub(now).max(0),
        })
    }

    /// Read-modify-swap of the record blob, retried while other writers
    /// get in between.
    async fn mutate<R, F>(&self, api_key: &str, mut f: F) -> Result<R, KeyError>
    where
        F: FnMut(&mut ApiKeyRecord, i64) -> Result<Change<R>, KeyError> + Send,
        R: Send,
    {
        let keys = StoreKeys::for_key(api_key);

        for _ in 0..MAX_SWAP_ATTEMPTS {
            let Loaded { raw, mut record } = self.require(api_key).await?;
            let now = self.clock.now();

            match f(&mut record, now)? {
                Change::Unchanged(result) => return Ok(result),
                Change::Changed(result) => {
                    let blob = encode_record(&keys.info, &record)?;
                    if self.store.compare_and_swap(&keys.info, Some(&raw), &blob).await? {
                        return Ok(result);
                    }
                    debug!(api_key = %redact(api_key), "record changed concurrently, retrying");
                }
            }
        }

        Err(StoreError::Contended { key: keys.info }.into())
    }

    async fn require(&self, api_key: &str) -> Result<Loaded, KeyError> {
        self.load(api_key).await?.ok_or(KeyError::KeyNotFound)
    }

    async fn load(&self, api_key: &str) -> Result<Option<Loaded>, KeyError> {
        if !self.minter.is_well_formed(api_key) {
            return Ok(None);
        }

        let keys = StoreKeys::for_key(api_key);
        let Some(raw) = self.store.get(&keys.info).await? else {
            return Ok(None);
        };
        let record = serde_json::from_str(&raw).map_err(|e| corrupted(&keys.info, e))?;
        Ok(Some(Loaded { raw, record }))
    }
}

fn encode_record(key: &str, record: &ApiKeyRecord) -> Result<String, StoreError> {
    serde_json::to_string(record).map_err(|e| corrupted(key, e))
}

fn corrupted(key: &str, err: serde_json::Error) -> StoreError {
    StoreError::Corrupted {
        key: key.to_string(),
        reason: err.to_string(),
    }
}

fn parse_counter(key: &str, raw: Option<&str>) -> Result<i64, StoreError> {
    match raw {
        None => Ok(0),
        Some(value) => value.trim().parse().map_err(|_| StoreError::Corrupted {
            key: key.to_string(),
            reason: format!("expected integer, found {value:?}"),
        }),
    }
}

fn non_negative(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}
