use serde::{Deserialize, Serialize};

use crate::errors::KeyError;

/// Version written into every new record blob. Readers accept records
/// without the field as version 1.
pub const RECORD_SCHEMA_VERSION: u32 = 1;

fn default_schema_version() -> u32 {
    RECORD_SCHEMA_VERSION
}

/// Policy and lifecycle state of one key, stored as a single JSON blob.
///
/// `activated_at` is written once and never cleared. Once `deleted` is set
/// the registry refuses every further mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub created_at: i64,
    pub expiration_seconds: u64,
    pub usage_limit: u64,
    pub activated: bool,
    pub activated_at: Option<i64>,
    pub deleted: bool,
    pub deleted_at: Option<i64>,
}

impl ApiKeyRecord {
    pub fn new(created_at: i64, expiration_seconds: u64, usage_limit: u64) -> Self {
        Self {
            schema_version: RECORD_SCHEMA_VERSION,
            created_at,
            expiration_seconds,
            usage_limit,
            activated: false,
            activated_at: None,
            deleted: false,
            deleted_at: None,
        }
    }

    /// Absolute expiry, known only once the key has been activated.
    pub fn expires_at(&self) -> Option<i64> {
        self.activated_at
            .map(|at| at.saturating_add(secs_i64(self.expiration_seconds)))
    }

    /// An unactivated key never expires: its countdown has not started.
    pub fn is_expired_at(&self, now: i64) -> bool {
        self.activated && self.expires_at().is_some_and(|expires_at| now > expires_at)
    }

    pub fn status_at(&self, now: i64) -> KeyStatus {
        if self.deleted {
            KeyStatus::Deleted
        } else if !self.activated {
            KeyStatus::Inactive
        } else if self.is_expired_at(now) {
            KeyStatus::Expired
        } else {
            KeyStatus::Active
        }
    }
}

pub(crate) fn secs_i64(secs: u64) -> i64 {
    i64::try_from(secs).unwrap_or(i64::MAX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    Deleted,
    Inactive,
    Expired,
    Active,
}

impl std::fmt::Display for KeyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            KeyStatus::Deleted => "deleted",
            KeyStatus::Inactive => "inactive",
            KeyStatus::Expired => "expired",
            KeyStatus::Active => "active",
        };
        f.write_str(s)
    }
}

/// Counters of one key plus the derived reset schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageInfo {
    pub total_usage: u64,
    pub current_period_usage: u64,
    pub usage_limit: u64,
    pub last_refresh_time: i64,
    pub next_reset_time: i64,
    pub time_until_reset: i64,
}

/// Snapshot returned by `get_info` and `list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyInfo {
    pub api_key: String,
    pub schema_version: u32,
    pub created_at: i64,
    pub expiration_seconds: u64,
    pub activated: bool,
    pub activated_at: Option<i64>,
    pub expires_at: Option<i64>,
    pub deleted: bool,
    pub deleted_at: Option<i64>,
    pub total_usage: u64,
    pub current_period_usage: u64,
    pub usage_limit: u64,
    pub last_refresh_time: i64,
    pub next_reset_time: i64,
    pub time_until_reset: i64,
    pub status: KeyStatus,
}

impl KeyInfo {
    pub fn new(api_key: &str, record: &ApiKeyRecord, usage: UsageInfo, now: i64) -> Self {
        Self {
            api_key: api_key.to_string(),
            schema_version: record.schema_version,
            created_at: record.created_at,
            expiration_seconds: record.expiration_seconds,
            activated: record.activated,
            activated_at: record.activated_at,
            expires_at: record.expires_at(),
            deleted: record.deleted,
            deleted_at: record.deleted_at,
            total_usage: usage.total_usage,
            current_period_usage: usage.current_period_usage,
            usage_limit: usage.usage_limit,
            last_refresh_time: usage.last_refresh_time,
            next_reset_time: usage.next_reset_time,
            time_until_reset: usage.time_until_reset,
            status: record.status_at(now),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activation {
    pub activated_at: i64,
    pub expires_at: i64,
    /// False when the key was already active before this call.
    pub newly_activated: bool,
}

/// A validated change to the two mutable policy fields of a key.
///
/// Construction fails with [`KeyError::NoFieldsProvided`] when both fields
/// are absent, so the registry never sees an empty update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyUpdate {
    expiration_seconds: Option<u64>,
    usage_limit: Option<u64>,
}

impl KeyUpdate {
    pub fn new(expiration_seconds: Option<u64>, usage_limit: Option<u64>) -> Result<Self, KeyError> {
        if expiration_seconds.is_none() && usage_limit.is_none() {
            return Err(KeyError::NoFieldsProvided);
        }
        Ok(Self {
            expiration_seconds,
            usage_limit,
        })
    }

    pub fn expiration_seconds(&self) -> Option<u64> {
        self.expiration_seconds
    }

    pub fn usage_limit(&self) -> Option<u64> {
        self.usage_limit
    }

    pub(crate) fn apply(&self, record: &mut ApiKeyRecord) {
        if let Some(expiration_seconds) = self.expiration_seconds {
            record.expiration_seconds = expiration_seconds;
        }
        if let Some(usage_limit) = self.usage_limit {
            record.usage_limit = usage_limit;
        }
    }
}

impl TryFrom<UpdateKeyRequest> for KeyUpdate {
    type Error = KeyError;

    fn try_from(request: UpdateKeyRequest) -> Result<Self, Self::Error> {
        KeyUpdate::new(request.expiration_seconds, request.usage_limit)
    }
}

/// Uniform envelope for every admin API response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn ok(message: impl Into<String>, data: T) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data),
        }
    }
}

// Request/Response models
#[derive(Debug, Deserialize)]
pub struct CreateKeysRequest {
    #[serde(default = "default_days")]
    pub days: u64,
    #[serde(default)]
    pub hours: u64,
    #[serde(default)]
    pub minutes: u64,
    #[serde(default)]
    pub seconds: u64,
    pub usage_limit: Option<u64>,
    #[serde(default = "default_numbers")]
    pub numbers: u32,
}

fn default_days() -> u64 {
    30
}

fn default_numbers() -> u32 {
    1
}

impl CreateKeysRequest {
    pub fn expiration_seconds(&self) -> u64 {
        self.days
            .saturating_mul(24 * 60 * 60)
            .saturating_add(self.hours.saturating_mul(60 * 60))
            .saturating_add(self.minutes.saturating_mul(60))
            .saturating_add(self.seconds)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreatedKeys {
    pub api_keys: Vec<String>,
    pub expiration_seconds: u64,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateKeyRequest {
    pub expiration_seconds: Option<u64>,
    pub usage_limit: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct BatchDeleteRequest {
    pub api_keys: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BatchDeleteResult {
    pub api_key: String,
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListKeysQuery {
    #[serde(default)]
    pub include_deleted: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct KeyList {
    pub api_keys: Vec<KeyInfo>,
    pub count: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct KeyValidity {
    pub api_key: String,
    pub is_valid: bool,
}
