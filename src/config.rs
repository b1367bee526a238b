use crate::error::{AppError, Result};
use crate::idempotency::conflict::{ConflictPolicy, ConflictStatusSetting};
use crate::idempotency::lock::LeaseSettings;
use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;
use validator::Validate;

#[derive(Debug, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub application: ApplicationSettings,
    #[serde(default)]
    pub idempotency: IdempotencySettings,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ApplicationSettings {
    pub log_level: String,
    pub log_format: String,
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: default_log_format(),
        }
    }
}

fn default_log_format() -> String {
    "pretty".to_string()
}

/// Selects the fingerprint encoder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncoderKind {
    #[default]
    Sha256,
    RawKey,
}

/// Selects the record store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    #[default]
    Memory,
    Redis,
    Postgres,
    Null,
}

/// Selects the lock provider and its granularity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockKind {
    /// In-process, one lease for every request.
    #[default]
    InProcess,
    /// In-process, one lease per encoded key.
    InProcessKey,
    /// Redis, one lease for every request across processes.
    Redis,
    /// Redis, one lease per encoded key across processes.
    RedisKey,
}

impl FromStr for EncoderKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "sha256" => Ok(EncoderKind::Sha256),
            "raw_key" => Ok(EncoderKind::RawKey),
            other => Err(AppError::Configuration(format!("Unknown encoder '{}'", other))),
        }
    }
}

impl FromStr for StorageKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(StorageKind::Memory),
            "redis" => Ok(StorageKind::Redis),
            "postgres" => Ok(StorageKind::Postgres),
            "null" => Ok(StorageKind::Null),
            other => Err(AppError::Configuration(format!("Unknown storage '{}'", other))),
        }
    }
}

impl FromStr for LockKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "in_process" => Ok(LockKind::InProcess),
            "in_process_key" => Ok(LockKind::InProcessKey),
            "redis" => Ok(LockKind::Redis),
            "redis_key" => Ok(LockKind::RedisKey),
            other => Err(AppError::Configuration(format!("Unknown lock '{}'", other))),
        }
    }
}

/// Settings consumed by the engine. Passed in explicitly, never looked up globally.
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
pub struct IdempotencySettings {
    pub encoder: EncoderKind,
    pub storage: StorageKind,
    /// Redis URL or Postgres URL, depending on `storage`.
    pub storage_location: Option<String>,
    #[validate(range(min = 1, max = 315_360_000))]
    pub storage_ttl_secs: u64,
    #[validate(length(min = 1))]
    pub storage_key_prefix: String,
    pub lock: LockKind,
    pub lock_location: Option<String>,
    #[validate(range(min = 1))]
    pub lock_time_to_live_ms: u64,
    pub lock_timeout_ms: u64,
    #[validate(length(min = 1))]
    pub lock_name: String,
    pub conflict_status_code: ConflictStatusSetting,
}

impl Default for IdempotencySettings {
    fn default() -> Self {
        Self {
            encoder: EncoderKind::default(),
            storage: StorageKind::default(),
            storage_location: None,
            storage_ttl_secs: 86400, // 24 hours
            storage_key_prefix: "idem".to_string(),
            lock: LockKind::default(),
            lock_location: None,
            lock_time_to_live_ms: 300_000,
            lock_timeout_ms: 100,
            lock_name: "idempotency-key-lock".to_string(),
            conflict_status_code: ConflictStatusSetting::default(),
        }
    }
}

impl IdempotencySettings {
    /// Rejects out-of-range values.
    pub fn check(&self) -> Result<()> {
        self.validate()
            .map_err(|e| AppError::Configuration(format!("Invalid idempotency settings: {}", e)))
    }

    pub fn lease_settings(&self) -> LeaseSettings {
        LeaseSettings {
            name: self.lock_name.clone(),
            time_to_live: Duration::from_millis(self.lock_time_to_live_ms),
            blocking_timeout: Duration::from_millis(self.lock_timeout_ms),
        }
    }

    pub fn conflict_policy(&self) -> Result<ConflictPolicy> {
        ConflictPolicy::try_from(self.conflict_status_code)
    }

    /// Non-empty lock location, if any.
    pub fn lock_location(&self) -> Option<&str> {
        self.lock_location.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }

    /// Non-empty storage location, if any.
    pub fn storage_location(&self) -> Option<&str> {
        self.storage_location.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }

    pub fn storage_ttl_seconds(&self) -> i64 {
        i64::try_from(self.storage_ttl_secs).unwrap_or(i64::MAX)
    }
}

impl Settings {
    pub fn new() -> Result<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name("config/local").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            );

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.idempotency.check()?;

        Ok(settings)
    }
}
