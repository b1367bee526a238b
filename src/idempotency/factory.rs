//! Builds engine components from the selectors in [`IdempotencySettings`].

use crate::config::{EncoderKind, IdempotencySettings, LockKind, StorageKind};
use crate::error::{AppError, Result};
use crate::idempotency::key_generator::{KeyEncoder, RawKeyEncoder, Sha256KeyEncoder};
use crate::idempotency::lock::{InProcessLock, LockGranularity, LockProvider, NoopLock};
use crate::idempotency::redis_lock::{RedisLock, RedisLockClient};
use crate::idempotency::storage::{
    MemoryRecordStore, NullRecordStore, PostgresRecordStore, RecordStore, RedisRecordStore,
};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::sync::Arc;
use std::time::Duration;

pub fn build_encoder(kind: EncoderKind) -> Arc<dyn KeyEncoder> {
    match kind {
        EncoderKind::Sha256 => Arc::new(Sha256KeyEncoder::new()),
        EncoderKind::RawKey => Arc::new(RawKeyEncoder::new()),
    }
}

/// Builds the lock provider.
///
/// `redis` without a location is a configuration error. `redis_key` without a
/// location disables locking. A location that cannot be reached fails either way.
pub async fn build_lock_provider(settings: &IdempotencySettings) -> Result<Arc<dyn LockProvider>> {
    let lease_settings = settings.lease_settings();

    match settings.lock {
        LockKind::InProcess => Ok(Arc::new(InProcessLock::new(
            lease_settings,
            LockGranularity::Resource,
        ))),
        LockKind::InProcessKey => Ok(Arc::new(InProcessLock::new(
            lease_settings,
            LockGranularity::Key,
        ))),
        LockKind::Redis => {
            let location = settings.lock_location().ok_or_else(|| {
                AppError::Configuration(
                    "Lock location must be set for the redis lock".to_string(),
                )
            })?;
            let client = RedisLockClient::connect(location).await?;
            Ok(Arc::new(RedisLock::new(
                client,
                lease_settings,
                LockGranularity::Resource,
            )))
        }
        LockKind::RedisKey => match settings.lock_location() {
            Some(location) => {
                let client = RedisLockClient::connect(location).await?;
                Ok(Arc::new(RedisLock::new(
                    client,
                    lease_settings,
                    LockGranularity::Key,
                )))
            }
            None => {
                tracing::warn!("No lock location configured for redis_key lock, locking disabled");
                Ok(Arc::new(NoopLock))
            }
        },
    }
}

/// Same as [`build_lock_provider`] but reuses an already connected client for
/// the redis variants.
pub fn build_lock_provider_with_client(
    settings: &IdempotencySettings,
    client: RedisLockClient,
) -> Result<Arc<dyn LockProvider>> {
    let granularity = match settings.lock {
        LockKind::Redis => LockGranularity::Resource,
        LockKind::RedisKey => LockGranularity::Key,
        other => {
            return Err(AppError::Configuration(format!(
                "Lock {:?} does not use a redis client",
                other
            )))
        }
    };

    Ok(Arc::new(RedisLock::new(
        client,
        settings.lease_settings(),
        granularity,
    )))
}

pub async fn build_record_store(settings: &IdempotencySettings) -> Result<Arc<dyn RecordStore>> {
    let ttl_seconds = settings.storage_ttl_seconds();

    match settings.storage {
        StorageKind::Memory => Ok(Arc::new(MemoryRecordStore::new(ttl_seconds))),
        StorageKind::Null => Ok(Arc::new(NullRecordStore)),
        StorageKind::Redis => {
            let location = required_storage_location(settings)?;
            let store = RedisRecordStore::connect(
                location,
                settings.storage_key_prefix.clone(),
                ttl_seconds,
            )
            .await?;
            Ok(Arc::new(store))
        }
        StorageKind::Postgres => {
            let pool = connect_record_database(settings).await?;
            Ok(Arc::new(PostgresRecordStore::new(pool, ttl_seconds)))
        }
    }
}

/// Opens the pool behind the `postgres` record store.
pub async fn connect_record_database(settings: &IdempotencySettings) -> Result<PgPool> {
    let location = required_storage_location(settings)?;

    PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect(location)
        .await
        .map_err(AppError::Database)
}

fn required_storage_location(settings: &IdempotencySettings) -> Result<&str> {
    settings.storage_location().ok_or_else(|| {
        AppError::Configuration(format!(
            "Storage location must be set for {:?} storage",
            settings.storage
        ))
    })
}
