//! Cross-process leases backed by Redis.
//!
//! A lease is a plain Redis string `name -> owner_token` written with
//! `SET NX PX`, so it disappears on its own once the TTL elapses. Release runs a
//! compare-and-delete script and only removes the key while the caller still
//! owns it.

use crate::error::{AppError, Result};
use crate::idempotency::key_generator::EncodedKey;
use crate::idempotency::lock::{LeaseSettings, Lease, LockGranularity, LockProvider, RETRY_INTERVAL};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tokio::time::Instant;

const RELEASE_SCRIPT: &str = r#"
    if redis.call('GET', KEYS[1]) == ARGV[1] then
        return redis.call('DEL', KEYS[1])
    end
    return 0
"#;

/// Shared connection to the coordination store.
///
/// Built once at startup and cloned into every component that needs it.
#[derive(Clone)]
pub struct RedisLockClient {
    conn_manager: ConnectionManager,
}

impl RedisLockClient {
    /// Connects and verifies the server answers `PING`.
    ///
    /// # Errors
    ///
    /// Returns error if the location is malformed or the server is unreachable.
    pub async fn connect(location: &str) -> Result<Self> {
        let client = redis::Client::open(location).map_err(|e| {
            AppError::Configuration(format!("Invalid lock location '{}': {}", location, e))
        })?;

        let mut conn_manager = ConnectionManager::new(client).await.map_err(AppError::Redis)?;

        let _: () = redis::cmd("PING")
            .query_async(&mut conn_manager)
            .await
            .map_err(AppError::Redis)?;

        tracing::info!("Connected to lock store");

        Ok(Self { conn_manager })
    }

    pub fn connection(&self) -> ConnectionManager {
        self.conn_manager.clone()
    }
}

/// Lease held in Redis, shared by every process pointing at the same server.
pub struct RedisLock {
    client: RedisLockClient,
    settings: LeaseSettings,
    granularity: LockGranularity,
}

impl RedisLock {
    pub fn new(client: RedisLockClient, settings: LeaseSettings, granularity: LockGranularity) -> Self {
        Self {
            client,
            settings,
            granularity,
        }
    }

    async fn try_set(&self, lease: &Lease) -> Result<bool> {
        let mut conn = self.client.connection();
        let ttl_ms = lease.ttl.as_millis().max(1) as usize;

        let result: Option<String> = redis::cmd("SET")
            .arg(&lease.name)
            .arg(&lease.owner_token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await
            .map_err(AppError::Redis)?;

        Ok(result.is_some())
    }
}

#[async_trait]
impl LockProvider for RedisLock {
    async fn acquire(&self, key: &EncodedKey) -> Result<Option<Lease>> {
        let lease = Lease::new(
            self.settings.lease_name(self.granularity, key),
            self.settings.time_to_live,
            self.settings.blocking_timeout_for(self.granularity),
        );

        let deadline = lease.blocking_timeout.map(|timeout| Instant::now() + timeout);

        loop {
            if self.try_set(&lease).await? {
                return Ok(Some(lease));
            }

            let Some(deadline) = deadline else {
                return Ok(None);
            };

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            tokio::time::sleep((deadline - now).min(RETRY_INTERVAL)).await;
        }
    }

    async fn release(&self, lease: &Lease) {
        let mut conn = self.client.connection();
        let script = redis::Script::new(RELEASE_SCRIPT);

        let outcome: std::result::Result<i64, redis::RedisError> = script
            .key(&lease.name)
            .arg(&lease.owner_token)
            .invoke_async(&mut conn)
            .await;

        match outcome {
            Ok(1) => {}
            Ok(_) => {
                tracing::debug!(lease = %lease.name, "Lease already expired or owned by another holder");
            }
            Err(e) => {
                tracing::warn!(lease = %lease.name, error = %e, "Failed to release lease, relying on TTL");
            }
        }
    }

    fn granularity(&self) -> LockGranularity {
        self.granularity
    }

    fn lease_name(&self, key: &EncodedKey) -> String {
        self.settings.lease_name(self.granularity, key)
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}
