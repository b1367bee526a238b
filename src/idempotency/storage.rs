use crate::error::{AppError, Result};
use crate::idempotency::key_generator::EncodedKey;
use crate::idempotency::response::{IdempotentResponse, StoredResponse};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Mutex;

/// Evidence that an encoded key has been processed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRecord {
    pub encoded_key: EncodedKey,
    pub raw_key: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub response: Option<StoredResponse>,
}

impl KeyRecord {
    pub fn new(
        encoded_key: EncodedKey,
        raw_key: impl Into<String>,
        ttl_seconds: i64,
        response: Option<StoredResponse>,
    ) -> Self {
        let now = Utc::now();
        Self {
            encoded_key,
            raw_key: raw_key.into(),
            created_at: now,
            expires_at: now + Duration::seconds(ttl_seconds),
            response,
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    pub fn ttl(&self) -> Duration {
        self.expires_at - self.created_at
    }
}

/// Durable record of which encoded keys have been seen.
///
/// Callers must hold the lease for a key around `exists` and `store`; stores do
/// not make the check-then-store sequence atomic on their own.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn exists(&self, key: &EncodedKey) -> Result<bool>;

    /// Records the key. An existing, unexpired record is never overwritten.
    async fn store(&self, key: &EncodedKey, raw_key: &str, response: &IdempotentResponse) -> Result<()>;

    /// Response captured when the key was first stored, if this store keeps them.
    async fn retrieve(&self, _key: &EncodedKey) -> Result<Option<StoredResponse>> {
        Ok(None)
    }

    fn captures_responses(&self) -> bool {
        false
    }

    /// Removes expired records and returns how many went away. Stores whose
    /// backend expires records on its own return 0.
    async fn cleanup_expired(&self) -> Result<u64> {
        Ok(0)
    }

    /// Short backend name used in logs and metrics.
    fn backend(&self) -> &'static str;
}

/// In-process, TTL-bounded record store.
///
/// Expired records are dropped on every write, so the map stays bounded by
/// the keys seen within one TTL even without the cleanup job.
pub struct MemoryRecordStore {
    records: Mutex<HashMap<EncodedKey, KeyRecord>>,
    ttl_seconds: i64,
}

impl MemoryRecordStore {
    pub fn new(ttl_seconds: i64) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            ttl_seconds,
        }
    }

    fn records(&self) -> std::sync::MutexGuard<'_, HashMap<EncodedKey, KeyRecord>> {
        match self.records.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn live_record(&self, key: &EncodedKey) -> Option<KeyRecord> {
        let mut records = self.records();
        let expired = records.get(key)?.is_expired();
        if expired {
            records.remove(key);
            return None;
        }
        records.get(key).cloned()
    }

    pub fn find_by_key(&self, key: &EncodedKey) -> Option<KeyRecord> {
        self.live_record(key)
    }

    /// Removes a record. Returns whether one was present.
    pub fn purge(&self, key: &EncodedKey) -> bool {
        self.records().remove(key).is_some()
    }

    /// Drops expired records and returns how many were removed.
    pub fn evict_expired(&self) -> u64 {
        let mut records = self.records();
        let before = records.len();
        records.retain(|_, record| !record.is_expired());
        (before - records.len()) as u64
    }

    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn exists(&self, key: &EncodedKey) -> Result<bool> {
        Ok(self.live_record(key).is_some())
    }

    async fn store(&self, key: &EncodedKey, raw_key: &str, response: &IdempotentResponse) -> Result<()> {
        let mut records = self.records();
        if records.get(key).is_some_and(|record| !record.is_expired()) {
            return Ok(());
        }

        records.retain(|_, record| !record.is_expired());
        records.insert(
            key.clone(),
            KeyRecord::new(
                key.clone(),
                raw_key,
                self.ttl_seconds,
                Some(StoredResponse::from(response)),
            ),
        );
        Ok(())
    }

    async fn retrieve(&self, key: &EncodedKey) -> Result<Option<StoredResponse>> {
        Ok(self.live_record(key).and_then(|record| record.response))
    }

    fn captures_responses(&self) -> bool {
        true
    }

    async fn cleanup_expired(&self) -> Result<u64> {
        Ok(self.evict_expired())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

/// Cache-backed record store. Records expire through Redis TTLs.
pub struct RedisRecordStore {
    conn: MultiplexedConnection,
    key_prefix: String,
    ttl_seconds: i64,
}

impl RedisRecordStore {
    /// Connects to the cache at `location`.
    ///
    /// # Errors
    ///
    /// Returns error if the location is malformed or the server is unreachable.
    pub async fn connect(location: &str, key_prefix: impl Into<String>, ttl_seconds: i64) -> Result<Self> {
        let client = redis::Client::open(location).map_err(|e| {
            AppError::Configuration(format!("Invalid storage location '{}': {}", location, e))
        })?;

        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(AppError::Redis)?;

        Ok(Self::new(conn, key_prefix, ttl_seconds))
    }

    pub fn new(conn: MultiplexedConnection, key_prefix: impl Into<String>, ttl_seconds: i64) -> Self {
        Self {
            conn,
            key_prefix: key_prefix.into(),
            ttl_seconds,
        }
    }

    fn make_key(&self, key: &EncodedKey) -> String {
        format!("{}:{}", self.key_prefix, key)
    }

    pub async fn find_by_key(&self, key: &EncodedKey) -> Result<Option<KeyRecord>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(self.make_key(key)).await.map_err(AppError::Redis)?;

        value
            .map(|json| {
                serde_json::from_str::<KeyRecord>(&json).map_err(|e| {
                    AppError::Storage(format!("Failed to deserialize record for {}: {}", key, e))
                })
            })
            .transpose()
    }

    /// Deletes a record from the cache.
    pub async fn purge(&self, key: &EncodedKey) -> Result<bool> {
        let mut conn = self.conn.clone();
        let deleted: i64 = conn.del(self.make_key(key)).await.map_err(AppError::Redis)?;

        Ok(deleted > 0)
    }
}

#[async_trait]
impl RecordStore for RedisRecordStore {
    async fn exists(&self, key: &EncodedKey) -> Result<bool> {
        let mut conn = self.conn.clone();
        let exists: bool = conn.exists(self.make_key(key)).await.map_err(AppError::Redis)?;

        Ok(exists)
    }

    async fn store(&self, key: &EncodedKey, raw_key: &str, response: &IdempotentResponse) -> Result<()> {
        let record = KeyRecord::new(
            key.clone(),
            raw_key,
            self.ttl_seconds,
            Some(StoredResponse::from(response)),
        );
        let json = serde_json::to_string(&record)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to serialize record: {}", e)))?;

        let mut conn = self.conn.clone();
        let result: Option<String> = conn
            .set_options(
                self.make_key(key),
                json,
                redis::SetOptions::default()
                    .conditional_set(redis::ExistenceCheck::NX)
                    .with_expiration(redis::SetExpiry::EX(self.ttl_seconds.max(1) as usize)),
            )
            .await
            .map_err(AppError::Redis)?;

        if result.is_none() {
            tracing::debug!(encoded_key = %key, "Record already present, not overwritten");
        }

        Ok(())
    }

    async fn retrieve(&self, key: &EncodedKey) -> Result<Option<StoredResponse>> {
        Ok(self.find_by_key(key).await?.and_then(|record| record.response))
    }

    fn captures_responses(&self) -> bool {
        true
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}

#[derive(Debug, sqlx::FromRow)]
struct KeyRecordRow {
    encoded_key: String,
    raw_key: String,
    response_data: Option<serde_json::Value>,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl TryFrom<KeyRecordRow> for KeyRecord {
    type Error = AppError;

    fn try_from(row: KeyRecordRow) -> Result<Self> {
        let response = row
            .response_data
            .map(serde_json::from_value::<StoredResponse>)
            .transpose()
            .map_err(|e| AppError::Storage(format!("Malformed stored response: {}", e)))?;

        Ok(Self {
            encoded_key: EncodedKey::new(row.encoded_key),
            raw_key: row.raw_key,
            created_at: row.created_at,
            expires_at: row.expires_at,
            response,
        })
    }
}

/// Durable record store. Expired rows are ignored by lookups and removed by
/// [`RecordStore::cleanup_expired`].
#[derive(Clone)]
pub struct PostgresRecordStore {
    pool: PgPool,
    ttl_seconds: i64,
}

impl PostgresRecordStore {
    pub fn new(pool: PgPool, ttl_seconds: i64) -> Self {
        Self { pool, ttl_seconds }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Finds a live record by encoded key.
    pub async fn find_by_key(&self, key: &EncodedKey) -> Result<Option<KeyRecord>> {
        let row = sqlx::query_as::<_, KeyRecordRow>(
            r#"
            SELECT encoded_key, raw_key, response_data, created_at, expires_at
            FROM idempotency_keys
            WHERE encoded_key = $1 AND expires_at > NOW()
            "#,
        )
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::Database)?;

        row.map(KeyRecord::try_from).transpose()
    }

    /// Deletes a specific record by key.
    pub async fn purge(&self, key: &EncodedKey) -> Result<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM idempotency_keys
            WHERE encoded_key = $1
            "#,
        )
        .bind(key.as_str())
        .execute(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(result.rows_affected() > 0)
    }

    /// Counts live records.
    pub async fn count(&self) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM idempotency_keys WHERE expires_at > NOW()
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row.0)
    }
}

#[async_trait]
impl RecordStore for PostgresRecordStore {
    async fn exists(&self, key: &EncodedKey) -> Result<bool> {
        let row: (bool,) = sqlx::query_as(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM idempotency_keys
                WHERE encoded_key = $1 AND expires_at > NOW()
            )
            "#,
        )
        .bind(key.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row.0)
    }

    async fn store(&self, key: &EncodedKey, raw_key: &str, response: &IdempotentResponse) -> Result<()> {
        let record = KeyRecord::new(
            key.clone(),
            raw_key,
            self.ttl_seconds,
            Some(StoredResponse::from(response)),
        );
        let response_data = serde_json::to_value(&record.response)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to serialize response: {}", e)))?;

        // An expired row is replaced; a live one is left untouched.
        sqlx::query(
            r#"
            INSERT INTO idempotency_keys (encoded_key, raw_key, response_data, created_at, expires_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (encoded_key) DO UPDATE
            SET raw_key = EXCLUDED.raw_key,
                response_data = EXCLUDED.response_data,
                created_at = EXCLUDED.created_at,
                expires_at = EXCLUDED.expires_at
            WHERE idempotency_keys.expires_at <= NOW()
            "#,
        )
        .bind(record.encoded_key.as_str())
        .bind(&record.raw_key)
        .bind(response_data)
        .bind(record.created_at)
        .bind(record.expires_at)
        .execute(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(())
    }

    async fn retrieve(&self, key: &EncodedKey) -> Result<Option<StoredResponse>> {
        Ok(self.find_by_key(key).await?.and_then(|record| record.response))
    }

    fn captures_responses(&self) -> bool {
        true
    }

    /// Deletes expired records.
    async fn cleanup_expired(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM idempotency_keys
            WHERE expires_at <= NOW()
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(result.rows_affected())
    }

    fn backend(&self) -> &'static str {
        "postgres"
    }
}

/// Records nothing. Disables duplicate detection while keeping the rest of
/// the pipeline active.
#[derive(Debug, Default)]
pub struct NullRecordStore;

#[async_trait]
impl RecordStore for NullRecordStore {
    async fn exists(&self, _key: &EncodedKey) -> Result<bool> {
        Ok(false)
    }

    async fn store(&self, _key: &EncodedKey, _raw_key: &str, _response: &IdempotentResponse) -> Result<()> {
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "null"
    }
}
