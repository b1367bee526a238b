use crate::config::IdempotencySettings;
use crate::error::{AppError, Result};
use crate::idempotency::conflict::ConflictPolicy;
use crate::idempotency::factory;
use crate::idempotency::key_generator::{EncodedKey, KeyEncoder, RequestAttributes, Sha256KeyEncoder};
use crate::idempotency::lock::{InProcessLock, LeaseGuard, LeaseSettings, LockGranularity, LockProvider};
use crate::idempotency::response::{IdempotentResponse, StoredResponse};
use crate::idempotency::storage::{MemoryRecordStore, RecordStore};
use crate::observability::{get_metrics, mask_key, LatencyTimer};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Counters for idempotency handling.
#[derive(Debug, Default)]
pub struct IdempotencyMetrics {
    pub total_requests: AtomicU64,
    pub exempt_requests: AtomicU64,
    pub duplicate_requests: AtomicU64,
    pub new_requests: AtomicU64,
    pub recorded_requests: AtomicU64,
    pub failed_requests: AtomicU64,
    pub lock_failures: AtomicU64,
    pub durability_gaps: AtomicU64,
}

impl IdempotencyMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_exempt(&self) {
        self.exempt_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate(&self) {
        self.duplicate_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_new(&self) {
        self.new_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_recorded(&self) {
        self.recorded_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lock_failure(&self) {
        self.lock_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_durability_gap(&self) {
        self.durability_gaps.fetch_add(1, Ordering::Relaxed);
    }

    pub fn duplicate_rate(&self) -> f64 {
        self.snapshot().duplicate_rate()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            exempt_requests: self.exempt_requests.load(Ordering::Relaxed),
            duplicate_requests: self.duplicate_requests.load(Ordering::Relaxed),
            new_requests: self.new_requests.load(Ordering::Relaxed),
            recorded_requests: self.recorded_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            lock_failures: self.lock_failures.load(Ordering::Relaxed),
            durability_gaps: self.durability_gaps.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub exempt_requests: u64,
    pub duplicate_requests: u64,
    pub new_requests: u64,
    pub recorded_requests: u64,
    pub failed_requests: u64,
    pub lock_failures: u64,
    pub durability_gaps: u64,
}

impl MetricsSnapshot {
    pub fn duplicate_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.duplicate_requests as f64 / self.total_requests as f64
        }
    }
}

/// Result of [`IdempotencyCoordinator::process`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutcome {
    pub response: IdempotentResponse,
    /// A record for the encoded key already existed when the request was checked.
    pub existed: bool,
    /// `None` for exempt requests.
    pub encoded_key: Option<EncodedKey>,
}

/// Runs requests through encode → lease → existence check → handler → record.
///
/// This is the only entry point the transport middleware calls.
pub struct IdempotencyCoordinator {
    encoder: Arc<dyn KeyEncoder>,
    lock: Arc<dyn LockProvider>,
    store: Arc<dyn RecordStore>,
    policy: ConflictPolicy,
    metrics: Arc<IdempotencyMetrics>,
}

impl IdempotencyCoordinator {
    pub fn builder() -> IdempotencyCoordinatorBuilder {
        IdempotencyCoordinatorBuilder::default()
    }

    /// Builds every component from settings. Connections to remote lock and
    /// record stores are opened here and fail construction if unreachable.
    pub async fn from_settings(settings: &IdempotencySettings) -> Result<Self> {
        settings.check()?;

        let policy = settings.conflict_policy()?;
        let encoder = factory::build_encoder(settings.encoder);
        let lock = factory::build_lock_provider(settings).await?;
        let store = factory::build_record_store(settings).await?;

        tracing::info!(
            encoder = ?settings.encoder,
            lock = lock.backend(),
            granularity = lock.granularity().as_str(),
            storage = store.backend(),
            "Idempotency coordinator configured"
        );

        Ok(Self::builder()
            .encoder(encoder)
            .lock(lock)
            .store(store)
            .policy(policy)
            .build())
    }

    /// Gets the counters for this coordinator.
    pub fn metrics(&self) -> Arc<IdempotencyMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn policy(&self) -> ConflictPolicy {
        self.policy
    }

    pub fn store(&self) -> Arc<dyn RecordStore> {
        Arc::clone(&self.store)
    }

    pub fn lock(&self) -> Arc<dyn LockProvider> {
        Arc::clone(&self.lock)
    }

    /// Encodes a request the same way `process` does.
    pub fn encode(&self, raw_key: &str, request: &RequestAttributes) -> EncodedKey {
        self.encoder.encode(raw_key, request)
    }

    /// Processes one request.
    ///
    /// `handler` receives whether a record already existed. It only sees `true`
    /// in manual mode; otherwise duplicates are answered by the conflict policy
    /// without running it.
    ///
    /// # Errors
    ///
    /// - `Configuration` if both `exempt` and `manual` are set.
    /// - `KeyRequired` if a non-exempt request has no raw key.
    /// - `LockUnavailable` if the lease could not be obtained.
    /// - store or lock backend errors raised before the handler ran.
    /// - whatever the handler returns.
    pub async fn process<F, Fut>(
        &self,
        raw_key: Option<&str>,
        exempt: bool,
        manual: bool,
        request: &RequestAttributes,
        handler: F,
    ) -> Result<ProcessOutcome>
    where
        F: FnOnce(bool) -> Fut,
        Fut: Future<Output = Result<IdempotentResponse>>,
    {
        self.metrics.record_request();

        if exempt && manual {
            get_metrics().record_request("rejected");
            return Err(AppError::Configuration(
                "A request cannot be both exempt and manual".to_string(),
            ));
        }

        if exempt {
            self.metrics.record_exempt();
            get_metrics().record_request("exempt");
            let response = handler(false).await?;
            return Ok(ProcessOutcome {
                response,
                existed: false,
                encoded_key: None,
            });
        }

        let raw_key = match raw_key {
            Some(key) if !key.trim().is_empty() => key,
            _ => {
                get_metrics().record_request("rejected");
                return Err(AppError::KeyRequired);
            }
        };

        let encoded_key = self.encoder.encode(raw_key, request);
        let lease = self.acquire(&encoded_key).await?;

        let outcome = self
            .process_locked(raw_key, &encoded_key, manual, handler)
            .await;

        lease.release().await;

        if outcome.is_err() {
            get_metrics().record_request("failed");
        }

        outcome
    }

    /// The guard releases the lease on every exit, unwinding and cancellation included.
    async fn acquire(&self, key: &EncodedKey) -> Result<LeaseGuard> {
        let timer = LatencyTimer::new();
        let acquired = self.lock.acquire(key).await;

        let obtained = matches!(acquired, Ok(Some(_)));
        get_metrics().record_lock_acquire(
            self.lock.backend(),
            self.lock.granularity().as_str(),
            obtained,
            timer.elapsed_ms(),
        );

        match acquired {
            Ok(Some(lease)) => Ok(LeaseGuard::new(Arc::clone(&self.lock), lease)),
            Ok(None) => {
                self.metrics.record_lock_failure();
                tracing::warn!(encoded_key = %key, "Lease unavailable, request not processed");
                Err(AppError::LockUnavailable {
                    name: self.lock.lease_name(key),
                })
            }
            Err(e) => {
                self.metrics.record_lock_failure();
                tracing::error!(encoded_key = %key, error = %e, "Lease acquisition failed");
                Err(e)
            }
        }
    }

    /// Everything between acquiring and releasing the lease.
    async fn process_locked<F, Fut>(
        &self,
        raw_key: &str,
        encoded_key: &EncodedKey,
        manual: bool,
        handler: F,
    ) -> Result<ProcessOutcome>
    where
        F: FnOnce(bool) -> Fut,
        Fut: Future<Output = Result<IdempotentResponse>>,
    {
        let existed = self.check_exists(encoded_key).await?;

        if existed {
            self.metrics.record_duplicate();
        } else {
            self.metrics.record_new();
        }

        if existed && !manual {
            let response = self.conflict_response(encoded_key).await?;
            get_metrics().record_request("duplicate");
            tracing::info!(
                encoded_key = %encoded_key,
                raw_key = %mask_key(raw_key),
                status = response.status.as_u16(),
                "Duplicate request answered by conflict policy"
            );
            return Ok(ProcessOutcome {
                response,
                existed: true,
                encoded_key: Some(encoded_key.clone()),
            });
        }

        let response = match handler(existed).await {
            Ok(response) => response,
            Err(e) => {
                self.metrics.record_failed();
                tracing::warn!(encoded_key = %encoded_key, error = %e, "Handler failed, key not recorded");
                return Err(e);
            }
        };

        if existed {
            get_metrics().record_request("manual_duplicate");
        } else {
            get_metrics().record_request("new");
            self.record(encoded_key, raw_key, &response).await;
        }

        Ok(ProcessOutcome {
            response,
            existed,
            encoded_key: Some(encoded_key.clone()),
        })
    }

    async fn check_exists(&self, key: &EncodedKey) -> Result<bool> {
        let timer = LatencyTimer::new();
        let result = self.store.exists(key).await;

        get_metrics().record_store_operation(
            self.store.backend(),
            "exists",
            timer.elapsed_ms(),
            result.is_ok(),
        );

        result.map_err(|e| {
            tracing::error!(encoded_key = %key, error = %e, "Existence check failed");
            e
        })
    }

    async fn conflict_response(&self, key: &EncodedKey) -> Result<IdempotentResponse> {
        let original = if self.policy.replays_original() && self.store.captures_responses() {
            self.retrieve_original(key).await
        } else {
            None
        };

        self.policy.resolve(original)
    }

    /// A failed lookup degrades to a plain conflict rather than failing the request.
    async fn retrieve_original(&self, key: &EncodedKey) -> Option<StoredResponse> {
        let timer = LatencyTimer::new();
        let result = self.store.retrieve(key).await;

        get_metrics().record_store_operation(
            self.store.backend(),
            "retrieve",
            timer.elapsed_ms(),
            result.is_ok(),
        );

        match result {
            Ok(stored) => stored,
            Err(e) => {
                tracing::warn!(encoded_key = %key, error = %e, "Could not load original response");
                None
            }
        }
    }

    /// Best effort: the handler already ran, so its response is returned even
    /// when recording fails.
    async fn record(&self, key: &EncodedKey, raw_key: &str, response: &IdempotentResponse) {
        let timer = LatencyTimer::new();
        let result = self.store.store(key, raw_key, response).await;

        get_metrics().record_store_operation(
            self.store.backend(),
            "store",
            timer.elapsed_ms(),
            result.is_ok(),
        );

        match result {
            Ok(()) => self.metrics.record_recorded(),
            Err(e) => {
                self.metrics.record_durability_gap();
                get_metrics().record_durability_gap(self.store.backend());
                tracing::error!(
                    encoded_key = %key,
                    raw_key = %mask_key(raw_key),
                    error = %e,
                    "Durability gap: handler ran but idempotency key was not recorded"
                );
            }
        }
    }

    /// Runs cleanup of expired records.
    pub async fn cleanup_expired(&self) -> Result<u64> {
        let removed = self.store.cleanup_expired().await?;
        get_metrics().record_cleanup(removed);
        Ok(removed)
    }
}

/// Explicit wiring for [`IdempotencyCoordinator`].
///
/// Unset parts default to the SHA-256 encoder, an in-process resource lease,
/// a 24 hour in-memory store and a 409 conflict policy.
#[derive(Default)]
pub struct IdempotencyCoordinatorBuilder {
    encoder: Option<Arc<dyn KeyEncoder>>,
    lock: Option<Arc<dyn LockProvider>>,
    store: Option<Arc<dyn RecordStore>>,
    policy: ConflictPolicy,
}

impl IdempotencyCoordinatorBuilder {
    pub fn encoder(mut self, encoder: Arc<dyn KeyEncoder>) -> Self {
        self.encoder = Some(encoder);
        self
    }

    pub fn lock(mut self, lock: Arc<dyn LockProvider>) -> Self {
        self.lock = Some(lock);
        self
    }

    pub fn store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn policy(mut self, policy: ConflictPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn build(self) -> IdempotencyCoordinator {
        IdempotencyCoordinator {
            encoder: self.encoder.unwrap_or_else(|| Arc::new(Sha256KeyEncoder::new())),
            lock: self.lock.unwrap_or_else(|| {
                Arc::new(InProcessLock::new(LeaseSettings::default(), LockGranularity::Resource))
            }),
            store: self.store.unwrap_or_else(|| Arc::new(MemoryRecordStore::new(86400))),
            policy: self.policy,
            metrics: Arc::new(IdempotencyMetrics::new()),
        }
    }
}

/// Background cleanup job for expired idempotency records.
pub struct IdempotencyCleanupJob {
    coordinator: Arc<IdempotencyCoordinator>,
    interval_seconds: u64,
}

impl IdempotencyCleanupJob {
    pub fn new(coordinator: Arc<IdempotencyCoordinator>, interval_seconds: u64) -> Self {
        Self {
            coordinator,
            interval_seconds,
        }
    }

    /// Runs the cleanup job once.
    pub async fn run_once(&self) -> Result<u64> {
        self.coordinator.cleanup_expired().await
    }

    /// Starts the cleanup job in a background task.
    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(
                self.interval_seconds.max(1),
            ));

            loop {
                interval.tick().await;

                match self.coordinator.cleanup_expired().await {
                    Ok(count) => {
                        if count > 0 {
                            tracing::info!("Cleaned up {} expired idempotency records", count);
                        }
                    }
                    Err(e) => {
                        tracing::error!("Failed to cleanup expired idempotency records: {}", e);
                    }
                }
            }
        })
    }
}
