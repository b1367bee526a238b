use crate::error::Result;
use crate::idempotency::key_generator::EncodedKey;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

/// How often a blocking contender re-checks a lease that may have expired.
pub(crate) const RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Which requests share a lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockGranularity {
    /// One lease for the whole engine. Serializes every idempotent request and
    /// blocks up to the configured timeout.
    Resource,
    /// One lease per encoded key. Never waits: a held lease fails immediately.
    Key,
}

impl LockGranularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockGranularity::Resource => "resource",
            LockGranularity::Key => "key",
        }
    }
}

/// Lease timings shared by every lock provider.
#[derive(Debug, Clone)]
pub struct LeaseSettings {
    pub name: String,
    /// Forced-release bound: a lease expires after this even if never released.
    pub time_to_live: Duration,
    /// How long a resource-scoped contender waits before giving up.
    pub blocking_timeout: Duration,
}

impl Default for LeaseSettings {
    fn default() -> Self {
        Self {
            name: "idempotency-key-lock".to_string(),
            time_to_live: Duration::from_secs(300),
            blocking_timeout: Duration::from_millis(100),
        }
    }
}

impl LeaseSettings {
    /// Lease name for a request under the given granularity.
    pub fn lease_name(&self, granularity: LockGranularity, key: &EncodedKey) -> String {
        match granularity {
            LockGranularity::Resource => self.name.clone(),
            LockGranularity::Key => format!("{}-{}", self.name, key),
        }
    }

    pub fn blocking_timeout_for(&self, granularity: LockGranularity) -> Option<Duration> {
        match granularity {
            LockGranularity::Resource => Some(self.blocking_timeout),
            LockGranularity::Key => None,
        }
    }
}

/// A held lease. Only the owner token can release it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub name: String,
    pub owner_token: String,
    pub ttl: Duration,
    /// `None` for non-blocking (key-scoped) acquisition.
    pub blocking_timeout: Option<Duration>,
}

impl Lease {
    pub fn new(name: impl Into<String>, ttl: Duration, blocking_timeout: Option<Duration>) -> Self {
        Self {
            name: name.into(),
            owner_token: Uuid::new_v4().to_string(),
            ttl,
            blocking_timeout,
        }
    }
}

/// Mutual exclusion around the check-then-record critical section.
#[async_trait]
pub trait LockProvider: Send + Sync {
    /// Returns `Some(lease)` iff the lease was obtained before its timeout.
    async fn acquire(&self, key: &EncodedKey) -> Result<Option<Lease>>;

    /// Best-effort release. Releasing a lease that expired, was already released
    /// or is owned by someone else is a no-op. Failures are logged, never returned.
    async fn release(&self, lease: &Lease);

    fn granularity(&self) -> LockGranularity;

    /// Name of the lease `acquire` would take for `key`.
    fn lease_name(&self, key: &EncodedKey) -> String {
        key.to_string()
    }

    /// Short backend name used in logs and metrics.
    fn backend(&self) -> &'static str;
}

/// A held lease that is handed back to its provider when the guard goes away.
///
/// [`LeaseGuard::release`] awaits the release. Dropping the guard instead (a
/// panicking handler, a cancelled request) schedules the release on the
/// current tokio runtime.
pub struct LeaseGuard {
    lock: Arc<dyn LockProvider>,
    lease: Option<Lease>,
}

impl LeaseGuard {
    pub fn new(lock: Arc<dyn LockProvider>, lease: Lease) -> Self {
        Self {
            lock,
            lease: Some(lease),
        }
    }

    pub fn lease(&self) -> Option<&Lease> {
        self.lease.as_ref()
    }

    pub async fn release(mut self) {
        if let Some(lease) = self.lease.take() {
            self.lock.release(&lease).await;
        }
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        let Some(lease) = self.lease.take() else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::warn!(lease = %lease.name, "Lease abandoned mid-request, releasing in background");
                let lock = Arc::clone(&self.lock);
                handle.spawn(async move {
                    lock.release(&lease).await;
                });
            }
            Err(_) => {
                tracing::warn!(lease = %lease.name, "No runtime to release abandoned lease, relying on TTL");
            }
        }
    }
}

#[derive(Debug)]
struct HeldLease {
    owner_token: String,
    expires_at: Instant,
}

/// Single-process lease table. Adequate when only one engine instance runs.
pub struct InProcessLock {
    settings: LeaseSettings,
    granularity: LockGranularity,
    leases: Mutex<HashMap<String, HeldLease>>,
    released: Notify,
}

impl InProcessLock {
    pub fn new(settings: LeaseSettings, granularity: LockGranularity) -> Self {
        Self {
            settings,
            granularity,
            leases: Mutex::new(HashMap::new()),
            released: Notify::new(),
        }
    }

    fn try_claim(&self, lease: &Lease) -> bool {
        let now = Instant::now();
        let mut leases = match self.leases.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(held) = leases.get(&lease.name) {
            if held.expires_at > now {
                return false;
            }
            tracing::debug!(lease = %lease.name, "Reclaiming expired lease");
        }

        leases.insert(
            lease.name.clone(),
            HeldLease {
                owner_token: lease.owner_token.clone(),
                expires_at: now + lease.ttl,
            },
        );
        true
    }

    /// Number of leases currently recorded, expired ones included.
    pub fn held_count(&self) -> usize {
        match self.leases.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

#[async_trait]
impl LockProvider for InProcessLock {
    async fn acquire(&self, key: &EncodedKey) -> Result<Option<Lease>> {
        let lease = Lease::new(
            self.settings.lease_name(self.granularity, key),
            self.settings.time_to_live,
            self.settings.blocking_timeout_for(self.granularity),
        );

        let deadline = lease.blocking_timeout.map(|timeout| Instant::now() + timeout);

        loop {
            // Register interest before checking so a release in between is not missed.
            let released = self.released.notified();

            if self.try_claim(&lease) {
                return Ok(Some(lease));
            }

            let Some(deadline) = deadline else {
                return Ok(None);
            };

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            let wait = (deadline - now).min(RETRY_INTERVAL);
            let _ = tokio::time::timeout(wait, released).await;
        }
    }

    async fn release(&self, lease: &Lease) {
        let removed = {
            let mut leases = match self.leases.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };

            match leases.get(&lease.name) {
                Some(held) if held.owner_token == lease.owner_token => {
                    leases.remove(&lease.name);
                    true
                }
                _ => false,
            }
        };

        if removed {
            self.released.notify_waiters();
        } else {
            tracing::debug!(lease = %lease.name, "Release of lease not held by caller ignored");
        }
    }

    fn granularity(&self) -> LockGranularity {
        self.granularity
    }

    fn lease_name(&self, key: &EncodedKey) -> String {
        self.settings.lease_name(self.granularity, key)
    }

    fn backend(&self) -> &'static str {
        "in_process"
    }
}

/// Grants every request immediately. Only selected when key-scoped remote
/// locking is chosen without a lock location.
#[derive(Debug, Default)]
pub struct NoopLock;

#[async_trait]
impl LockProvider for NoopLock {
    async fn acquire(&self, key: &EncodedKey) -> Result<Option<Lease>> {
        Ok(Some(Lease::new(key.to_string(), Duration::ZERO, None)))
    }

    async fn release(&self, _lease: &Lease) {}

    fn granularity(&self) -> LockGranularity {
        LockGranularity::Key
    }

    fn backend(&self) -> &'static str {
        "noop"
    }
}
