use crate::idempotency::redis_lock::RedisLockClient;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::time::Duration;

const CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Health status of a service or dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, HealthStatus::Degraded)
    }

    pub fn is_unhealthy(&self) -> bool {
        matches!(self, HealthStatus::Unhealthy)
    }
}

/// Health status of a single dependency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyHealth {
    pub name: String,
    pub status: HealthStatus,
    pub latency_ms: Option<f64>,
    pub message: Option<String>,
}

impl DependencyHealth {
    pub fn healthy(name: impl Into<String>, latency_ms: f64) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Healthy,
            latency_ms: Some(latency_ms),
            message: None,
        }
    }

    pub fn degraded(name: impl Into<String>, latency_ms: f64, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Degraded,
            latency_ms: Some(latency_ms),
            message: Some(message.into()),
        }
    }

    pub fn unhealthy(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Unhealthy,
            latency_ms: None,
            message: Some(message.into()),
        }
    }

    fn from_latency(name: &str, latency_ms: f64, degraded_above_ms: f64) -> Self {
        if latency_ms > degraded_above_ms {
            Self::degraded(name, latency_ms, "High latency detected")
        } else {
            Self::healthy(name, latency_ms)
        }
    }
}

/// Aggregated health check result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedHealth {
    pub status: HealthStatus,
    pub version: String,
    pub dependencies: Vec<DependencyHealth>,
}

impl AggregatedHealth {
    pub fn new(version: String, dependencies: Vec<DependencyHealth>) -> Self {
        let status = Self::aggregate_status(&dependencies);
        Self {
            status,
            version,
            dependencies,
        }
    }

    fn aggregate_status(dependencies: &[DependencyHealth]) -> HealthStatus {
        let has_unhealthy = dependencies.iter().any(|d| d.status.is_unhealthy());
        let has_degraded = dependencies.iter().any(|d| d.status.is_degraded());

        if has_unhealthy {
            HealthStatus::Unhealthy
        } else if has_degraded {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}

/// Health checker for the coordination store and the durable record store.
///
/// Dependencies that are not configured are left out of the report.
#[derive(Default)]
pub struct HealthChecker {
    lock_store: Option<RedisLockClient>,
    database: Option<PgPool>,
}

impl HealthChecker {
    pub fn new(lock_store: Option<RedisLockClient>, database: Option<PgPool>) -> Self {
        Self {
            lock_store,
            database,
        }
    }

    pub async fn check_all(&self) -> AggregatedHealth {
        let mut dependencies = Vec::new();

        if let Some(health) = self.check_lock_store().await {
            dependencies.push(health);
        }
        if let Some(health) = self.check_database().await {
            dependencies.push(health);
        }

        AggregatedHealth::new(env!("CARGO_PKG_VERSION").to_string(), dependencies)
    }

    /// Pings the Redis lock store.
    pub async fn check_lock_store(&self) -> Option<DependencyHealth> {
        let client = self.lock_store.as_ref()?;
        let mut conn = client.connection();
        let start = std::time::Instant::now();

        let health = match tokio::time::timeout(
            CHECK_TIMEOUT,
            redis::cmd("PING").query_async::<_, ()>(&mut conn),
        )
        .await
        {
            Ok(Ok(())) => {
                DependencyHealth::from_latency("lock_store", start.elapsed().as_secs_f64() * 1000.0, 50.0)
            }
            Ok(Err(e)) => DependencyHealth::unhealthy("lock_store", format!("PING failed: {}", e)),
            Err(_) => DependencyHealth::unhealthy("lock_store", "PING timeout"),
        };

        Some(health)
    }

    /// Runs a trivial query against the record database.
    pub async fn check_database(&self) -> Option<DependencyHealth> {
        let pool = self.database.as_ref()?;
        let start = std::time::Instant::now();

        let health = match tokio::time::timeout(CHECK_TIMEOUT, sqlx::query("SELECT 1").fetch_one(pool)).await {
            Ok(Ok(_)) => {
                DependencyHealth::from_latency("record_store", start.elapsed().as_secs_f64() * 1000.0, 100.0)
            }
            Ok(Err(e)) => DependencyHealth::unhealthy("record_store", format!("Query failed: {}", e)),
            Err(_) => DependencyHealth::unhealthy("record_store", "Connection timeout"),
        };

        Some(health)
    }

    /// Ready when every configured dependency is at least degraded.
    pub async fn is_ready(&self) -> bool {
        !self.check_all().await.status.is_unhealthy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_status() {
        assert!(HealthStatus::Healthy.is_healthy());
        assert!(!HealthStatus::Healthy.is_degraded());
        assert!(!HealthStatus::Healthy.is_unhealthy());

        assert!(!HealthStatus::Degraded.is_healthy());
        assert!(HealthStatus::Degraded.is_degraded());

        assert!(HealthStatus::Unhealthy.is_unhealthy());
    }

    #[test]
    fn test_latency_threshold() {
        assert_eq!(DependencyHealth::from_latency("x", 10.0, 50.0).status, HealthStatus::Healthy);
        assert_eq!(DependencyHealth::from_latency("x", 80.0, 50.0).status, HealthStatus::Degraded);
    }

    #[test]
    fn test_aggregated_health_status() {
        let all_healthy = vec![
            DependencyHealth::healthy("lock_store", 1.0),
            DependencyHealth::healthy("record_store", 2.0),
        ];
        assert_eq!(AggregatedHealth::new("1.0.0".to_string(), all_healthy).status, HealthStatus::Healthy);

        let one_degraded = vec![
            DependencyHealth::healthy("lock_store", 1.0),
            DependencyHealth::degraded("record_store", 150.0, "slow"),
        ];
        assert_eq!(AggregatedHealth::new("1.0.0".to_string(), one_degraded).status, HealthStatus::Degraded);

        let one_unhealthy = vec![
            DependencyHealth::healthy("lock_store", 1.0),
            DependencyHealth::unhealthy("record_store", "down"),
        ];
        assert_eq!(AggregatedHealth::new("1.0.0".to_string(), one_unhealthy).status, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_nothing_configured_is_healthy() {
        let checker = HealthChecker::default();
        let health = checker.check_all().await;

        assert!(health.dependencies.is_empty());
        assert!(health.status.is_healthy());
        assert!(checker.is_ready().await);
    }
}
