pub mod logging;
pub mod metrics;
pub mod health;

pub use self::logging::{init_logging, LogConfig, LogFormat, mask_sensitive, mask_key};
pub use self::metrics::{init_metrics, get_metrics, Metrics, LatencyTimer, METRICS};
pub use self::health::{HealthChecker, HealthStatus, DependencyHealth, AggregatedHealth};
