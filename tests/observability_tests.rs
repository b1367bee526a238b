use idempotency_engine::idempotency::IdempotencyMetrics;
use idempotency_engine::observability::{
    get_metrics, mask_key, mask_sensitive, AggregatedHealth, DependencyHealth, HealthStatus,
    LatencyTimer, LogConfig, LogFormat, Metrics,
};
use std::sync::Arc;
use std::thread;

#[test]
fn test_log_config_from_settings_values() {
    let config = LogConfig::new("debug", "JSON");
    assert_eq!(config.level, "debug");
    assert_eq!(config.format, LogFormat::Json);
    assert_eq!(LogConfig::default(), LogConfig::new("info", "pretty"));

    let fallback = LogConfig::new("info", "fancy");
    assert_eq!(fallback.format, LogFormat::Pretty);
}

#[test]
fn test_mask_sensitive_exact_boundary() {
    assert_eq!(mask_sensitive("abcd", 2), "****");
    assert_eq!(mask_sensitive("abcde", 2), "ab*de");
}

#[test]
fn test_mask_key_hides_middle_of_uuid() {
    let masked = mask_key("7495e32b-709b-4fae-bfd4-2497094bf3fd");
    assert_eq!(masked.chars().count(), 36);
    assert_eq!(&masked[..4], "7495");
    assert!(!masked.contains("709b"));
}

#[test]
fn test_metrics_recording_without_recorder() {
    let metrics = Metrics::new();

    metrics.record_request("new");
    metrics.record_lock_acquire("in_process", "resource", true, 0.2);
    metrics.record_store_operation("memory", "store", 0.1, true);
    metrics.record_durability_gap("postgres");
    metrics.record_cleanup(3);

    get_metrics().record_request("duplicate");
}

#[test]
fn test_latency_timer() {
    let timer = LatencyTimer::new();
    thread::sleep(std::time::Duration::from_millis(5));
    assert!(timer.elapsed_ms() >= 5.0);
}

#[test]
fn test_idempotency_metrics_concurrent_access() {
    let metrics = Arc::new(IdempotencyMetrics::new());
    let mut handles = vec![];

    for _ in 0..10 {
        let metrics = metrics.clone();
        handles.push(thread::spawn(move || {
            for _ in 0..1000 {
                metrics.record_request();
                metrics.record_request();
                metrics.record_duplicate();
            }
        }));
    }

    for handle in handles {
        handle.join().unwrap();
    }

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.total_requests, 20000);
    assert_eq!(snapshot.duplicate_requests, 10000);
    assert!((metrics.duplicate_rate() - 0.5).abs() < 0.01);
}

#[test]
fn test_duplicate_rate_with_no_requests() {
    assert_eq!(IdempotencyMetrics::new().duplicate_rate(), 0.0);
}

#[test]
fn test_health_status_serialization() {
    assert_eq!(serde_json::to_string(&HealthStatus::Healthy).unwrap(), "\"healthy\"");
    assert_eq!(serde_json::to_string(&HealthStatus::Degraded).unwrap(), "\"degraded\"");
    assert_eq!(serde_json::to_string(&HealthStatus::Unhealthy).unwrap(), "\"unhealthy\"");
}

#[test]
fn test_aggregated_health_serialization() {
    let dependencies = vec![
        DependencyHealth::healthy("lock_store", 1.5),
        DependencyHealth::unhealthy("record_store", "Connection timeout"),
    ];
    let health = AggregatedHealth::new("0.1.0".to_string(), dependencies);
    let json = serde_json::to_string(&health).unwrap();

    assert!(json.contains("\"status\":\"unhealthy\""));
    assert!(json.contains("\"version\":\"0.1.0\""));
    assert!(json.contains("\"name\":\"lock_store\""));
    assert!(json.contains("\"latency_ms\":1.5"));
    assert!(json.contains("\"message\":\"Connection timeout\""));
}
