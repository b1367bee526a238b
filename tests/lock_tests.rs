mod common;

use common::{create_voucher_request, created_response, redis_url, THE_KEY};
use http::StatusCode;
use idempotency_engine::config::{IdempotencySettings, LockKind};
use idempotency_engine::error::AppError;
use idempotency_engine::idempotency::factory;
use idempotency_engine::idempotency::{
    EncodedKey, IdempotencyCoordinator, InProcessLock, LeaseSettings, LockGranularity,
    LockProvider, MemoryRecordStore, RecordStore, RedisLock, RedisLockClient,
};
use std::sync::Arc;
use std::time::Duration;

fn unique_settings(ttl_ms: u64, timeout_ms: u64) -> LeaseSettings {
    LeaseSettings {
        name: format!("lock-test-{}", uuid::Uuid::new_v4()),
        time_to_live: Duration::from_millis(ttl_ms),
        blocking_timeout: Duration::from_millis(timeout_ms),
    }
}

#[tokio::test]
async fn test_workers_sharing_lock_and_store_see_each_other() {
    let lock: Arc<dyn LockProvider> = Arc::new(InProcessLock::new(
        unique_settings(60_000, 100),
        LockGranularity::Resource,
    ));
    let store: Arc<dyn RecordStore> = Arc::new(MemoryRecordStore::new(60));

    let worker_a = IdempotencyCoordinator::builder()
        .lock(Arc::clone(&lock))
        .store(Arc::clone(&store))
        .build();
    let worker_b = IdempotencyCoordinator::builder()
        .lock(Arc::clone(&lock))
        .store(Arc::clone(&store))
        .build();
    let request = create_voucher_request("myvoucher0");

    let first = worker_a
        .process(Some(THE_KEY), false, false, &request, |_| async { Ok(created_response()) })
        .await
        .unwrap();
    let second = worker_b
        .process(Some(THE_KEY), false, false, &request, |_| async { Ok(created_response()) })
        .await
        .unwrap();

    assert_eq!(first.response.status, StatusCode::CREATED);
    assert_eq!(second.response.status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_resource_lease_times_out_while_held() {
    let lock = InProcessLock::new(unique_settings(60_000, 120), LockGranularity::Resource);

    let held = lock.acquire(&EncodedKey::new("a")).await.unwrap().unwrap();

    let started = std::time::Instant::now();
    let contender = lock.acquire(&EncodedKey::new("b")).await.unwrap();

    assert!(contender.is_none());
    assert!(started.elapsed() >= Duration::from_millis(120));

    lock.release(&held).await;
}

#[tokio::test]
async fn test_lease_names_follow_granularity() {
    let settings = unique_settings(60_000, 0);
    let key = EncodedKey::new("0".repeat(64));

    let resource = InProcessLock::new(settings.clone(), LockGranularity::Resource);
    let scoped = InProcessLock::new(settings.clone(), LockGranularity::Key);

    let resource_lease = resource.acquire(&key).await.unwrap().unwrap();
    let scoped_lease = scoped.acquire(&key).await.unwrap().unwrap();

    assert_eq!(resource_lease.name, settings.name);
    assert_eq!(scoped_lease.name, format!("{}-{}", settings.name, key));
    assert_ne!(resource_lease.owner_token, scoped_lease.owner_token);
}

#[tokio::test]
async fn test_unreachable_lock_location_fails_construction() {
    // Nothing listens on port 1
    let settings = IdempotencySettings {
        lock: LockKind::Redis,
        lock_location: Some("redis://127.0.0.1:1".to_string()),
        ..IdempotencySettings::default()
    };

    let result = factory::build_lock_provider(&settings).await;
    assert!(matches!(result, Err(AppError::Redis(_))));

    let result = IdempotencyCoordinator::from_settings(&settings).await;
    assert!(result.is_err());
}

#[tokio::test]
#[ignore] // Requires Redis running
async fn test_redis_leases_exclude_across_clients() {
    let settings = unique_settings(60_000, 0);
    let first_client = RedisLockClient::connect(&redis_url()).await.unwrap();
    let second_client = RedisLockClient::connect(&redis_url()).await.unwrap();

    let lock_a = RedisLock::new(first_client, settings.clone(), LockGranularity::Key);
    let lock_b = RedisLock::new(second_client, settings, LockGranularity::Key);
    let key = EncodedKey::new("abc");

    let lease = lock_a.acquire(&key).await.unwrap().unwrap();
    assert!(lock_b.acquire(&key).await.unwrap().is_none());

    // A foreign owner token never releases someone else's lease
    let stolen = idempotency_engine::idempotency::Lease::new(lease.name.clone(), lease.ttl, None);
    lock_b.release(&stolen).await;
    assert!(lock_b.acquire(&key).await.unwrap().is_none());

    lock_a.release(&lease).await;
    let lease_b = lock_b.acquire(&key).await.unwrap().unwrap();
    lock_b.release(&lease_b).await;
}

#[tokio::test]
#[ignore] // Requires Redis running
async fn test_redis_resource_waiter_acquires_after_release() {
    let client = RedisLockClient::connect(&redis_url()).await.unwrap();
    let lock = Arc::new(RedisLock::new(
        client,
        unique_settings(60_000, 2_000),
        LockGranularity::Resource,
    ));

    let held = lock.acquire(&EncodedKey::new("a")).await.unwrap().unwrap();

    let contender = {
        let lock = Arc::clone(&lock);
        tokio::spawn(async move { lock.acquire(&EncodedKey::new("b")).await })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    lock.release(&held).await;

    let acquired = contender.await.unwrap().unwrap();
    assert!(acquired.is_some());
    lock.release(&acquired.unwrap()).await;
}

#[tokio::test]
#[ignore] // Requires Redis running
async fn test_coordinators_share_redis_key_lock() {
    let settings = IdempotencySettings {
        lock: LockKind::RedisKey,
        lock_location: Some(redis_url()),
        lock_name: format!("lock-test-{}", uuid::Uuid::new_v4()),
        ..IdempotencySettings::default()
    };
    let client = RedisLockClient::connect(&redis_url()).await.unwrap();
    let store: Arc<dyn RecordStore> = Arc::new(MemoryRecordStore::new(60));

    let worker_a = IdempotencyCoordinator::builder()
        .lock(factory::build_lock_provider_with_client(&settings, client.clone()).unwrap())
        .store(Arc::clone(&store))
        .build();
    let worker_b = IdempotencyCoordinator::builder()
        .lock(factory::build_lock_provider_with_client(&settings, client).unwrap())
        .store(Arc::clone(&store))
        .build();
    let request = create_voucher_request("myvoucher0");

    let first = worker_a
        .process(Some(THE_KEY), false, false, &request, |_| async { Ok(created_response()) })
        .await
        .unwrap();
    let second = worker_b
        .process(Some(THE_KEY), false, false, &request, |_| async { Ok(created_response()) })
        .await
        .unwrap();

    assert!(!first.existed);
    assert!(second.existed);
    assert_eq!(worker_b.lock().backend(), "redis");
}
