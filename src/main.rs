use idempotency_engine::config::{LockKind, Settings, StorageKind};
use idempotency_engine::error::AppError;
use idempotency_engine::idempotency::factory;
use idempotency_engine::idempotency::{
    IdempotencyCleanupJob, IdempotencyCoordinator, LockProvider, PostgresRecordStore, RecordStore,
    RedisLockClient,
};
use idempotency_engine::observability::{init_logging, init_metrics, HealthChecker, LogConfig};
use std::sync::Arc;
use tracing::info;

const CLEANUP_INTERVAL_SECS: u64 = 300;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    // Load configuration
    let settings = Settings::new()?;

    init_logging(&LogConfig::new(
        settings.application.log_level.clone(),
        &settings.application.log_format,
    ));
    info!("Configuration loaded");

    let _metrics = init_metrics()?;

    let idempotency = &settings.idempotency;

    // Connect to the lock store
    let lock_client = match (idempotency.lock, idempotency.lock_location()) {
        (LockKind::Redis | LockKind::RedisKey, Some(location)) => {
            info!("Connecting to lock store...");
            let client = RedisLockClient::connect(location).await?;
            info!("Lock store connection established");
            Some(client)
        }
        _ => None,
    };

    let lock: Arc<dyn LockProvider> = match &lock_client {
        Some(client) => factory::build_lock_provider_with_client(idempotency, client.clone())?,
        None => factory::build_lock_provider(idempotency).await?,
    };

    // Connect to the record store
    let mut database = None;
    let store: Arc<dyn RecordStore> = match idempotency.storage {
        StorageKind::Postgres => {
            info!("Connecting to record database...");
            let pool = factory::connect_record_database(idempotency).await?;
            info!("Record database connection established");

            info!("Running database migrations...");
            sqlx::migrate!("./migrations").run(&pool).await?;
            info!("Migrations applied successfully");

            database = Some(pool.clone());
            Arc::new(PostgresRecordStore::new(pool, idempotency.storage_ttl_seconds()))
        }
        _ => factory::build_record_store(idempotency).await?,
    };

    let coordinator = Arc::new(
        IdempotencyCoordinator::builder()
            .encoder(factory::build_encoder(idempotency.encoder))
            .lock(lock)
            .store(store)
            .policy(idempotency.conflict_policy()?)
            .build(),
    );

    let health = HealthChecker::new(lock_client, database).check_all().await;
    for dependency in &health.dependencies {
        info!(
            dependency = %dependency.name,
            status = ?dependency.status,
            latency_ms = ?dependency.latency_ms,
            "Dependency checked"
        );
    }

    if health.status.is_unhealthy() {
        return Err(AppError::Internal(anyhow::anyhow!(
            "Startup verification failed: a dependency is unhealthy"
        ))
        .into());
    }

    info!(
        lock = coordinator.lock().backend(),
        storage = coordinator.store().backend(),
        "System startup verification complete: All services healthy."
    );

    if idempotency.storage == StorageKind::Postgres {
        let cleanup = IdempotencyCleanupJob::new(Arc::clone(&coordinator), CLEANUP_INTERVAL_SECS).start();
        info!("Expired record cleanup running, press Ctrl+C to stop");
        tokio::signal::ctrl_c().await?;
        cleanup.abort();
        info!("Shutting down");
    }

    Ok(())
}
