pub mod conflict;
pub mod factory;
pub mod handler;
pub mod key_generator;
pub mod lock;
pub mod redis_lock;
pub mod response;
pub mod storage;

pub use conflict::{ConflictPolicy, ConflictSentinel, ConflictStatusSetting};
pub use handler::{
    IdempotencyCleanupJob, IdempotencyCoordinator, IdempotencyCoordinatorBuilder,
    IdempotencyMetrics, MetricsSnapshot, ProcessOutcome,
};
pub use key_generator::{EncodedKey, KeyEncoder, RawKeyEncoder, RequestAttributes, Sha256KeyEncoder};
pub use lock::{InProcessLock, Lease, LeaseGuard, LeaseSettings, LockGranularity, LockProvider, NoopLock};
pub use redis_lock::{RedisLock, RedisLockClient};
pub use response::{IdempotentResponse, StoredResponse};
pub use storage::{
    KeyRecord, MemoryRecordStore, NullRecordStore, PostgresRecordStore, RecordStore,
    RedisRecordStore,
};
