pub mod cleanup;
pub mod hashing;
pub mod ledger;
pub mod lock;
pub mod record;
pub mod storage;

pub use cleanup::IdempotencyCleanupJob;
pub use hashing::{hash_body, hash_request, is_valid_body_hash, BODY_HASH_LEN};
pub use ledger::{
    IdempotencyCheckResult, IdempotencyLedger, IdempotencyMetrics, LedgerConfig, MetricsSnapshot,
    MAX_OPERATION_LENGTH,
};
pub use lock::{InProcessKeyLock, KeyGuard, KeyLock, StorageKeyLock};
pub use record::{composite_identity, slot_key, CapturedResponse, IdempotencyRecord, IdempotencyStatus};
pub use storage::{
    IdempotencyStore, InMemoryIdempotencyStore, PostgresIdempotencyStore, RedisIdempotencyStore,
};
