use crate::error::{AppError, Result};
use crate::idempotency::hashing::{is_valid_body_hash, BODY_HASH_LEN};
use crate::idempotency::lock::{InProcessKeyLock, KeyLock};
use crate::idempotency::record::{slot_key, CapturedResponse, IdempotencyRecord};
use crate::idempotency::storage::{IdempotencyStore, InMemoryIdempotencyStore};
use crate::observability::{get_metrics, mask_sensitive};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Longest accepted operation name, in bytes.
pub const MAX_OPERATION_LENGTH: usize = 128;

/// Times an expired record returned by the store is removed before giving up.
const STALE_RECORD_ATTEMPTS: usize = 3;

/// Counters for ledger activity.
#[derive(Debug, Default)]
pub struct IdempotencyMetrics {
    pub total_requests: AtomicU64,
    pub new_requests: AtomicU64,
    pub duplicate_requests: AtomicU64,
    pub conflicts: AtomicU64,
    pub completed_requests: AtomicU64,
    pub released_requests: AtomicU64,
}

impl IdempotencyMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_new(&self) {
        self.new_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate(&self) {
        self.duplicate_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_conflict(&self) {
        self.conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self) {
        self.completed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_released(&self) {
        self.released_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            new_requests: self.new_requests.load(Ordering::Relaxed),
            duplicate_requests: self.duplicate_requests.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            completed_requests: self.completed_requests.load(Ordering::Relaxed),
            released_requests: self.released_requests.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub new_requests: u64,
    pub duplicate_requests: u64,
    pub conflicts: u64,
    pub completed_requests: u64,
    pub released_requests: u64,
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

/// Outcome of [`IdempotencyLedger::get_or_create`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdempotencyCheckResult {
    /// First sighting; the caller owns execution and must report the response.
    New(IdempotencyRecord),
    /// A live record with the same body exists, possibly still pending.
    Duplicate(IdempotencyRecord),
}

impl IdempotencyCheckResult {
    pub fn is_existing(&self) -> bool {
        matches!(self, IdempotencyCheckResult::Duplicate(_))
    }

    pub fn record(&self) -> &IdempotencyRecord {
        match self {
            IdempotencyCheckResult::New(record) | IdempotencyCheckResult::Duplicate(record) => record,
        }
    }

    pub fn into_record(self) -> IdempotencyRecord {
        match self {
            IdempotencyCheckResult::New(record) | IdempotencyCheckResult::Duplicate(record) => record,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LedgerConfig {
    pub ttl: Duration,
    pub max_key_length: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3600), // 1 hour
            max_key_length: 255,
        }
    }
}

/// Deduplicates client retries of non-idempotent writes.
pub struct IdempotencyLedger {
    store: Arc<dyn IdempotencyStore>,
    lock: Arc<dyn KeyLock>,
    metrics: Arc<IdempotencyMetrics>,
    config: LedgerConfig,
}

impl IdempotencyLedger {
    pub fn new(store: Arc<dyn IdempotencyStore>, lock: Arc<dyn KeyLock>, config: LedgerConfig) -> Self {
        Self {
            store,
            lock,
            metrics: Arc::new(IdempotencyMetrics::new()),
            config,
        }
    }

    /// Single-instance ledger: in-memory store guarded by the in-process lock table.
    pub fn in_memory(config: LedgerConfig) -> Self {
        Self::new(
            Arc::new(InMemoryIdempotencyStore::new()),
            Arc::new(InProcessKeyLock::new()),
            config,
        )
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn metrics(&self) -> Arc<IdempotencyMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn backend_name(&self) -> &'static str {
        self.store.backend_name()
    }

    /// Atomically returns the live record for this request or creates a pending one.
    ///
    /// Fails with [`AppError::IdempotencyConflict`] when the key and operation
    /// were already used with a different body.
    pub async fn get_or_create(
        &self,
        key: &str,
        operation: &str,
        body_hash: &str,
    ) -> Result<IdempotencyCheckResult> {
        self.validate_identity(key, operation, body_hash)?;
        self.metrics.record_request();

        let _guard = self.lock.acquire(&slot_key(key, operation)).await?;
        let candidate = IdempotencyRecord::new(key, operation, body_hash, self.config.ttl);

        let existing = self.insert_live(&candidate).await.map_err(|e| {
            warn!(
                "Idempotency store '{}' failed during get_or_create for {}: {}",
                self.store.backend_name(),
                operation,
                e
            );
            e
        })?;

        match existing {
            None => {
                self.metrics.record_new();
                get_metrics().record_idempotency_outcome(operation, "new");
                debug!(
                    key = %mask_sensitive(key, 4),
                    operation,
                    "Accepted new idempotent request"
                );
                Ok(IdempotencyCheckResult::New(candidate))
            }
            Some(existing) if existing.body_hash != body_hash => {
                self.metrics.record_conflict();
                get_metrics().record_idempotency_conflict(operation);
                warn!(
                    key = %mask_sensitive(key, 4),
                    operation,
                    existing_hash = %existing.body_hash,
                    requested_hash = %body_hash,
                    "Idempotency key reused with a different request body"
                );
                Err(AppError::conflict(key, operation, existing.body_hash, body_hash))
            }
            Some(existing) => {
                self.metrics.record_duplicate();
                get_metrics().record_idempotency_outcome(operation, "duplicate");
                debug!(
                    key = %mask_sensitive(key, 4),
                    operation,
                    completed = existing.is_completed(),
                    "Duplicate idempotent request"
                );
                Ok(IdempotencyCheckResult::Duplicate(existing))
            }
        }
    }

    /// Captures the response of the original execution for replay.
    ///
    /// [`AppError::RecordNotFound`] means the record expired or vanished; the
    /// business operation already happened, so callers should log and move on.
    pub async fn update_response(
        &self,
        key: &str,
        operation: &str,
        body_hash: &str,
        response_body: &str,
        status_code: u16,
    ) -> Result<IdempotencyRecord> {
        self.validate_identity(key, operation, body_hash)?;
        let _guard = self.lock.acquire(&slot_key(key, operation)).await?;

        let record = match self.store.find(key, operation).await? {
            Some(record) if record.body_hash == body_hash && !record.is_expired() => record,
            _ => {
                warn!(
                    key = %mask_sensitive(key, 4),
                    operation,
                    "No live idempotency record to attach the response to"
                );
                return Err(AppError::not_found(key, operation));
            }
        };

        if record.is_completed() {
            warn!(
                key = %mask_sensitive(key, 4),
                operation,
                "Response already captured, keeping the original"
            );
            return Ok(record);
        }

        match self.store.store_response(&record, response_body, status_code).await? {
            Some(updated) => {
                self.metrics.record_completed();
                get_metrics().record_response_captured(operation, status_code);
                Ok(updated)
            }
            // Another instance got there first, or the record expired or was replaced.
            None => match self.store.find(key, operation).await? {
                Some(current) if current.id == record.id && current.is_completed() => {
                    warn!(
                        key = %mask_sensitive(key, 4),
                        operation,
                        "Response already captured, keeping the original"
                    );
                    Ok(current)
                }
                _ => Err(AppError::not_found(key, operation)),
            },
        }
    }

    /// Whether a live record exists for the exact request. Expired records count as absent.
    pub async fn exists(&self, key: &str, operation: &str, body_hash: &str) -> Result<bool> {
        Ok(self
            .store
            .find(key, operation)
            .await?
            .map(|r| r.body_hash == body_hash && !r.is_expired())
            .unwrap_or(false))
    }

    /// Drops a still-pending record so the client can retry after a failed operation.
    /// Completed records are kept.
    pub async fn release(&self, key: &str, operation: &str, body_hash: &str) -> Result<bool> {
        self.validate_identity(key, operation, body_hash)?;
        let _guard = self.lock.acquire(&slot_key(key, operation)).await?;

        match self.store.find(key, operation).await? {
            Some(record) if record.body_hash == body_hash && !record.is_completed() => {
                let removed = self.store.remove(&record).await?;
                if removed {
                    self.metrics.record_released();
                }
                Ok(removed)
            }
            _ => Ok(false),
        }
    }

    /// Runs `action` at most once per live request identity.
    ///
    /// Duplicates replay the captured response. A duplicate that arrives while the
    /// original is still running fails with [`AppError::RequestInProgress`]. If
    /// `action` fails, the pending record is released so a retry can run it again.
    pub async fn execute<F, Fut>(
        &self,
        key: &str,
        operation: &str,
        body_hash: &str,
        action: F,
    ) -> Result<CapturedResponse>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CapturedResponse>>,
    {
        match self.get_or_create(key, operation, body_hash).await? {
            IdempotencyCheckResult::Duplicate(record) => {
                record.captured_response().ok_or_else(|| AppError::RequestInProgress {
                    key: key.to_string(),
                    operation: operation.to_string(),
                })
            }
            IdempotencyCheckResult::New(_) => match action().await {
                Ok(response) => {
                    if let Err(e) = self
                        .update_response(key, operation, body_hash, &response.body, response.status_code)
                        .await
                    {
                        error!("Failed to capture response for {}: {}", operation, e);
                    }
                    Ok(response)
                }
                Err(e) => {
                    if let Err(release_err) = self.release(key, operation, body_hash).await {
                        error!(
                            "Failed to release idempotency record for {}: {}",
                            operation, release_err
                        );
                    }
                    Err(e)
                }
            },
        }
    }

    /// Removes expired records and idle lock entries.
    pub async fn purge_expired(&self) -> Result<u64> {
        let removed = self.store.remove_expired().await?;
        let pruned = self.lock.prune_idle();
        if removed > 0 || pruned > 0 {
            info!(removed, pruned, "Purged expired idempotency state");
        }
        get_metrics().record_expired_purged(removed);
        Ok(removed)
    }

    /// Inserts `candidate`, treating an expired occupant as absent.
    ///
    /// Backends expire on their own clock (Redis from SET time, Postgres from
    /// `NOW()`), so the store can hand back a record this process already
    /// considers expired. Such a record is removed by id and the insert retried.
    async fn insert_live(&self, candidate: &IdempotencyRecord) -> Result<Option<IdempotencyRecord>> {
        for _ in 0..STALE_RECORD_ATTEMPTS {
            match self.store.insert_if_absent(candidate).await? {
                Some(existing) if existing.is_expired() => {
                    debug!(
                        key = %mask_sensitive(&existing.key, 4),
                        operation = %existing.operation,
                        "Store returned an expired record, replacing it"
                    );
                    self.store.remove(&existing).await?;
                }
                other => return Ok(other),
            }
        }

        Err(AppError::StorageUnavailable(format!(
            "Idempotency slot '{}' kept returning expired records",
            candidate.slot()
        )))
    }

    fn validate_identity(&self, key: &str, operation: &str, body_hash: &str) -> Result<()> {
        if key.trim().is_empty() {
            return Err(AppError::Validation("Idempotency key cannot be empty".to_string()));
        }
        if key.len() > self.config.max_key_length {
            return Err(AppError::Validation(format!(
                "Idempotency key exceeds {} bytes",
                self.config.max_key_length
            )));
        }
        if key.chars().any(char::is_control) {
            return Err(AppError::Validation(
                "Idempotency key contains control characters".to_string(),
            ));
        }
        if operation.is_empty() || operation.contains(':') {
            return Err(AppError::Validation(format!(
                "Invalid operation name '{}'",
                operation
            )));
        }
        if operation.len() > MAX_OPERATION_LENGTH {
            return Err(AppError::Validation(format!(
                "Operation name exceeds {} bytes",
                MAX_OPERATION_LENGTH
            )));
        }
        if !is_valid_body_hash(body_hash) {
            return Err(AppError::Validation(format!(
                "Body hash must be {} hex characters",
                BODY_HASH_LEN
            )));
        }
        Ok(())
    }
}
