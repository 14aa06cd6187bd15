use crate::error::{AppError, Result};
use crate::idempotency::record::{slot_key, IdempotencyRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use redis::AsyncCommands;
use sqlx::PgPool;
use uuid::Uuid;

/// Attempts made when a conflicting record vanishes between insert and read-back.
const READ_BACK_ATTEMPTS: usize = 3;

/// Key-value storage with expiry for idempotency records.
///
/// Records are addressed by `(key, operation)`; the body hash lives inside
/// the record so a second body under the same key is visible as a conflict.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Inserts `record` unless a live record already occupies its slot.
    ///
    /// Returns `Ok(None)` when the record was written and `Ok(Some(existing))`
    /// when a non-expired record was already present. An expired occupant is
    /// replaced. Must be atomic with respect to concurrent callers.
    async fn insert_if_absent(&self, record: &IdempotencyRecord) -> Result<Option<IdempotencyRecord>>;

    /// Finds the record stored for `(key, operation)`, expired or not.
    async fn find(&self, key: &str, operation: &str) -> Result<Option<IdempotencyRecord>>;

    /// Attaches a response to `record` if the slot still holds that exact
    /// record (same `id`), unexpired and without a response.
    ///
    /// Returns `Ok(None)` otherwise. Check and write must be atomic.
    async fn store_response(
        &self,
        record: &IdempotencyRecord,
        response_body: &str,
        status_code: u16,
    ) -> Result<Option<IdempotencyRecord>>;

    /// Deletes `record` if the slot still holds it (same `id`).
    /// A successor written into the slot is left alone. Must be atomic.
    async fn remove(&self, record: &IdempotencyRecord) -> Result<bool>;

    /// Deletes expired records, returning how many were removed.
    async fn remove_expired(&self) -> Result<u64>;

    fn backend_name(&self) -> &'static str;
}

/// In-process store for single-instance deployments and tests.
#[derive(Debug, Default)]
pub struct InMemoryIdempotencyStore {
    records: DashMap<String, IdempotencyRecord>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn insert_if_absent(&self, record: &IdempotencyRecord) -> Result<Option<IdempotencyRecord>> {
        // The entry guard holds the shard lock, so check and insert are one step.
        match self.records.entry(record.slot()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired() {
                    occupied.insert(record.clone());
                    Ok(None)
                } else {
                    Ok(Some(occupied.get().clone()))
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(record.clone());
                Ok(None)
            }
        }
    }

    async fn find(&self, key: &str, operation: &str) -> Result<Option<IdempotencyRecord>> {
        Ok(self
            .records
            .get(&slot_key(key, operation))
            .map(|r| r.value().clone()))
    }

    async fn store_response(
        &self,
        record: &IdempotencyRecord,
        response_body: &str,
        status_code: u16,
    ) -> Result<Option<IdempotencyRecord>> {
        let Some(mut stored) = self.records.get_mut(&record.slot()) else {
            return Ok(None);
        };

        if stored.id != record.id || stored.is_expired() || stored.is_completed() {
            return Ok(None);
        }

        stored.response_body = Some(response_body.to_string());
        stored.response_status_code = Some(status_code);
        Ok(Some(stored.clone()))
    }

    async fn remove(&self, record: &IdempotencyRecord) -> Result<bool> {
        Ok(self
            .records
            .remove_if(&record.slot(), |_, stored| stored.id == record.id)
            .is_some())
    }

    async fn remove_expired(&self) -> Result<u64> {
        let before = self.records.len();
        self.records.retain(|_, record| !record.is_expired());
        Ok(before.saturating_sub(self.records.len()) as u64)
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

/// Writes the response only while the slot still holds the pending record
/// with id `ARGV[1]`. KEEPTTL keeps the original expiry.
const STORE_RESPONSE_SCRIPT: &str = r#"
local raw = redis.call('GET', KEYS[1])
if not raw then return 0 end
local current = cjson.decode(raw)
if current['id'] ~= ARGV[1] then return 0 end
local status = current['response_status_code']
if status ~= nil and status ~= cjson.null then return 0 end
redis.call('SET', KEYS[1], ARGV[2], 'XX', 'KEEPTTL')
return 1
"#;

/// Deletes the slot only while it still holds the record with id `ARGV[1]`.
const REMOVE_SCRIPT: &str = r#"
local raw = redis.call('GET', KEYS[1])
if not raw then return 0 end
local current = cjson.decode(raw)
if current['id'] ~= ARGV[1] then return 0 end
return redis.call('DEL', KEYS[1])
"#;

/// Redis-backed store shared across gateway instances.
///
/// Records are JSON values written with `SET NX PX`, so Redis enforces both
/// the conditional insert and the expiry. Updates and deletes run as Lua
/// scripts that compare the record id, so a successor record written by
/// another instance is never overwritten or deleted.
pub struct RedisIdempotencyStore {
    client: redis::Client,
    key_prefix: String,
}

impl RedisIdempotencyStore {
    pub fn new(client: redis::Client, key_prefix: impl Into<String>) -> Self {
        Self {
            client,
            key_prefix: key_prefix.into(),
        }
    }

    fn make_key(&self, key: &str, operation: &str) -> String {
        format!("{}:{}", self.key_prefix, slot_key(key, operation))
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(AppError::Redis)
    }

    fn decode(raw: &str) -> Result<IdempotencyRecord> {
        serde_json::from_str(raw).map_err(|e| {
            AppError::Internal(anyhow::anyhow!("Failed to deserialize idempotency record: {}", e))
        })
    }

    fn encode(record: &IdempotencyRecord) -> Result<String> {
        serde_json::to_string(record).map_err(|e| {
            AppError::Internal(anyhow::anyhow!("Failed to serialize idempotency record: {}", e))
        })
    }
}

#[async_trait]
impl IdempotencyStore for RedisIdempotencyStore {
    async fn insert_if_absent(&self, record: &IdempotencyRecord) -> Result<Option<IdempotencyRecord>> {
        let mut conn = self.connection().await?;
        let key = self.make_key(&record.key, &record.operation);
        let payload = Self::encode(record)?;
        let ttl_ms = usize::try_from(record.ttl_ms.max(1)).unwrap_or(usize::MAX);

        for _ in 0..READ_BACK_ATTEMPTS {
            let set: Option<String> = conn
                .set_options(
                    &key,
                    &payload,
                    redis::SetOptions::default()
                        .conditional_set(redis::ExistenceCheck::NX)
                        .with_expiration(redis::SetExpiry::PX(ttl_ms)),
                )
                .await
                .map_err(AppError::Redis)?;

            if set.is_some() {
                return Ok(None);
            }

            let existing: Option<String> = conn.get(&key).await.map_err(AppError::Redis)?;
            if let Some(raw) = existing {
                return Ok(Some(Self::decode(&raw)?));
            }
            // Expired between SET and GET; try the insert again.
        }

        Err(AppError::StorageUnavailable(format!(
            "Idempotency slot '{}' kept changing during insert",
            key
        )))
    }

    async fn find(&self, key: &str, operation: &str) -> Result<Option<IdempotencyRecord>> {
        let mut conn = self.connection().await?;
        let raw: Option<String> = conn
            .get(self.make_key(key, operation))
            .await
            .map_err(AppError::Redis)?;

        raw.as_deref().map(Self::decode).transpose()
    }

    async fn store_response(
        &self,
        record: &IdempotencyRecord,
        response_body: &str,
        status_code: u16,
    ) -> Result<Option<IdempotencyRecord>> {
        if record.is_expired() {
            return Ok(None);
        }

        let updated = record.clone().with_response(response_body, status_code);
        let mut conn = self.connection().await?;
        let written: i64 = redis::Script::new(STORE_RESPONSE_SCRIPT)
            .key(self.make_key(&record.key, &record.operation))
            .arg(record.id.to_string())
            .arg(Self::encode(&updated)?)
            .invoke_async(&mut conn)
            .await
            .map_err(AppError::Redis)?;

        Ok((written == 1).then_some(updated))
    }

    async fn remove(&self, record: &IdempotencyRecord) -> Result<bool> {
        let mut conn = self.connection().await?;
        let deleted: i64 = redis::Script::new(REMOVE_SCRIPT)
            .key(self.make_key(&record.key, &record.operation))
            .arg(record.id.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(AppError::Redis)?;

        Ok(deleted == 1)
    }

    async fn remove_expired(&self) -> Result<u64> {
        // Redis evicts on its own via PX.
        Ok(0)
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}

/// Row shape of the `idempotency_records` table.
#[derive(Debug, sqlx::FromRow)]
struct IdempotencyRow {
    id: Uuid,
    idempotency_key: String,
    operation: String,
    body_hash: String,
    response_body: Option<String>,
    response_status_code: Option<i32>,
    ttl_ms: i64,
    created_at: DateTime<Utc>,
}

impl From<IdempotencyRow> for IdempotencyRecord {
    fn from(row: IdempotencyRow) -> Self {
        Self {
            id: row.id,
            key: row.idempotency_key,
            operation: row.operation,
            body_hash: row.body_hash,
            created_at: row.created_at,
            ttl_ms: row.ttl_ms,
            response_body: row.response_body,
            response_status_code: row.response_status_code.and_then(|c| u16::try_from(c).ok()),
        }
    }
}

const RECORD_COLUMNS: &str =
    "id, idempotency_key, operation, body_hash, response_body, response_status_code, ttl_ms, created_at";

/// PostgreSQL-backed store shared across gateway instances.
pub struct PostgresIdempotencyStore {
    pool: PgPool,
}

impl PostgresIdempotencyStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Applies the bundled schema migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::StorageUnavailable(format!("Migration failed: {}", e)))
    }

    async fn find_slot(&self, slot: &str) -> Result<Option<IdempotencyRecord>> {
        let row = sqlx::query_as::<_, IdempotencyRow>(&format!(
            "SELECT {} FROM idempotency_records WHERE slot = $1",
            RECORD_COLUMNS
        ))
        .bind(slot)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row.map(IdempotencyRecord::from))
    }

    /// Counts records that still hold no response.
    pub async fn count_pending(&self) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM idempotency_records
            WHERE response_status_code IS NULL AND expires_at >= NOW()
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row.0)
    }
}

#[async_trait]
impl IdempotencyStore for PostgresIdempotencyStore {
    async fn insert_if_absent(&self, record: &IdempotencyRecord) -> Result<Option<IdempotencyRecord>> {
        let slot = record.slot();

        for _ in 0..READ_BACK_ATTEMPTS {
            // The conditional upsert only overwrites an expired occupant; a live
            // one makes RETURNING yield nothing.
            let inserted: Option<(Uuid,)> = sqlx::query_as(
                r#"
                INSERT INTO idempotency_records
                    (id, slot, idempotency_key, operation, body_hash, response_body, response_status_code, ttl_ms, created_at, expires_at)
                VALUES ($1, $2, $3, $4, $5, NULL, NULL, $6, $7, $8)
                ON CONFLICT (slot) DO UPDATE SET
                    id = EXCLUDED.id,
                    idempotency_key = EXCLUDED.idempotency_key,
                    operation = EXCLUDED.operation,
                    body_hash = EXCLUDED.body_hash,
                    response_body = NULL,
                    response_status_code = NULL,
                    ttl_ms = EXCLUDED.ttl_ms,
                    created_at = EXCLUDED.created_at,
                    expires_at = EXCLUDED.expires_at
                WHERE idempotency_records.expires_at < NOW()
                RETURNING id
                "#,
            )
            .bind(record.id)
            .bind(&slot)
            .bind(&record.key)
            .bind(&record.operation)
            .bind(&record.body_hash)
            .bind(record.ttl_ms)
            .bind(record.created_at)
            .bind(record.expires_at())
            .fetch_optional(&self.pool)
            .await
            .map_err(AppError::Database)?;

            if inserted.is_some() {
                return Ok(None);
            }

            if let Some(existing) = self.find_slot(&slot).await? {
                return Ok(Some(existing));
            }
        }

        Err(AppError::StorageUnavailable(format!(
            "Idempotency slot '{}' kept changing during insert",
            slot
        )))
    }

    async fn find(&self, key: &str, operation: &str) -> Result<Option<IdempotencyRecord>> {
        self.find_slot(&slot_key(key, operation)).await
    }

    async fn store_response(
        &self,
        record: &IdempotencyRecord,
        response_body: &str,
        status_code: u16,
    ) -> Result<Option<IdempotencyRecord>> {
        let row = sqlx::query_as::<_, IdempotencyRow>(&format!(
            r#"
            UPDATE idempotency_records
            SET response_body = $3, response_status_code = $4
            WHERE slot = $1 AND id = $2
              AND response_status_code IS NULL
              AND expires_at >= NOW()
            RETURNING {}
            "#,
            RECORD_COLUMNS
        ))
        .bind(record.slot())
        .bind(record.id)
        .bind(response_body)
        .bind(i32::from(status_code))
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row.map(IdempotencyRecord::from))
    }

    async fn remove(&self, record: &IdempotencyRecord) -> Result<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM idempotency_records
            WHERE slot = $1 AND id = $2
            "#,
        )
        .bind(record.slot())
        .bind(record.id)
        .execute(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(result.rows_affected() > 0)
    }

    async fn remove_expired(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM idempotency_records
            WHERE expires_at < NOW()
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(result.rows_affected())
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}
