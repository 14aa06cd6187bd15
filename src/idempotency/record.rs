use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of an idempotency record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdempotencyStatus {
    /// Accepted, the business operation has not reported back yet.
    Pending,
    /// The original response has been captured for replay.
    Completed,
}

/// Response captured from the original execution of a write request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedResponse {
    pub body: String,
    pub status_code: u16,
}

/// Stored idempotency record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub id: Uuid,
    pub key: String,
    pub operation: String,
    pub body_hash: String,
    pub created_at: DateTime<Utc>,
    pub ttl_ms: i64,
    pub response_body: Option<String>,
    pub response_status_code: Option<u16>,
}

impl IdempotencyRecord {
    pub fn new(
        key: impl Into<String>,
        operation: impl Into<String>,
        body_hash: impl Into<String>,
        ttl: std::time::Duration,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            key: key.into(),
            operation: operation.into(),
            body_hash: body_hash.into(),
            created_at: Utc::now(),
            ttl_ms: i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX),
            response_body: None,
            response_status_code: None,
        }
    }

    /// The `(key, operation, body_hash)` identity of the request instance.
    pub fn composite_identity(&self) -> String {
        composite_identity(&self.key, &self.operation, &self.body_hash)
    }

    /// Storage slot shared by every body sent under the same key and operation.
    pub fn slot(&self) -> String {
        slot_key(&self.key, &self.operation)
    }

    pub fn ttl(&self) -> Duration {
        Duration::try_milliseconds(self.ttl_ms).unwrap_or(Duration::MAX)
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.created_at
            .checked_add_signed(self.ttl())
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at()
    }

    /// Remaining lifetime, zero once expired.
    pub fn remaining_ttl(&self) -> std::time::Duration {
        (self.expires_at() - Utc::now())
            .to_std()
            .unwrap_or(std::time::Duration::ZERO)
    }

    pub fn status(&self) -> IdempotencyStatus {
        if self.response_status_code.is_some() {
            IdempotencyStatus::Completed
        } else {
            IdempotencyStatus::Pending
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status() == IdempotencyStatus::Completed
    }

    pub fn captured_response(&self) -> Option<CapturedResponse> {
        match (&self.response_body, self.response_status_code) {
            (Some(body), Some(status_code)) => Some(CapturedResponse {
                body: body.clone(),
                status_code,
            }),
            _ => None,
        }
    }

    pub fn with_response(mut self, body: impl Into<String>, status_code: u16) -> Self {
        self.response_body = Some(body.into());
        self.response_status_code = Some(status_code);
        self
    }

    pub fn matches(&self, key: &str, operation: &str, body_hash: &str) -> bool {
        self.key == key && self.operation == operation && self.body_hash == body_hash
    }
}

pub fn composite_identity(key: &str, operation: &str, body_hash: &str) -> String {
    format!("{}:{}:{}", key, operation, body_hash)
}

/// Operation names never contain ':' (the ledger rejects them), so slots cannot collide.
pub fn slot_key(key: &str, operation: &str) -> String {
    format!("{}:{}", operation, key)
}
