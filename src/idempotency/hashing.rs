use crate::error::{AppError, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Length of an encoded body hash (hex SHA-256).
pub const BODY_HASH_LEN: usize = 64;

/// Digests raw request body bytes into a fixed-length lowercase hex string.
pub fn hash_body(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    hex::encode(hasher.finalize())
}

/// Hashes the canonical JSON form of a request.
///
/// The value goes through `serde_json::Value`, whose object map is ordered,
/// so field order in the source type does not change the digest.
pub fn hash_request<T: Serialize>(request: &T) -> Result<String> {
    let value = serde_json::to_value(request)
        .map_err(|e| AppError::Validation(format!("Request body is not serializable: {}", e)))?;
    let canonical = serde_json::to_string(&value)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to encode canonical body: {}", e)))?;
    Ok(hash_body(canonical.as_bytes()))
}

pub fn is_valid_body_hash(hash: &str) -> bool {
    hash.len() == BODY_HASH_LEN && hash.bytes().all(|b| b.is_ascii_hexdigit())
}
