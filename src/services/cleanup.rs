//! Idempotency helpers for client cleanup requests.

use sha2::{Digest, Sha256};
use std::collections::HashSet;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CleanupError {
    #[error("cleanup request contains no object keys")]
    Empty,
}

/// Trim, drop empties and dedupe, keeping first-seen order.
pub fn normalize_object_keys<S: AsRef<str>>(keys: &[S]) -> Vec<String> {
    let mut seen = HashSet::new();
    keys.iter()
        .map(|k| k.as_ref().trim())
        .filter(|k| !k.is_empty())
        .filter(|k| seen.insert(k.to_string()))
        .map(str::to_string)
        .collect()
}

/// Order- and duplicate-insensitive signature of a key set, used as the
/// idempotency key for repeated submissions.
pub fn cleanup_request_signature<S: AsRef<str>>(keys: &[S]) -> Result<String, CleanupError> {
    let mut keys = normalize_object_keys(keys);
    if keys.is_empty() {
        return Err(CleanupError::Empty);
    }
    keys.sort_unstable();

    let mut hasher = Sha256::new();
    hasher.update(keys.join("\n").as_bytes());
    Ok(hex::encode(hasher.finalize()))
}
