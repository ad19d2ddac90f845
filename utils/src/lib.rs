//! # Loreforge Utilities
//!
//! Hashing, fingerprinting, and UUID helpers.
//!
//! Fingerprints are truncated SHA-256 digests used to build cache keys; they
//! are stable across processes and releases.

use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Hex characters kept in a fingerprint.
pub const FINGERPRINT_LEN: usize = 16;

/// Compute SHA-256 hash of content string
///
/// # Examples
///
/// ```
/// use utils::compute_content_hash;
///
/// let hash = compute_content_hash("hello world");
/// assert_eq!(hash.len(), 64);
/// ```
#[must_use]
pub fn compute_content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

/// Truncated SHA-256 of `content`.
///
/// ```
/// let fp = utils::fingerprint("a dark forest");
/// assert_eq!(fp.len(), utils::FINGERPRINT_LEN);
/// ```
#[must_use]
pub fn fingerprint(content: &str) -> String {
    let mut hash = compute_content_hash(content);
    hash.truncate(FINGERPRINT_LEN);
    hash
}

/// Fingerprint of a value's JSON encoding. Struct fields serialize in
/// declaration order, so equal values give equal fingerprints.
pub fn fingerprint_json<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let encoded = serde_json::to_string(value)?;
    Ok(fingerprint(&encoded))
}

/// Generate UUID v4 string
#[must_use]
pub fn generate_uuid() -> String {
    Uuid::new_v4().to_string()
}
