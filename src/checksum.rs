//! Content fingerprinting for change detection.
//!
//! A stored source is considered unchanged when the fingerprint of freshly
//! fetched content equals the fingerprint recorded with its chunks, which
//! lets the sync pipeline skip re-embedding entirely.

use sha2::{Digest, Sha256};

/// Compute a deterministic fingerprint of `content` (SHA-256 over UTF-8
/// bytes, lowercase hex). Equality is treated as "content unchanged".
pub fn fingerprint(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}
