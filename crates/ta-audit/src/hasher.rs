// hasher.rs — SHA-256 hashing utilities.
//
// All digests in the governance engine are SHA-256, lowercase hex. Used for
// the audit hash chain, admin-token digests, and store file names.

use sha2::{Digest, Sha256};

/// Hash arbitrary bytes, returning a lowercase hex-encoded SHA-256 string.
pub fn hash_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Hash a UTF-8 string, returning a lowercase hex-encoded SHA-256 string.
pub fn hash_str(s: &str) -> String {
    hash_bytes(s.as_bytes())
}

/// The first `len` hex characters of the SHA-256 of `s`.
///
/// Used to derive stable, filesystem-safe names from arbitrary keys.
pub fn short_digest(s: &str, len: usize) -> String {
    let mut digest = hash_str(s);
    digest.truncate(len.min(64));
    digest
}
