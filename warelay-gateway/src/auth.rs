use sha2::{Digest, Sha256};

/// Verify a presented tenant secret against the stored one.
///
/// Both sides are SHA-256 hashed and the digests compared in constant time,
/// so the comparison leaks neither length nor prefix of the stored secret.
pub fn verify_secret(stored: &str, presented: &str) -> bool {
    let stored_hash = hash_secret(stored);
    let presented_hash = hash_secret(presented);
    constant_time_eq(&stored_hash, &presented_hash)
}

/// Compute the SHA-256 digest of a secret string.
fn hash_secret(secret: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.finalize().into()
}

/// Constant-time comparison of two byte slices.
///
/// Returns true only if both slices have the same length and identical
/// contents. Iterates over all bytes regardless of mismatches to prevent
/// timing side-channels.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
