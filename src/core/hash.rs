use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 of the given bytes.
pub fn hash_bytes(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}
