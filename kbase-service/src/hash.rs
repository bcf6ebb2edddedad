//! Content hashing for checksum deduplication.

use sha2::{Digest, Sha256};

/// Lowercase hex SHA-256 of an upload payload, used as the per-knowledge-base
/// dedup checksum.
pub fn compute_content_hash(content: &[u8]) -> String {
    format!("{:x}", Sha256::digest(content))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_content_hash() {
        let hash = compute_content_hash(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_empty_input() {
        assert_eq!(
            compute_content_hash(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_different_content_different_hash() {
        assert_ne!(compute_content_hash(b"a"), compute_content_hash(b"b"));
    }
}
