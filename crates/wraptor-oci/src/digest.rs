//! Content digests (`sha256:<hex>`).

use sha2::{Digest, Sha256};

/// Algorithm prefix used for every digest produced by this crate.
pub const SHA256_PREFIX: &str = "sha256:";

/// Digest of a byte slice.
#[must_use]
pub fn sha256_digest(data: &[u8]) -> String {
    format_digest(&Sha256::digest(data))
}

/// Format a finished SHA-256 hash as a digest string.
#[must_use]
pub fn format_digest(hash: &[u8]) -> String {
    format!("{SHA256_PREFIX}{}", hex::encode(hash))
}

/// Hex part of a `sha256:` digest, if it is well formed.
#[must_use]
pub fn sha256_hex(digest: &str) -> Option<&str> {
    let hex = digest.strip_prefix(SHA256_PREFIX)?;
    (hex.len() == 64 && hex.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()))
        .then_some(hex)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_of_empty_input() {
        let digest = sha256_digest(b"");
        assert_eq!(
            digest,
            "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert!(sha256_hex(&digest).is_some());
    }

    #[test]
    fn rejects_malformed_digests() {
        assert!(sha256_hex("sha256:abc").is_none());
        assert!(sha256_hex("md5:d41d8cd98f00b204e9800998ecf8427e").is_none());
        assert!(sha256_hex(&format!("sha256:{}", "A".repeat(64))).is_none());
    }
}
