//! SHA-256 helpers for payload integrity and attribute redaction.

use sha2::{Digest, Sha256};

/// Lowercase hex SHA-256 digest of `data`.
pub fn sha256_hex(data: impl AsRef<[u8]>) -> String {
    hex::encode(Sha256::digest(data.as_ref()))
}

/// Compare a digest with the hash of `data`, ignoring hex case.
pub fn matches_sha256(data: impl AsRef<[u8]>, expected_hex: &str) -> bool {
    sha256_hex(data).eq_ignore_ascii_case(expected_hex)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_matches_is_case_insensitive() {
        let upper = sha256_hex("payload").to_uppercase();
        assert!(matches_sha256("payload", &upper));
        assert!(!matches_sha256("other", &upper));
    }
}
