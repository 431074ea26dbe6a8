//! SHA-256 helpers for verifying downloaded feed artifacts

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use vulnsync_core::{Error, Result};

/// Compute SHA-256 of data as lowercase hex
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Compute SHA-256 of a file without loading it into memory
pub fn sha256_file(path: impl AsRef<Path>) -> Result<String> {
    let mut file = File::open(path.as_ref())?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Verify a file against an expected hex digest (case-insensitive)
pub fn verify_file_sha256(path: impl AsRef<Path>, expected_hex: &str) -> Result<()> {
    let path = path.as_ref();
    let actual = sha256_file(path)?;
    if !actual.eq_ignore_ascii_case(expected_hex.trim()) {
        return Err(Error::ChecksumMismatch {
            path: path.display().to_string(),
            expected: expected_hex.trim().to_ascii_lowercase(),
            actual,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_file_digest_matches_buffer_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feed.json");
        std::fs::write(&path, b"test data").unwrap();

        let expected = sha256_hex(b"test data");
        assert_eq!(sha256_file(&path).unwrap(), expected);
        assert!(verify_file_sha256(&path, &expected.to_ascii_uppercase()).is_ok());

        let err = verify_file_sha256(&path, "00").unwrap_err();
        assert_eq!(err.code(), "CHECKSUM_MISMATCH");
    }
}
