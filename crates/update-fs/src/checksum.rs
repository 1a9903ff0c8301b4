//! SHA-256 checksum utilities
//!
//! Sites may publish a digest per archive; downloads are verified against it
//! before they are staged. All digests use the canonical `sha256:<hex>` form.

use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

use crate::{Error, Result};

/// Prefix for all checksums produced by this module
pub const PREFIX: &str = "sha256:";

/// Compute the SHA-256 checksum of in-memory bytes.
pub fn compute_bytes_checksum(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("{}{:x}", PREFIX, hasher.finalize())
}

/// Compute the SHA-256 checksum of a file's contents, streaming it.
pub fn compute_file_checksum(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path).map_err(|e| Error::io(path, e))?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    loop {
        let read = file.read(&mut buffer).map_err(|e| Error::io(path, e))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(format!("{}{:x}", PREFIX, hasher.finalize()))
}

/// Check a file against an expected digest.
///
/// The comparison ignores ASCII case of the hex part; an expected value
/// without the `sha256:` prefix is accepted as bare hex.
pub fn verify_file_checksum(path: &Path, expected: &str) -> Result<bool> {
    let actual = compute_file_checksum(path)?;
    let expected = expected.strip_prefix(PREFIX).unwrap_or(expected);
    let actual = actual.strip_prefix(PREFIX).unwrap_or(&actual);
    Ok(actual.eq_ignore_ascii_case(expected.trim()))
}
