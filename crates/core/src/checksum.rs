//! Checksum and cache-token helpers.

use crate::error::{Error, Result};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

/// Canonical length of a hex-encoded SHA-256 digest.
pub const SHA256_HEX_LEN: usize = 64;

/// Whether `s` is a well-formed hex SHA-256 digest.
pub fn is_sha256_hex(s: &str) -> bool {
    s.len() == SHA256_HEX_LEN && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Validate and normalize a checksum string to lowercase hex.
pub fn normalize_sha256_hex(s: &str) -> Result<String> {
    let trimmed = s.trim();
    if !is_sha256_hex(trimmed) {
        return Err(Error::InvalidChecksum(format!(
            "expected 64 hex characters, got {} characters",
            trimmed.len()
        )));
    }
    Ok(trimmed.to_ascii_lowercase())
}

/// Derive a cache token from an image URL.
///
/// Takes the basename of the URL path, strips the extension, and replaces
/// every non-alphanumeric character with an underscore, so the token is a
/// safe filename regardless of what the URL contained.
pub fn token_from_url(image_url: &str) -> String {
    let trimmed = image_url
        .split(['?', '#'])
        .next()
        .unwrap_or(image_url)
        .trim_end_matches('/');
    let basename = trimmed.rsplit('/').next().unwrap_or(trimmed);
    let stem = match basename.rsplit_once('.') {
        Some((stem, _ext)) if !stem.is_empty() => stem,
        _ => basename,
    };
    let token: String = stem
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    if token.is_empty() {
        "image".to_string()
    } else {
        token
    }
}

/// Compute the SHA-256 of a file, returned as lowercase hex.
///
/// Synchronous; callers on the async runtime should wrap this in
/// `spawn_blocking`. Reads in 1 MiB chunks so memory stays flat for
/// multi-gigabyte images.
pub fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex_encode(&hasher.finalize()))
}

/// Compute the SHA-256 of a byte slice as lowercase hex.
pub fn sha256_hex(data: &[u8]) -> String {
    hex_encode(&Sha256::digest(data))
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(
        String::with_capacity(bytes.len() * 2),
        |mut out, b| {
            let _ = write!(out, "{b:02x}");
            out
        },
    )
}
