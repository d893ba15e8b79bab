//! Bearer-token authentication middleware.
//!
//! Token material lives in a file with one token per line; the validator
//! keeps only SHA-256 digests in memory and compares digests on lookup.
//! When no token file is configured the API is open, which is logged
//! loudly once at startup. Mutual-TLS client verification is handled by
//! the fronting listener, not here.

use crate::error::ApiError;
use crate::state::AppState;
use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::Path;

/// Validates bearer tokens against a configured token set.
pub struct TokenValidator {
    token_hashes: HashSet<[u8; 32]>,
}

impl TokenValidator {
    /// Load tokens from `path`. Blank lines and `#` comments are skipped.
    pub fn from_file(path: &Path) -> std::io::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let token_hashes: HashSet<[u8; 32]> = contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(|token| Sha256::digest(token.as_bytes()).into())
            .collect();

        tracing::info!(path = %path.display(), tokens = token_hashes.len(), "Loaded API tokens");
        Ok(Self { token_hashes })
    }

    /// Whether the presented token is in the configured set.
    pub fn validate(&self, token: &str) -> bool {
        let digest: [u8; 32] = Sha256::digest(token.as_bytes()).into();
        self.token_hashes.contains(&digest)
    }

    pub fn is_empty(&self) -> bool {
        self.token_hashes.is_empty()
    }
}

/// Extract a bearer token from the Authorization header.
/// Per RFC 6750, the "Bearer" scheme is case-insensitive.
fn extract_bearer_token(request: &Request) -> Option<&str> {
    request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| {
            if value.len() >= 7 && value[..7].eq_ignore_ascii_case("bearer ") {
                Some(value[7..].trim())
            } else {
                None
            }
        })
}

/// Require a valid bearer token on API routes when tokens are configured.
pub async fn auth_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(validator) = &state.tokens else {
        return Ok(next.run(request).await);
    };

    let token = extract_bearer_token(&request)
        .ok_or_else(|| ApiError::Unauthorized("missing bearer token".to_string()))?;

    if !validator.validate(token) {
        return Err(ApiError::Unauthorized("invalid token".to_string()));
    }

    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_tokens_and_skips_comments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens");
        std::fs::write(&path, "# operators\nalpha-token\n\n  beta-token  \n").unwrap();

        let validator = TokenValidator::from_file(&path).unwrap();
        assert!(validator.validate("alpha-token"));
        assert!(validator.validate("beta-token"));
        assert!(!validator.validate("gamma-token"));
        assert!(!validator.is_empty());
    }

    #[test]
    fn empty_file_yields_empty_set() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens");
        std::fs::write(&path, "# nothing here\n").unwrap();
        let validator = TokenValidator::from_file(&path).unwrap();
        assert!(validator.is_empty());
        assert!(!validator.validate(""));
    }
}
