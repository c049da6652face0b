//! Bearer-token gate for the REST surface.
//!
//! Token issuance and signature validation are someone else's job — the hub
//! consumes a [`TokenVerifier`] and trusts the principal it returns. The
//! shipped implementation checks against the token set from config; a JWT
//! verifier can be slotted in behind the same trait without touching the
//! handlers.

use axum::http::{header, HeaderMap};
use std::collections::HashSet;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// An authenticated caller. Opaque to the core; handlers only see that a
/// principal exists.
#[derive(Debug, Clone)]
pub struct Principal {
    pub subject: String,
}

#[derive(Debug, Error, PartialEq)]
pub enum AuthError {
    #[error("missing bearer token")]
    Missing,
    #[error("invalid or expired token")]
    Invalid,
}

pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<Principal, AuthError>;
}

// ---------------------------------------------------------------------------
// Header parsing
// ---------------------------------------------------------------------------

/// Pull the token out of an `Authorization: Bearer <token>` header.
pub fn bearer_token(headers: &HeaderMap) -> Result<&str, AuthError> {
    let value = headers
        .get(header::AUTHORIZATION)
        .ok_or(AuthError::Missing)?
        .to_str()
        .map_err(|_| AuthError::Missing)?;

    let (scheme, token) = value.split_once(' ').ok_or(AuthError::Missing)?;
    if !scheme.eq_ignore_ascii_case("bearer") || token.trim().is_empty() {
        return Err(AuthError::Missing);
    }
    Ok(token.trim())
}

// ---------------------------------------------------------------------------
// Config-backed verifier
// ---------------------------------------------------------------------------

pub struct StaticTokenSet {
    tokens: HashSet<String>,
}

impl StaticTokenSet {
    pub fn new(tokens: impl IntoIterator<Item = String>) -> Self {
        Self {
            tokens: tokens.into_iter().collect(),
        }
    }
}

impl TokenVerifier for StaticTokenSet {
    fn verify(&self, token: &str) -> Result<Principal, AuthError> {
        if self.tokens.contains(token) {
            Ok(Principal {
                subject: "api-client".to_string(),
            })
        } else {
            Err(AuthError::Invalid)
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(value: Option<&str>) -> HeaderMap {
        let mut h = HeaderMap::new();
        if let Some(v) = value {
            h.insert(header::AUTHORIZATION, HeaderValue::from_str(v).unwrap());
        }
        h
    }

    // -- bearer_token -------------------------------------------------------

    #[test]
    fn extracts_token() {
        let h = headers(Some("Bearer abc123"));
        assert_eq!(bearer_token(&h), Ok("abc123"));
    }

    #[test]
    fn scheme_is_case_insensitive() {
        let h = headers(Some("bearer abc123"));
        assert_eq!(bearer_token(&h), Ok("abc123"));
    }

    #[test]
    fn missing_header_rejected() {
        assert_eq!(bearer_token(&headers(None)), Err(AuthError::Missing));
    }

    #[test]
    fn wrong_scheme_rejected() {
        let h = headers(Some("Basic dXNlcjpwYXNz"));
        assert_eq!(bearer_token(&h), Err(AuthError::Missing));
    }

    #[test]
    fn bare_scheme_rejected() {
        let h = headers(Some("Bearer "));
        assert_eq!(bearer_token(&h), Err(AuthError::Missing));
    }

    // -- StaticTokenSet -----------------------------------------------------

    #[test]
    fn known_token_verifies() {
        let v = StaticTokenSet::new(["dev-token".to_string()]);
        assert!(v.verify("dev-token").is_ok());
    }

    #[test]
    fn unknown_token_invalid() {
        let v = StaticTokenSet::new(["dev-token".to_string()]);
        assert_eq!(v.verify("other").unwrap_err(), AuthError::Invalid);
    }
}
