//! Authentication token parsing.
//!
//! The engine only needs the user identity a token carries; signature
//! validation is the server's job. Tokens are JWTs whose payload segment is
//! base64url-encoded JSON with a `sub` or `user_id` claim.

use base64::Engine;
use satellite_core::{SatelliteError, SatelliteResult};
use serde::Deserialize;

/// The claims the engine reads from a token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenClaims {
    /// The user identity (`sub`, falling back to `user_id`).
    pub user_id: String,
}

#[derive(Deserialize)]
struct RawClaims {
    sub: Option<String>,
    user_id: Option<String>,
}

impl TokenClaims {
    /// Extracts the claims from an encoded JWT.
    ///
    /// Fails with `AUTH_REQUIRED` if the token is malformed or carries
    /// neither `sub` nor `user_id`.
    pub fn parse(token: &str) -> SatelliteResult<Self> {
        let mut segments = token.split('.');
        let payload = match (segments.next(), segments.next(), segments.next()) {
            (Some(_), Some(payload), Some(_)) => payload,
            _ => return Err(SatelliteError::auth_required("malformed token")),
        };

        let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| SatelliteError::auth_required("token payload is not base64url"))?;

        let raw: RawClaims = serde_json::from_slice(&bytes)
            .map_err(|_| SatelliteError::auth_required("token payload is not JSON"))?;

        let user_id = raw.sub.or(raw.user_id).ok_or_else(|| {
            SatelliteError::auth_required("token carries neither sub nor user_id")
        })?;

        Ok(Self { user_id })
    }
}
