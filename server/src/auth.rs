//! Token issuance and verification for realtime authentication.
//!
//! Clients obtain a short-lived signed token from `GET /auth/ws` and present
//! it in an `AUTH` frame after the websocket opens. The gateway only ever
//! calls [`TokenAuthenticator::verify`].
//!
//! Tokens are HS256 JWTs carrying `iat`/`exp` claims, an optional subject,
//! and any additional caller-supplied claims.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use chatgate_server::auth::TokenAuthenticator;
//!
//! let authenticator = TokenAuthenticator::new("secret", Duration::from_secs(60));
//! let token = authenticator.issue(None, Some("user-1")).unwrap();
//! let claims = authenticator.verify(&token).unwrap();
//! assert_eq!(claims.sub.as_deref(), Some("user-1"));
//! ```

use std::time::Duration;

use chrono::Utc;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

/// Errors that can occur while issuing or verifying tokens.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// The token's `exp` claim is in the past.
    #[error("token expired")]
    Expired,

    /// The token was signed with a different key or algorithm.
    #[error("invalid token signature")]
    InvalidSignature,

    /// The token could not be decoded at all.
    #[error("malformed token: {0}")]
    Malformed(String),

    /// Signing a new token failed.
    #[error("failed to sign token: {0}")]
    Signing(String),
}

impl AuthError {
    /// Returns `true` if the token was well-formed but is no longer valid.
    pub fn is_expired(&self) -> bool {
        matches!(self, Self::Expired)
    }
}

/// Claims carried by a realtime token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    /// Optional subject the token was issued for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,

    /// Issued-at, Unix seconds.
    pub iat: i64,

    /// Expiry, Unix seconds.
    pub exp: i64,

    /// Any additional claims supplied at issue time.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Issues and verifies signed, time-bound tokens.
#[derive(Clone)]
pub struct TokenAuthenticator {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    ttl: Duration,
}

impl TokenAuthenticator {
    /// Creates an authenticator signing with `secret`; tokens live for `ttl`.
    pub fn new(secret: impl AsRef<[u8]>, ttl: Duration) -> Self {
        let secret = secret.as_ref();
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.validate_exp = true;
        validation.required_spec_claims.clear();
        validation.required_spec_claims.insert("exp".to_string());

        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            validation,
            ttl,
        }
    }

    /// Returns the configured token lifetime.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Issues a token valid for the configured lifetime.
    ///
    /// `extra` claims are merged into the payload; the reserved `sub`, `iat`
    /// and `exp` keys are always set by the authenticator.
    pub fn issue(
        &self,
        extra: Option<Map<String, Value>>,
        subject: Option<&str>,
    ) -> Result<String, AuthError> {
        let now = Utc::now().timestamp();
        let ttl = i64::try_from(self.ttl.as_secs()).unwrap_or(i64::MAX);
        let mut extra = extra.unwrap_or_default();
        for reserved in ["sub", "iat", "exp"] {
            extra.remove(reserved);
        }

        let claims = Claims {
            sub: subject.map(str::to_string),
            iat: now,
            exp: now.saturating_add(ttl),
            extra,
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| AuthError::Signing(e.to_string()))
    }

    /// Verifies a token and returns its claims.
    ///
    /// # Errors
    ///
    /// - [`AuthError::Expired`] if the token is past its `exp`
    /// - [`AuthError::InvalidSignature`] if it was signed with another key
    /// - [`AuthError::Malformed`] for anything that does not decode
    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|err| {
                debug!(error = %err, "Token verification failed");
                match err.kind() {
                    ErrorKind::ExpiredSignature => AuthError::Expired,
                    ErrorKind::InvalidSignature | ErrorKind::InvalidAlgorithm => {
                        AuthError::InvalidSignature
                    }
                    _ => AuthError::Malformed(err.to_string()),
                }
            })
    }
}

impl std::fmt::Debug for TokenAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenAuthenticator")
            .field("secret", &"<redacted>")
            .field("ttl", &self.ttl)
            .finish()
    }
}
