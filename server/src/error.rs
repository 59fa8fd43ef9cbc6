//! Error types for the Chatgate server.
//!
//! This module defines the error hierarchy used throughout the server,
//! providing type-safe error handling with meaningful error messages.
//!
//! # Error Types
//!
//! - [`ConfigError`] - Configuration-related errors (missing values, parse failures)
//! - [`ServerError`] - Top-level server errors encompassing all failure modes
//!
//! # Propagation
//!
//! | Variant | Effect |
//! |---------|--------|
//! | [`ServerError::Protocol`] | terminates only the offending connection |
//! | [`ServerError::Auth`] | terminates only the offending connection |
//! | [`ServerError::Transport`] | logged; teardown follows the socket's own close |
//! | [`ServerError::Infrastructure`] | never retried; surfaces to the process supervisor |
//! | [`ServerError::RateLimit`] | a normal 429 rejection |
//!
//! # Example
//!
//! ```rust
//! use chatgate_server::error::ServerError;
//!
//! let err = ServerError::protocol("frame is not valid JSON");
//! assert!(err.is_client_error());
//! ```

use std::error::Error;
use std::fmt;

use thiserror::Error as ThisError;

use crate::auth::AuthError;
use crate::bus::BusError;
use crate::store::StoreError;

pub use crate::config::ConfigError;

/// Top-level error type for the Chatgate server.
///
/// # Error Categories
///
/// - **Protocol violations**: malformed or schema-invalid realtime frames
/// - **Authentication faults**: expired, malformed or forged tokens
/// - **Transport faults**: socket-level errors reported by the websocket
/// - **Infrastructure faults**: counter store or message bus unreachable,
///   timed out, or returning an unexpected reply
/// - **Rate limiting**: a caller exceeded its admission policy
/// - **Configuration errors**: problems loading server config
#[derive(Debug)]
pub enum ServerError {
    /// Configuration error during server initialization.
    Config(ConfigError),

    /// A realtime frame failed JSON parsing or schema validation.
    Protocol(String),

    /// Token verification failed.
    Auth(String),

    /// Websocket transport error.
    Transport(String),

    /// The counter store or message bus failed.
    ///
    /// These are not retried internally and must never leak to clients.
    Infrastructure(String),

    /// Rate limit exceeded.
    RateLimit {
        /// Identity that was rate limited (e.g., forwarded client address).
        identity: String,
        /// Number of seconds until the window resets.
        retry_after: u64,
    },
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(err) => write!(f, "configuration error: {err}"),
            Self::Protocol(msg) => write!(f, "protocol violation: {msg}"),
            Self::Auth(msg) => write!(f, "authentication failed: {msg}"),
            Self::Transport(msg) => write!(f, "transport error: {msg}"),
            Self::Infrastructure(msg) => write!(f, "infrastructure fault: {msg}"),
            Self::RateLimit {
                identity,
                retry_after,
            } => {
                write!(
                    f,
                    "rate limit exceeded for {identity}, retry after {retry_after} seconds"
                )
            }
        }
    }
}

impl Error for ServerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Config(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ConfigError> for ServerError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err)
    }
}

impl From<AuthError> for ServerError {
    fn from(err: AuthError) -> Self {
        Self::Auth(err.to_string())
    }
}

impl From<StoreError> for ServerError {
    fn from(err: StoreError) -> Self {
        Self::Infrastructure(err.to_string())
    }
}

impl From<BusError> for ServerError {
    fn from(err: BusError) -> Self {
        Self::Infrastructure(err.to_string())
    }
}

impl From<axum::Error> for ServerError {
    fn from(err: axum::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<ProtocolError> for ServerError {
    fn from(err: ProtocolError) -> Self {
        Self::Protocol(err.to_string())
    }
}

impl ServerError {
    /// Creates a new protocol violation.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Creates a new authentication error.
    ///
    /// # Example
    ///
    /// ```rust
    /// use chatgate_server::error::ServerError;
    ///
    /// let err = ServerError::auth("token expired");
    /// assert!(matches!(err, ServerError::Auth(_)));
    /// ```
    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth(message.into())
    }

    /// Creates a new infrastructure fault.
    ///
    /// # Example
    ///
    /// ```rust
    /// use chatgate_server::error::ServerError;
    ///
    /// let err = ServerError::infrastructure("redis connection refused");
    /// assert!(err.is_server_error());
    /// ```
    pub fn infrastructure(message: impl Into<String>) -> Self {
        Self::Infrastructure(message.into())
    }

    /// Creates a new rate limit error.
    ///
    /// # Arguments
    ///
    /// * `identity` - Identifier for the rate-limited caller
    /// * `retry_after` - Seconds until the caller can retry
    pub fn rate_limit(identity: impl Into<String>, retry_after: u64) -> Self {
        Self::RateLimit {
            identity: identity.into(),
            retry_after,
        }
    }

    /// Returns `true` if this error indicates a client-side problem.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::Protocol(_) | Self::Auth(_) | Self::RateLimit { .. }
        )
    }

    /// Returns `true` if this error indicates a server-side problem.
    pub fn is_server_error(&self) -> bool {
        matches!(self, Self::Infrastructure(_) | Self::Config(_))
    }
}

/// Reasons a realtime frame is rejected before dispatch.
#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The frame is not valid JSON (or not text).
    #[error("frame is not valid JSON: {0}")]
    InvalidJson(String),

    /// The frame is JSON but does not match any known frame shape.
    #[error("frame failed schema validation: {0}")]
    InvalidSchema(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_error_protocol_displays_correctly() {
        let err = ServerError::protocol("unknown frame type");
        assert_eq!(err.to_string(), "protocol violation: unknown frame type");
    }

    #[test]
    fn server_error_auth_displays_correctly() {
        let err = ServerError::auth("invalid token");
        assert_eq!(err.to_string(), "authentication failed: invalid token");
    }

    #[test]
    fn websocket_error_becomes_transport_fault() {
        let err: ServerError = axum::Error::new("connection reset by peer").into();
        assert_eq!(err.to_string(), "transport error: connection reset by peer");
        assert!(!err.is_client_error());
        assert!(!err.is_server_error());
    }

    #[test]
    fn server_error_infrastructure_displays_correctly() {
        let err = ServerError::infrastructure("redis unreachable");
        assert_eq!(err.to_string(), "infrastructure fault: redis unreachable");
    }

    #[test]
    fn server_error_rate_limit_displays_correctly() {
        let err = ServerError::rate_limit("192.168.1.100", 30);
        assert_eq!(
            err.to_string(),
            "rate limit exceeded for 192.168.1.100, retry after 30 seconds"
        );
    }

    #[test]
    fn server_error_config_displays_correctly() {
        let err = ServerError::Config(ConfigError::MissingEnvVar("CHATGATE_JWT_SECRET".into()));
        assert_eq!(
            err.to_string(),
            "configuration error: missing required environment variable: CHATGATE_JWT_SECRET"
        );
    }

    #[test]
    fn store_error_becomes_infrastructure_fault() {
        let err: ServerError = StoreError::UnexpectedReply("nil".into()).into();
        assert!(matches!(err, ServerError::Infrastructure(_)));
        assert!(err.is_server_error());
    }

    #[test]
    fn bus_error_becomes_infrastructure_fault() {
        let err: ServerError = BusError::Timeout.into();
        assert!(matches!(err, ServerError::Infrastructure(_)));
    }

    #[test]
    fn auth_error_becomes_auth_fault() {
        let err: ServerError = AuthError::Expired.into();
        assert!(matches!(err, ServerError::Auth(_)));
        assert!(err.is_client_error());
    }

    #[test]
    fn protocol_error_becomes_protocol_violation() {
        let err: ServerError = ProtocolError::InvalidSchema("missing field `data`".into()).into();
        assert!(matches!(err, ServerError::Protocol(_)));
        assert!(err.is_client_error());
    }

    #[test]
    fn is_client_error_classifies_variants() {
        assert!(ServerError::protocol("bad").is_client_error());
        assert!(ServerError::auth("bad").is_client_error());
        assert!(ServerError::rate_limit("client", 30).is_client_error());
        assert!(!ServerError::infrastructure("down").is_client_error());
    }

    #[test]
    fn server_error_source_returns_config_error() {
        let config_err = ConfigError::MissingEnvVar("KEY".into());
        let server_err = ServerError::Config(config_err);
        assert!(server_err.source().is_some());
        assert!(ServerError::auth("test").source().is_none());
    }
}
