//! Server configuration module.
//!
//! Parses configuration from environment variables for the Chatgate server.
//!
//! # Environment Variables
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `PORT` | No | 4444 | HTTP server port |
//! | `CHATGATE_JWT_SECRET` | Yes* | - | HS256 secret used to sign realtime tokens |
//! | `CHATGATE_REDIS_HOST` | Yes* | - | Redis host backing the counter store and bus |
//! | `CHATGATE_REDIS_PORT` | No | 6379 | Redis port |
//! | `CHATGATE_REDIS_PASSWORD` | No | - | Redis password |
//! | `CHATGATE_TOKEN_TTL_SECS` | No | 3600 | Lifetime of issued tokens |
//! | `CHATGATE_HEARTBEAT_SECS` | No | 300 | Heartbeat probe interval |
//! | `CHATGATE_OPERATION_TIMEOUT_MS` | No | 5000 | Bound on bus publish and store calls |
//! | `CHATGATE_BUS_CHANNEL` | No | realtime | Shared pub/sub channel name |
//! | `CHATGATE_REQUIRE_AUTH` | No | true | MESSAGE frames require a prior AUTH |
//! | `CHATGATE_LOCAL_MODE` | No | false | In-process store and bus (dev only) |
//!
//! *Not required if `CHATGATE_LOCAL_MODE=true`

use std::env;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::Rng;
use thiserror::Error;
use tracing::warn;

/// Default HTTP server port.
const DEFAULT_PORT: u16 = 4444;

/// Default Redis port.
const DEFAULT_REDIS_PORT: u16 = 6379;

/// Default token lifetime (1 hour).
const DEFAULT_TOKEN_TTL_SECS: u64 = 3600;

/// Default heartbeat interval (5 minutes).
const DEFAULT_HEARTBEAT_SECS: u64 = 300;

/// Default bound on a single bus or store round-trip.
const DEFAULT_OPERATION_TIMEOUT_MS: u64 = 5000;

/// Default shared pub/sub channel.
const DEFAULT_BUS_CHANNEL: &str = "realtime";

/// Errors that can occur when parsing configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    /// Environment variable has invalid format.
    #[error("invalid format for {var}: {message}")]
    InvalidFormat { var: String, message: String },

    /// Port number is invalid.
    #[error("invalid port number: {0}")]
    InvalidPort(#[from] std::num::ParseIntError),

    /// Configuration validation failed.
    #[error("configuration validation failed: {0}")]
    ValidationError(String),
}

/// Connection parameters for the shared Redis instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
}

impl RedisConfig {
    /// Builds a `redis://` connection URL.
    pub fn url(&self) -> String {
        match &self.password {
            Some(password) => format!("redis://:{}@{}:{}/", password, self.host, self.port),
            None => format!("redis://{}:{}/", self.host, self.port),
        }
    }
}

/// Server configuration parsed from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP server port.
    pub port: u16,

    /// Secret used to sign and verify realtime tokens.
    pub jwt_secret: String,

    /// Redis connection parameters. `None` only in local mode.
    pub redis: Option<RedisConfig>,

    /// Lifetime of tokens issued by `GET /auth/ws`.
    pub token_ttl: Duration,

    /// Interval between heartbeat probes.
    pub heartbeat_interval: Duration,

    /// Upper bound on a single bus publish or store round-trip.
    pub operation_timeout: Duration,

    /// Name of the shared pub/sub channel.
    pub bus_channel: String,

    /// When true, MESSAGE frames are only published after a successful AUTH.
    pub require_auth: bool,

    /// When true, the counter store and bus run in-process (development only).
    pub local_mode: bool,
}

impl Config {
    /// Parse configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - Required environment variables are missing (when `CHATGATE_LOCAL_MODE` is not true)
    /// - Environment variables have invalid format
    /// - Port number is not a valid u16
    ///
    /// # Example
    ///
    /// ```no_run
    /// use chatgate_server::config::Config;
    ///
    /// let config = Config::from_env().expect("Failed to load config");
    /// println!("Server will listen on port {}", config.port);
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        let local_mode = parse_bool_env("CHATGATE_LOCAL_MODE", false);
        let port = parse_port("PORT", DEFAULT_PORT)?;
        let redis = parse_redis()?;
        let token_ttl = Duration::from_secs(parse_u64_env(
            "CHATGATE_TOKEN_TTL_SECS",
            DEFAULT_TOKEN_TTL_SECS,
        )?);
        let heartbeat_interval = Duration::from_secs(parse_u64_env(
            "CHATGATE_HEARTBEAT_SECS",
            DEFAULT_HEARTBEAT_SECS,
        )?);
        let operation_timeout = Duration::from_millis(parse_u64_env(
            "CHATGATE_OPERATION_TIMEOUT_MS",
            DEFAULT_OPERATION_TIMEOUT_MS,
        )?);
        let bus_channel = env::var("CHATGATE_BUS_CHANNEL")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BUS_CHANNEL.to_string());
        let require_auth = parse_bool_env("CHATGATE_REQUIRE_AUTH", true);

        let jwt_secret = match env::var("CHATGATE_JWT_SECRET") {
            Ok(secret) if !secret.is_empty() => secret,
            _ if local_mode => generate_dev_secret(),
            _ => {
                return Err(ConfigError::MissingEnvVar(
                    "CHATGATE_JWT_SECRET".to_string(),
                ))
            }
        };

        let config = Self {
            port,
            jwt_secret,
            redis,
            token_ttl,
            heartbeat_interval,
            operation_timeout,
            bus_channel,
            require_auth,
            local_mode,
        };

        config.validate()?;

        if config.local_mode {
            warn!(
                "CHATGATE_LOCAL_MODE is enabled - rate limits and fan-out are process-local. \
                 Do not use in production!"
            );
        }

        Ok(config)
    }

    /// Validate the configuration.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::ValidationError(
                "CHATGATE_HEARTBEAT_SECS must be greater than zero".to_string(),
            ));
        }

        if self.operation_timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "CHATGATE_OPERATION_TIMEOUT_MS must be greater than zero".to_string(),
            ));
        }

        if !self.local_mode && self.redis.is_none() {
            return Err(ConfigError::MissingEnvVar(
                "CHATGATE_REDIS_HOST".to_string(),
            ));
        }

        Ok(())
    }
}

/// Parse a boolean environment variable.
///
/// Accepts "true" / "false" case-insensitively; anything else yields `default`.
fn parse_bool_env(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(v) if v.eq_ignore_ascii_case("true") => true,
        Ok(v) if v.eq_ignore_ascii_case("false") => false,
        _ => default,
    }
}

/// Parse a port environment variable, falling back to `default` when unset.
fn parse_port(name: &str, default: u16) -> Result<u16, ConfigError> {
    match env::var(name) {
        Ok(port_str) => Ok(port_str.trim().parse()?),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidFormat {
            var: name.to_string(),
            message: "contains invalid unicode".to_string(),
        }),
    }
}

fn parse_u64_env(name: &str, default: u64) -> Result<u64, ConfigError> {
    match env::var(name) {
        Ok(value) => value.trim().parse().map_err(|_| ConfigError::InvalidFormat {
            var: name.to_string(),
            message: format!("expected a non-negative integer, got '{value}'"),
        }),
        Err(_) => Ok(default),
    }
}

/// Parse the Redis connection variables.
///
/// Returns `None` when `CHATGATE_REDIS_HOST` is unset or empty.
fn parse_redis() -> Result<Option<RedisConfig>, ConfigError> {
    let host = match env::var("CHATGATE_REDIS_HOST") {
        Ok(host) if !host.trim().is_empty() => host.trim().to_string(),
        _ => return Ok(None),
    };

    let port = parse_port("CHATGATE_REDIS_PORT", DEFAULT_REDIS_PORT)?;
    let password = env::var("CHATGATE_REDIS_PASSWORD")
        .ok()
        .filter(|p| !p.is_empty());

    Ok(Some(RedisConfig {
        host,
        port,
        password,
    }))
}

/// Generates a throwaway signing secret for local mode.
fn generate_dev_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    warn!("CHATGATE_JWT_SECRET not set, using a random development secret");
    URL_SAFE_NO_PAD.encode(bytes)
}
