//! HTTP route handlers for the Chatgate server.
//!
//! This module provides the HTTP API endpoints:
//!
//! - `GET /auth/ws` - Issue a short-lived realtime token (rate limited)
//! - `GET /ws` - WebSocket upgrade into the realtime gateway
//! - `GET /health` - Health check endpoint
//!
//! # Architecture
//!
//! All routes share application state through [`AppState`], which contains:
//! - Configuration
//! - The realtime [`Gateway`]
//! - The shared-store [`RateLimiter`]
//! - The [`TokenAuthenticator`] used to issue tokens
//! - Server start time for uptime reporting
//!
//! # Example
//!
//! ```rust,no_run
//! use std::net::SocketAddr;
//! use std::sync::Arc;
//! use chatgate_server::bus::LocalBus;
//! use chatgate_server::config::Config;
//! use chatgate_server::routes::{create_router, AppState};
//! use chatgate_server::store::MemoryCounterStore;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::from_env().expect("failed to load config");
//!     let state = AppState::new(config, Arc::new(MemoryCounterStore::new()), Arc::new(LocalBus::new()));
//!     let app = create_router(state);
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:4444").await.unwrap();
//!     axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
//!         .await
//!         .unwrap();
//! }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{ConnectInfo, Request, State, WebSocketUpgrade},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

use crate::auth::TokenAuthenticator;
use crate::bus::MessageBus;
use crate::config::Config;
use crate::error::ServerError;
use crate::gateway::{Gateway, GatewaySettings};
use crate::rate_limit::{extract_identity, RateLimitPolicy, RateLimitResult, RateLimiter};
use crate::store::CounterStore;

// ============================================================================
// Constants
// ============================================================================

/// Admission policy for `GET /auth/ws`: 5 tokens per 30 seconds per identity.
pub const AUTH_WS_POLICY: RateLimitPolicy =
    RateLimitPolicy::fixed_window(Duration::from_secs(30), 5);

const RATE_LIMITED_MESSAGE: &str = "Rate limit exceeded";
const INTERNAL_ERROR_MESSAGE: &str = "Internal server error";

// ============================================================================
// Application State
// ============================================================================

/// Shared application state for all route handlers.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration.
    pub config: Arc<Config>,

    /// Realtime gateway owning this process's connections.
    pub gateway: Gateway,

    /// Rate limiter backed by the shared counter store.
    pub rate_limiter: RateLimiter,

    /// Issues realtime tokens.
    pub authenticator: TokenAuthenticator,

    /// Server start time for uptime calculation.
    pub start_time: Instant,
}

impl AppState {
    /// Builds the state from configuration and the two shared backends.
    #[must_use]
    pub fn new(config: Config, store: Arc<dyn CounterStore>, bus: Arc<dyn MessageBus>) -> Self {
        let authenticator = TokenAuthenticator::new(&config.jwt_secret, config.token_ttl);
        let gateway = Gateway::new(
            GatewaySettings::from_config(&config),
            bus,
            authenticator.clone(),
        );
        let rate_limiter = RateLimiter::with_timeout(store, config.operation_timeout);

        Self::with_components(config, gateway, rate_limiter, authenticator)
    }

    /// Creates application state from prebuilt components.
    #[must_use]
    pub fn with_components(
        config: Config,
        gateway: Gateway,
        rate_limiter: RateLimiter,
        authenticator: TokenAuthenticator,
    ) -> Self {
        Self {
            config: Arc::new(config),
            gateway,
            rate_limiter,
            authenticator,
            start_time: Instant::now(),
        }
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &"<Config>")
            .field("gateway", &self.gateway)
            .field("rate_limiter", &self.rate_limiter)
            .field("authenticator", &self.authenticator)
            .field("start_time", &self.start_time)
            .finish()
    }
}

// ============================================================================
// Router
// ============================================================================

/// Creates the application router with all routes configured.
///
/// Serve it with `into_make_service_with_connect_info::<SocketAddr>()` so
/// rate limiting can fall back to the peer address.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/auth/ws", get(get_auth_token))
        .route("/ws", get(get_ws))
        .route("/health", get(get_health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============================================================================
// Error Response Types
// ============================================================================

/// JSON error response body.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub message: String,
}

impl ErrorResponse {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        match self {
            Self::RateLimit { retry_after, .. } => (
                StatusCode::TOO_MANY_REQUESTS,
                [(header::RETRY_AFTER, retry_after.to_string())],
                Json(ErrorResponse::new(RATE_LIMITED_MESSAGE)),
            )
                .into_response(),
            Self::Protocol(_) | Self::Auth(_) => (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse::new(self.to_string())),
            )
                .into_response(),
            // Internal detail stays in the logs.
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::new(INTERNAL_ERROR_MESSAGE)),
            )
                .into_response(),
        }
    }
}

// ============================================================================
// GET /auth/ws - Token Issuance
// ============================================================================

/// Response body for a successful token request.
#[derive(Debug, Serialize, Deserialize)]
pub struct AuthTokenResponse {
    pub status: String,
    pub token: String,
}

/// GET /auth/ws - Issues a realtime token.
///
/// # Responses
///
/// - `200 OK` - `{"status":"authenticated","token":"..."}`
/// - `429 Too Many Requests` - Rate limit exceeded (with `Retry-After`)
/// - `500 Internal Server Error` - Counter store unavailable or signing failed
async fn get_auth_token(State(state): State<AppState>, request: Request) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let identity = extract_identity(request.headers(), peer);

    match issue_token(&state, identity).await {
        Ok(token) => Json(AuthTokenResponse {
            status: "authenticated".to_string(),
            token,
        })
        .into_response(),
        Err(err) => {
            if err.is_server_error() {
                error!(error = %err, "Token issuance failed");
            }
            err.into_response()
        }
    }
}

async fn issue_token(state: &AppState, identity: String) -> Result<String, ServerError> {
    let decision = state
        .rate_limiter
        .decide(&identity, &AUTH_WS_POLICY)
        .await?;

    if let RateLimitResult::Limited { retry_after_secs } = decision {
        debug!(identity = %identity, retry_after_secs, "Token request rate limited");
        return Err(ServerError::rate_limit(identity, retry_after_secs));
    }

    let token = state
        .authenticator
        .issue(None, None)
        .map_err(|e| ServerError::infrastructure(e.to_string()))?;
    debug!(identity = %identity, "Issued realtime token");
    Ok(token)
}

// ============================================================================
// GET /ws - WebSocket Upgrade
// ============================================================================

/// GET /ws - Upgrades to the realtime protocol.
///
/// No authentication happens at upgrade time; clients send an AUTH frame
/// once the socket is open.
async fn get_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    info!("Realtime client connecting");
    ws.on_upgrade(move |socket| state.gateway.accept(socket))
}

// ============================================================================
// GET /health - Health Check
// ============================================================================

/// Response body for health check endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Server status (always "ok" if responding).
    pub status: String,

    /// Number of open realtime connections in this process.
    pub connections: usize,

    /// Server uptime in seconds.
    pub uptime_seconds: u64,
}

/// GET /health - Health check endpoint.
async fn get_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        connections: state.gateway.connection_count(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::bus::LocalBus;
    use crate::store::{MemoryCounterStore, StoreError};

    fn test_config() -> Config {
        Config {
            port: 0,
            jwt_secret: "routes-test-secret".to_string(),
            redis: None,
            token_ttl: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(300),
            operation_timeout: Duration::from_millis(500),
            bus_channel: "realtime".to_string(),
            require_auth: true,
            local_mode: true,
        }
    }

    fn test_state() -> AppState {
        AppState::new(
            test_config(),
            Arc::new(MemoryCounterStore::new()),
            Arc::new(LocalBus::new()),
        )
    }

    /// A counter store that is always down.
    struct BrokenStore;

    #[async_trait]
    impl CounterStore for BrokenStore {
        async fn incr_window(&self, _key: &str, _ttl: Duration) -> Result<i64, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }

        async fn slide_window(
            &self,
            _key: &str,
            _now_ms: i64,
            _interval_ms: i64,
            _member: &str,
        ) -> Result<i64, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
    }

    fn auth_request(forwarded_for: &str) -> Request<Body> {
        Request::builder()
            .uri("/auth/ws")
            .header("X-Forwarded-For", forwarded_for)
            .body(Body::empty())
            .unwrap()
    }

    async fn body_json<T: serde::de::DeserializeOwned>(response: Response) -> T {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    // ========================================================================
    // Health endpoint tests
    // ========================================================================

    #[tokio::test]
    async fn health_returns_ok_status() {
        let app = create_router(test_state());

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let health: HealthResponse = body_json(response).await;
        assert_eq!(health.status, "ok");
        assert_eq!(health.connections, 0);
    }

    #[tokio::test]
    async fn health_reports_connection_count() {
        let state = test_state();
        let _a = state.gateway.registry().register();
        let _b = state.gateway.registry().register();
        let app = create_router(state);

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let health: HealthResponse = body_json(response).await;
        assert_eq!(health.connections, 2);
    }

    // ========================================================================
    // Token endpoint tests
    // ========================================================================

    #[tokio::test]
    async fn auth_ws_issues_verifiable_token() {
        let state = test_state();
        let authenticator = state.authenticator.clone();
        let app = create_router(state);

        let response = app.oneshot(auth_request("10.0.0.1")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body: AuthTokenResponse = body_json(response).await;
        assert_eq!(body.status, "authenticated");
        assert!(authenticator.verify(&body.token).is_ok());
    }

    #[tokio::test]
    async fn auth_ws_rate_limits_sixth_request() {
        let app = create_router(test_state());

        for _ in 0..5 {
            let response = app.clone().oneshot(auth_request("10.0.0.2")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = app.oneshot(auth_request("10.0.0.2")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "30");
        let body: ErrorResponse = body_json(response).await;
        assert_eq!(body.message, "Rate limit exceeded");
    }

    #[tokio::test]
    async fn auth_ws_limits_each_identity_separately() {
        let app = create_router(test_state());

        for _ in 0..5 {
            app.clone().oneshot(auth_request("10.0.0.3")).await.unwrap();
        }

        let response = app.oneshot(auth_request("10.0.0.4")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn auth_ws_hides_store_failures() {
        let config = test_config();
        let authenticator = TokenAuthenticator::new(&config.jwt_secret, config.token_ttl);
        let gateway = Gateway::new(
            GatewaySettings::from_config(&config),
            Arc::new(LocalBus::new()),
            authenticator.clone(),
        );
        let limiter = RateLimiter::new(Arc::new(BrokenStore));
        let app = create_router(AppState::with_components(config, gateway, limiter, authenticator));

        let response = app.oneshot(auth_request("10.0.0.5")).await.unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: ErrorResponse = body_json(response).await;
        assert_eq!(body.message, "Internal server error");
    }

    #[tokio::test]
    async fn ws_without_upgrade_headers_is_rejected() {
        let app = create_router(test_state());

        let response = app
            .oneshot(Request::builder().uri("/ws").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert!(response.status().is_client_error());
    }

    #[test]
    fn app_state_debug_hides_config() {
        let debug = format!("{:?}", test_state());
        assert!(debug.contains("<Config>"));
        assert!(!debug.contains("routes-test-secret"));
    }
}
