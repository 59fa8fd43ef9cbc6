//! Chatgate Server - Main entry point.
//!
//! This binary starts the realtime gateway with:
//! - Structured JSON logging
//! - Redis-backed rate limiting and cross-process fan-out
//! - Graceful shutdown on SIGTERM/SIGINT
//! - Non-zero exit on infrastructure faults, for the supervisor to restart
//!
//! # Configuration
//!
//! See [`chatgate_server::config`] for environment variable configuration.
//!
//! # Example
//!
//! ```bash
//! # Development mode (single process, no Redis)
//! CHATGATE_LOCAL_MODE=true cargo run --bin chatgate-server
//!
//! # Production mode
//! CHATGATE_JWT_SECRET="change-me" \
//! CHATGATE_REDIS_HOST=redis.internal \
//! PORT=4444 \
//! cargo run --release --bin chatgate-server
//! ```

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use chatgate_server::bus::{LocalBus, MessageBus, RedisBus};
use chatgate_server::config::{Config, ConfigError};
use chatgate_server::error::ServerError;
use chatgate_server::gateway::Gateway;
use chatgate_server::routes::{create_router, AppState};
use chatgate_server::store::{CounterStore, MemoryCounterStore, RedisCounterStore};

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "Failed to load configuration");
            eprintln!("Error: {err}");
            eprintln!();
            eprintln!("Required environment variables (unless CHATGATE_LOCAL_MODE=true):");
            eprintln!("  CHATGATE_JWT_SECRET       - Secret used to sign realtime tokens");
            eprintln!("  CHATGATE_REDIS_HOST       - Redis host for rate limits and fan-out");
            eprintln!();
            eprintln!("Optional environment variables:");
            eprintln!("  PORT                      - HTTP server port (default: 4444)");
            eprintln!("  CHATGATE_REDIS_PORT       - Redis port (default: 6379)");
            eprintln!("  CHATGATE_REDIS_PASSWORD   - Redis password");
            eprintln!("  CHATGATE_HEARTBEAT_SECS   - Heartbeat interval (default: 300)");
            eprintln!("  CHATGATE_LOCAL_MODE       - In-process store and bus (dev only)");
            eprintln!("  RUST_LOG                  - Log level filter (default: info)");
            return ExitCode::from(1);
        }
    };

    info!(
        port = config.port,
        local_mode = config.local_mode,
        require_auth = config.require_auth,
        heartbeat_secs = config.heartbeat_interval.as_secs(),
        channel = %config.bus_channel,
        "Chatgate server starting"
    );

    let (store, bus) = match connect_backends(&config).await {
        Ok(backends) => backends,
        Err(err) => {
            error!(error = %err, "Failed to connect to shared backends");
            return ExitCode::from(1);
        }
    };

    let state = AppState::new(config.clone(), store, bus);
    let gateway = state.gateway.clone();

    let fanout = match gateway.spawn_fanout().await {
        Ok(handle) => handle,
        Err(err) => {
            error!(error = %err, "Failed to subscribe to message bus");
            return ExitCode::from(1);
        }
    };
    info!(channel = %config.bus_channel, "Fan-out task started");

    let app = create_router(state);

    let bind_addr = format!("0.0.0.0:{}", config.port);
    let listener = match TcpListener::bind(&bind_addr).await {
        Ok(listener) => {
            info!(port = config.port, address = %bind_addr, "Server listening");
            listener
        }
        Err(err) => {
            error!(error = %err, address = %bind_addr, "Failed to bind to address");
            return ExitCode::from(1);
        }
    };

    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(gateway.clone()));

    info!("Server ready to accept connections");

    if let Err(err) = server.await {
        error!(error = %err, "Server error");
        return ExitCode::from(1);
    }

    fanout.abort();

    let fault = gateway.faults().borrow().clone();
    if let Some(fault) = fault {
        error!(fault = %fault, "Server stopped after an infrastructure fault");
        return ExitCode::from(1);
    }

    info!("Server shutdown complete");
    ExitCode::SUCCESS
}

/// Connects the counter store and the message bus.
///
/// Local mode keeps both in-process; otherwise both share one Redis server.
async fn connect_backends(
    config: &Config,
) -> Result<(Arc<dyn CounterStore>, Arc<dyn MessageBus>), ServerError> {
    if config.local_mode {
        warn!("Using in-process counter store and message bus");
        return Ok((
            Arc::new(MemoryCounterStore::new()),
            Arc::new(LocalBus::new()),
        ));
    }

    let redis = config
        .redis
        .as_ref()
        .ok_or_else(|| ConfigError::MissingEnvVar("CHATGATE_REDIS_HOST".to_string()))?;
    let url = redis.url();

    let store = RedisCounterStore::connect(&url).await?;
    let bus = RedisBus::connect(&url).await?;
    info!(host = %redis.host, port = redis.port, "Connected to Redis");

    Ok((Arc::new(store), Arc::new(bus)))
}

/// Initialize structured logging with tracing.
///
/// JSON output, filtered by `RUST_LOG` (default `info,tower_http=debug`).
fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug,axum::rejection=trace"));

    let json_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_level(true)
        .with_file(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .init();
}

/// Resolves on SIGINT, SIGTERM, or the first gateway fault, then closes
/// every realtime connection so graceful shutdown can complete.
async fn shutdown_signal(gateway: Gateway) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
        fault = gateway.fault() => {
            error!(fault = %fault, "Infrastructure fault, shutting down");
        }
    }

    gateway.shutdown();
}
