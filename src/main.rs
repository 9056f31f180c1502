#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! vibebridge server binary.
//!
//! ## API surface
//!
//! | Method | Path                 | Auth   | Description                      |
//! |--------|----------------------|--------|----------------------------------|
//! | GET    | `/api/health`        | No     | Liveness probe                   |
//! | POST   | `/api/pairing/code`  | Yes    | Issue a pairing code             |
//! | GET    | `/api/bridge/status` | Yes    | Bridge status for the user       |
//! | DELETE | `/api/bridge`        | Yes    | Explicitly disconnect the bridge |
//! | GET    | `/api/agent/ws`      | Code*  | Agent WebSocket                  |
//! | GET    | `/api/terminal/ws`   | Yes†   | Terminal WebSocket               |
//!
//! \* The agent authenticates by consuming a single-use pairing code in its
//! first frame.
//! † WebSocket auth is via `?token=<key>` query param (no `Authorization`
//! header available during the upgrade handshake).

use std::time::Duration;

use axum::{
    middleware,
    routing::{delete, get, post},
    Extension, Router,
};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use vibebridge::{auth, routes, ws, ApiKey, AppState, Config};

/// Remote command bridge for browser-hosted terminal sessions.
#[derive(Parser)]
#[command(name = "vibebridge", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP/WS server (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config_path = match cli.command {
        Some(Commands::Serve { config }) => config,
        None => None,
    };
    run_server(config_path.as_deref()).await;
}

async fn run_server(config_path: Option<&str>) {
    let config = Config::load(config_path);

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("vibebridge v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.server.listen);

    if config.auth.api_key == "change-me" {
        warn!("Using default API key — set VIBEBRIDGE_API_KEY or update config");
    }

    let heartbeat_interval = Duration::from_millis(config.bridge.heartbeat_interval_ms);
    let state = AppState::new(config);

    // Build router
    let public_routes = Router::new().route("/api/health", get(routes::health::health));

    let authed_routes = Router::new()
        .route("/api/pairing/code", post(routes::pairing::create_code))
        .route("/api/bridge/status", get(routes::bridge::status))
        .route("/api/bridge", delete(routes::bridge::disconnect))
        .layer(middleware::from_fn(auth::require_api_key));

    let ws_routes = Router::new()
        .route("/api/agent/ws", get(ws::agent::agent_ws))
        .route("/api/terminal/ws", get(ws::terminal::terminal_ws));

    let app = Router::new()
        .merge(public_routes)
        .merge(authed_routes)
        .merge(ws_routes)
        .layer(Extension(ApiKey(state.config.auth.api_key.clone())))
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let listener = TcpListener::bind(&state.config.server.listen)
        .await
        .expect("Failed to bind");

    info!("Server ready");

    // Heartbeat monitor: evict bridges silent for 2x the heartbeat interval
    let registry = state.bridges.clone();
    let sweep_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(heartbeat_interval);
        loop {
            interval.tick().await;
            registry.sweep().await;
        }
    });

    // Pairing GC: prune expired codes
    let pairing = state.pairing.clone();
    let pairing_gc_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            pairing.sweep().await;
        }
    });

    // Graceful shutdown
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("Failed to register SIGTERM");
            tokio::select! {
                _ = ctrl_c => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("Received SIGINT");
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .expect("Server error");

    // Cleanup
    info!("Shutting down...");
    sweep_task.abort();
    pairing_gc_task.abort();
    state.bridges.drain_all().await;
    info!("Goodbye");
}
