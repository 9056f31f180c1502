#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]

//! # vibebridge
//!
//! Remote command bridge for browser-hosted terminal sessions.
//!
//! A user's cloud terminal can route specific commands (e.g. `claude ...`)
//! to a tool installed on their own machine. A local agent pairs with the
//! server using a short-lived single-use code, then holds a WebSocket over
//! which routed commands are dispatched and their output streamed back to
//! the originating terminal. The cloud service never touches local tooling
//! or its credentials.
//!
//! ## Architecture
//!
//! ```text
//! main.rs        — entry point, clap subcommands, router setup, sweeps,
//!                  graceful shutdown
//! state.rs       — shared AppState
//! auth.rs        — Bearer token middleware, verified-user extraction
//! config.rs      — TOML + env-var configuration
//! error.rs       — typed error taxonomy with stable wire codes
//! pairing.rs     — pairing-code issuance/consumption/rate-limit/GC
//! bridge/
//!   mod.rs       — BridgeRegistry (user → connection map, heartbeat sweep)
//!   connection.rs— BridgeHandle, connection status machine
//!   queue.rs     — per-connection FIFO queue, bounded-concurrency dispatch,
//!                  per-command timeouts, output forwarding
//! terminal/
//!   mod.rs       — TerminalRegistry (output multiplexer delivery)
//!   interceptor.rs — routed-command classification
//! routes/        — REST handlers (health, pairing, bridge status/disconnect)
//! ws/
//!   agent.rs     — local-agent WebSocket (pairing handshake, ingestion)
//!   terminal.rs  — terminal WebSocket (input lines, streamed events)
//! ```

pub mod auth;
pub mod bridge;
pub mod config;
pub mod error;
pub mod pairing;
pub mod routes;
pub mod state;
pub mod terminal;
pub mod ws;

// Re-export key types at crate root for convenience.
pub use auth::ApiKey;
pub use bridge::BridgeRegistry;
pub use config::Config;
pub use pairing::PairingService;
pub use state::AppState;
pub use terminal::TerminalRegistry;
