//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::bridge::BridgeRegistry;
use crate::config::Config;
use crate::pairing::PairingService;
use crate::terminal::interceptor::Interceptor;
use crate::terminal::TerminalRegistry;

/// Shared application state for the vibebridge server.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    /// Issues and validates pairing codes.
    pub pairing: PairingService,
    /// Canonical `user_id → bridge` map and heartbeat monitor.
    pub bridges: BridgeRegistry,
    /// Connected terminal sessions (output multiplexer delivery).
    pub terminals: TerminalRegistry,
    /// Routed-command classifier for terminal input.
    pub interceptor: Arc<Interceptor>,
}

impl AppState {
    #[must_use]
    pub fn new(config: Config) -> Self {
        let terminals = TerminalRegistry::new();
        let bridges = BridgeRegistry::new(
            Duration::from_millis(config.bridge.heartbeat_interval_ms),
            terminals.clone(),
        );
        let pairing = PairingService::new(
            config.pairing.code_length,
            Duration::from_millis(config.pairing.code_expiry_ms),
            config.pairing.max_codes_per_minute,
        );
        let interceptor = Arc::new(Interceptor::new(config.terminal.routed_prefixes.clone()));
        Self {
            config: Arc::new(config),
            start_time: Instant::now(),
            pairing,
            bridges,
            terminals,
            interceptor,
        }
    }
}
