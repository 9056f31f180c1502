//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `VIBEBRIDGE_API_KEY`, `VIBEBRIDGE_LISTEN`
//! 2. **Config file** — path via `--config <path>`, or `vibebridge.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:4050"
//!
//! [auth]
//! api_key = "your-secret-key"
//!
//! [pairing]
//! code_length = 6
//! code_expiry_ms = 300000      # 5 minutes
//! max_codes_per_minute = 5
//!
//! [bridge]
//! heartbeat_interval_ms = 30000
//! max_commands_per_bridge = 5
//! command_timeout_ms = 60000
//! max_queue_depth = 50
//!
//! [terminal]
//! routed_prefixes = ["claude"]
//!
//! [logging]
//! level = "info"
//! ```

use serde::Deserialize;
use std::path::Path;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub pairing: PairingConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub terminal: TerminalConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:4050`).
    #[serde(default = "default_listen")]
    pub listen: String,
}

/// Authentication settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Pre-shared Bearer token for the IDE-facing API. Override with
    /// `VIBEBRIDGE_API_KEY`. Defaults to `"change-me"` which triggers a
    /// startup warning.
    #[serde(default = "default_api_key")]
    pub api_key: String,
}

/// Pairing-code issuance settings.
#[derive(Debug, Clone, Deserialize)]
pub struct PairingConfig {
    /// Number of decimal digits in a pairing code (default 6).
    #[serde(default = "default_code_length")]
    pub code_length: usize,
    /// Milliseconds a code stays valid after issuance (default 300 000).
    #[serde(default = "default_code_expiry_ms")]
    pub code_expiry_ms: u64,
    /// Codes a single user may request per minute (default 5).
    #[serde(default = "default_max_codes_per_minute")]
    pub max_codes_per_minute: usize,
}

/// Bridge connection and dispatch settings.
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    /// Milliseconds between agent heartbeats; a connection missing heartbeats
    /// for twice this interval is evicted (default 30 000).
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Maximum commands dispatched concurrently per bridge (default 5).
    #[serde(default = "default_max_commands_per_bridge")]
    pub max_commands_per_bridge: usize,
    /// Milliseconds before a dispatched command times out (default 60 000).
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    /// Maximum queued-but-undispatched commands per bridge (default 50).
    #[serde(default = "default_max_queue_depth")]
    pub max_queue_depth: usize,
}

/// Terminal input classification settings.
#[derive(Debug, Clone, Deserialize)]
pub struct TerminalConfig {
    /// First-token prefixes that route a line to the bridge instead of the
    /// local shell (default `["claude"]`).
    #[serde(default = "default_routed_prefixes")]
    pub routed_prefixes: Vec<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "0.0.0.0:4050".to_string()
}
fn default_api_key() -> String {
    "change-me".to_string()
}
fn default_code_length() -> usize {
    6
}
fn default_code_expiry_ms() -> u64 {
    300_000
}
fn default_max_codes_per_minute() -> usize {
    5
}
fn default_heartbeat_interval_ms() -> u64 {
    30_000
}
fn default_max_commands_per_bridge() -> usize {
    5
}
fn default_command_timeout_ms() -> u64 {
    60_000
}
fn default_max_queue_depth() -> usize {
    50
}
fn default_routed_prefixes() -> Vec<String> {
    vec!["claude".to_string()]
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            api_key: default_api_key(),
        }
    }
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            code_length: default_code_length(),
            code_expiry_ms: default_code_expiry_ms(),
            max_codes_per_minute: default_max_codes_per_minute(),
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            max_commands_per_bridge: default_max_commands_per_bridge(),
            command_timeout_ms: default_command_timeout_ms(),
            max_queue_depth: default_max_queue_depth(),
        }
    }
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            routed_prefixes: default_routed_prefixes(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise
    /// looks for `vibebridge.toml` in the current directory, falling back to
    /// compiled defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("vibebridge.toml").exists() {
            let content =
                std::fs::read_to_string("vibebridge.toml").expect("Failed to read vibebridge.toml");
            toml::from_str(&content).expect("Failed to parse vibebridge.toml")
        } else {
            Config::default()
        };

        // Env var overrides
        if let Ok(key) = std::env::var("VIBEBRIDGE_API_KEY") {
            config.auth.api_key = key;
        }
        if let Ok(listen) = std::env::var("VIBEBRIDGE_LISTEN") {
            config.server.listen = listen;
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.pairing.code_length, 6);
        assert_eq!(config.pairing.code_expiry_ms, 300_000);
        assert_eq!(config.bridge.heartbeat_interval_ms, 30_000);
        assert_eq!(config.bridge.max_commands_per_bridge, 5);
        assert_eq!(config.bridge.command_timeout_ms, 60_000);
        assert_eq!(config.bridge.max_queue_depth, 50);
        assert_eq!(config.terminal.routed_prefixes, vec!["claude"]);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [bridge]
            max_commands_per_bridge = 2

            [terminal]
            routed_prefixes = ["claude", "gemini"]
            "#,
        )
        .unwrap();
        assert_eq!(config.bridge.max_commands_per_bridge, 2);
        assert_eq!(config.bridge.max_queue_depth, 50);
        assert_eq!(config.terminal.routed_prefixes.len(), 2);
        assert_eq!(config.auth.api_key, "change-me");
    }
}
