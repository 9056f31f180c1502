//! Terminal session registry — the delivery side of the output multiplexer.
//!
//! Each connected terminal WebSocket registers an outbound channel here under
//! its `terminal_session_id`. Command output, command results, synthesized
//! notices, and bridge status events are all delivered through this registry.
//!
//! Delivery uses `try_send` so a slow terminal can never stall the dispatcher
//! or the agent read loop; dropped messages are counted and logged.

pub mod interceptor;

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

/// Capacity of each terminal's outbound message channel.
const TERMINAL_CHANNEL_CAPACITY: usize = 256;

/// A registered terminal session.
struct TerminalSession {
    user_id: String,
    tx: mpsc::Sender<Value>,
}

/// Registry of connected terminal sessions.
///
/// Cloneable — all clones share the same inner map.
#[derive(Clone, Default)]
pub struct TerminalRegistry {
    sessions: Arc<RwLock<HashMap<String, TerminalSession>>>,
}

impl TerminalRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a terminal session, returning the receiving half of its
    /// outbound channel. Re-registering a session id replaces the old channel.
    pub async fn register(&self, session_id: &str, user_id: &str) -> mpsc::Receiver<Value> {
        let (tx, rx) = mpsc::channel(TERMINAL_CHANNEL_CAPACITY);
        let mut sessions = self.sessions.write().await;
        sessions.insert(
            session_id.to_string(),
            TerminalSession {
                user_id: user_id.to_string(),
                tx,
            },
        );
        rx
    }

    pub async fn unregister(&self, session_id: &str) {
        self.sessions.write().await.remove(session_id);
    }

    /// Deliver a message to one terminal session. Unknown sessions and
    /// backpressure drops are logged, not errors — the session may have
    /// closed while output was in flight.
    pub async fn send_to_session(&self, session_id: &str, msg: Value) {
        let sessions = self.sessions.read().await;
        match sessions.get(session_id) {
            Some(session) => {
                if session.tx.try_send(msg).is_err() {
                    warn!(session_id, "Dropped terminal message (backpressure or closed)");
                }
            }
            None => {
                debug!(session_id, "Dropped message for unknown terminal session");
            }
        }
    }

    /// Deliver a message to every terminal session belonging to `user_id`.
    /// Used for bridge status events, which are independent of any command.
    pub async fn broadcast_user(&self, user_id: &str, msg: &Value) {
        let sessions = self.sessions.read().await;
        for (session_id, session) in sessions.iter() {
            if session.user_id == user_id && session.tx.try_send(msg.clone()).is_err() {
                warn!(session_id, "Dropped broadcast (backpressure or closed)");
            }
        }
    }

    /// Number of registered sessions. Test and status helper.
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_send_to_session() {
        let registry = TerminalRegistry::new();
        let mut rx = registry.register("t1", "user-1").await;
        registry
            .send_to_session("t1", json!({"type": "terminal:notice"}))
            .await;
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg["type"], "terminal:notice");
    }

    #[tokio::test]
    async fn test_unknown_session_is_noop() {
        let registry = TerminalRegistry::new();
        registry.send_to_session("nope", json!({"type": "x"})).await;
    }

    #[tokio::test]
    async fn test_broadcast_only_reaches_owner() {
        let registry = TerminalRegistry::new();
        let mut rx1 = registry.register("t1", "user-1").await;
        let mut rx2 = registry.register("t2", "user-2").await;
        registry
            .broadcast_user("user-1", &json!({"type": "bridge:status"}))
            .await;
        assert!(rx1.recv().await.is_some());
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unregister() {
        let registry = TerminalRegistry::new();
        let _rx = registry.register("t1", "user-1").await;
        assert_eq!(registry.session_count().await, 1);
        registry.unregister("t1").await;
        assert_eq!(registry.session_count().await, 0);
    }
}
