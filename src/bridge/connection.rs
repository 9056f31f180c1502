//! A single bridge connection: identity, transport handle, status machine.
//!
//! Status machine: `connecting → connected → {disconnected | replaced}`.
//! Terminal states are final — a reconnecting agent always produces a new
//! [`BridgeHandle`], never resurrects an old one. The transition into a
//! terminal state happens exactly once, gated by the queue's close flag.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::json;
use serde_json::Value;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::Instant;

use crate::error::ConnectionError;

use super::queue::CommandQueue;

/// Lifecycle of a bridge connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BridgeStatus {
    Connecting,
    Connected,
    Disconnected,
    Replaced,
}

impl BridgeStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Replaced => "replaced",
        }
    }
}

/// One paired local agent's live connection, as held by the registry.
pub struct BridgeHandle {
    pub connection_id: String,
    pub user_id: String,
    /// Send messages to the agent over its WS (drained by the send task).
    pub agent_tx: mpsc::Sender<Value>,
    /// This connection's command queue and dispatcher.
    pub queue: Arc<CommandQueue>,
    /// Last heartbeat as ms since the registry epoch (lock-free).
    pub last_heartbeat_ms: AtomicU64,
    pub connected_since: Instant,
    status: Mutex<BridgeStatus>,
    /// Signals the agent WS handler to shut down (eviction, replacement).
    pub shutdown_tx: watch::Sender<bool>,
}

impl BridgeHandle {
    #[must_use]
    pub fn new(
        connection_id: &str,
        user_id: &str,
        agent_tx: mpsc::Sender<Value>,
        queue: Arc<CommandQueue>,
        now_ms: u64,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            connection_id: connection_id.to_string(),
            user_id: user_id.to_string(),
            agent_tx,
            queue,
            last_heartbeat_ms: AtomicU64::new(now_ms),
            connected_since: Instant::now(),
            status: Mutex::new(BridgeStatus::Connecting),
            shutdown_tx,
        })
    }

    pub async fn status(&self) -> BridgeStatus {
        *self.status.lock().await
    }

    pub(super) async fn mark_connected(&self) {
        *self.status.lock().await = BridgeStatus::Connected;
    }

    /// Drive the connection into a terminal state: fail all outstanding
    /// commands with `reason`, tell the agent, and signal its handler to
    /// shut down. Idempotent — only the first call does anything, so a
    /// connection reaches exactly one terminal status.
    pub async fn retire(&self, status: BridgeStatus, reason: ConnectionError) -> bool {
        debug_assert!(matches!(
            status,
            BridgeStatus::Disconnected | BridgeStatus::Replaced
        ));
        if !self.queue.fail_all(reason).await {
            return false;
        }
        *self.status.lock().await = status;
        let _ = self.agent_tx.try_send(json!({
            "type": "bridge:disconnect",
            "reason": reason.code(),
        }));
        let _ = self.shutdown_tx.send(true);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::terminal::TerminalRegistry;
    use std::time::Duration;

    fn handle() -> Arc<BridgeHandle> {
        let (agent_tx, _agent_rx) = mpsc::channel(8);
        let queue = CommandQueue::new(
            "conn-test",
            5,
            50,
            Duration::from_secs(60),
            agent_tx.clone(),
            TerminalRegistry::new(),
        );
        BridgeHandle::new("conn-test", "user-1", agent_tx, queue, 0)
    }

    #[tokio::test]
    async fn test_status_machine() {
        let handle = handle();
        assert_eq!(handle.status().await, BridgeStatus::Connecting);
        handle.mark_connected().await;
        assert_eq!(handle.status().await, BridgeStatus::Connected);
    }

    #[tokio::test]
    async fn test_retire_is_terminal_and_idempotent() {
        let handle = handle();
        handle.mark_connected().await;
        let mut shutdown_rx = handle.shutdown_tx.subscribe();

        assert!(
            handle
                .retire(BridgeStatus::Replaced, ConnectionError::BridgeReplaced)
                .await
        );
        assert_eq!(handle.status().await, BridgeStatus::Replaced);
        assert!(shutdown_rx.changed().await.is_ok());

        // A later retire must not overwrite the terminal status
        assert!(
            !handle
                .retire(
                    BridgeStatus::Disconnected,
                    ConnectionError::BridgeDisconnected
                )
                .await
        );
        assert_eq!(handle.status().await, BridgeStatus::Replaced);
    }
}
