//! Bridge registry and heartbeat monitor.
//!
//! [`BridgeRegistry`] is the single source of truth for the
//! `user_id → BridgeConnection` mapping. All mutation goes through its
//! methods under one `RwLock`, so there are no torn reads: pairing
//! (insert/replace), heartbeat recording, eviction, and explicit disconnect
//! are each atomic with respect to the others.
//!
//! Invariant: at most one connected bridge per user. A successful pairing
//! while a bridge is already connected evicts the old one (its outstanding
//! commands fail with `BRIDGE_REPLACED`) and installs the new — reconnection
//! never resurrects a retired connection.
//!
//! The heartbeat monitor is [`BridgeRegistry::sweep`], run by a periodic task
//! in `main`: connections silent for twice the heartbeat interval are
//! retired with `BRIDGE_UNAVAILABLE` and removed.

pub mod connection;
pub mod queue;

pub use connection::{BridgeHandle, BridgeStatus};
pub use queue::{Command, CommandQueue, CommandStatus, EnqueueReject};

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::ConnectionError;
use crate::terminal::TerminalRegistry;

/// Canonical `user_id → bridge` map plus the heartbeat monitor.
///
/// Cloneable — all clones share the same inner map.
#[derive(Clone)]
pub struct BridgeRegistry {
    bridges: Arc<RwLock<HashMap<String, Arc<BridgeHandle>>>>,
    terminals: TerminalRegistry,
    heartbeat_interval: Duration,
    /// Process epoch for lock-free heartbeat timestamps.
    epoch: Instant,
}

impl BridgeRegistry {
    #[must_use]
    pub fn new(heartbeat_interval: Duration, terminals: TerminalRegistry) -> Self {
        Self {
            bridges: Arc::new(RwLock::new(HashMap::new())),
            terminals,
            heartbeat_interval,
            epoch: Instant::now(),
        }
    }

    /// Milliseconds since the registry epoch.
    #[must_use]
    pub fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// The connected bridge for `user_id`, if any. Presence in the map means
    /// `connected` — retired handles are always removed in the same critical
    /// section that retires them.
    pub async fn get(&self, user_id: &str) -> Option<Arc<BridgeHandle>> {
        self.bridges.read().await.get(user_id).cloned()
    }

    /// Install a freshly paired connection, applying the single-active
    /// policy: an existing bridge for the same user is retired with
    /// `BRIDGE_REPLACED` before the new one becomes `connected`.
    pub async fn put(&self, handle: Arc<BridgeHandle>) {
        let user_id = handle.user_id.clone();
        {
            let mut bridges = self.bridges.write().await;
            if let Some(old) = bridges.get(&user_id) {
                warn!(
                    user_id = %user_id,
                    old_connection_id = %old.connection_id,
                    "User paired a new agent while connected, evicting old bridge"
                );
                old.retire(BridgeStatus::Replaced, ConnectionError::BridgeReplaced)
                    .await;
                self.terminals
                    .broadcast_user(&user_id, &status_event("replaced", Some("BRIDGE_REPLACED")))
                    .await;
            }
            handle.mark_connected().await;
            bridges.insert(user_id.clone(), handle.clone());
        }
        info!(
            user_id = %user_id,
            connection_id = %handle.connection_id,
            "Bridge connected"
        );
        self.terminals
            .broadcast_user(&user_id, &status_event("connected", None))
            .await;
    }

    /// Update a connection's heartbeat timestamp. Unknown connection ids are
    /// a logged anomaly, not an error — the sweep may have evicted the
    /// connection while its heartbeat was in flight.
    pub async fn record_heartbeat(&self, connection_id: &str) {
        let bridges = self.bridges.read().await;
        match bridges.values().find(|h| h.connection_id == connection_id) {
            Some(handle) => {
                handle
                    .last_heartbeat_ms
                    .store(self.now_ms(), Ordering::Relaxed);
            }
            None => {
                warn!(connection_id, "Heartbeat from unknown connection (ignored)");
            }
        }
    }

    /// Evict connections silent for more than twice the heartbeat interval.
    ///
    /// Each eviction fails the connection's outstanding commands exactly once
    /// with `BRIDGE_UNAVAILABLE` and notifies the user's terminals. One
    /// connection's eviction cannot block another's — each step only touches
    /// that connection's own queue. Returns the evicted connection ids.
    pub async fn sweep(&self) -> Vec<String> {
        let timeout_ms = 2 * self.heartbeat_interval.as_millis() as u64;
        let now_ms = self.now_ms();

        let mut bridges = self.bridges.write().await;
        let mut evicted = Vec::new();

        let user_ids: Vec<String> = bridges.keys().cloned().collect();
        for user_id in user_ids {
            let Some(handle) = bridges.get(&user_id) else {
                continue;
            };
            let last_hb = handle.last_heartbeat_ms.load(Ordering::Relaxed);
            if now_ms.saturating_sub(last_hb) <= timeout_ms {
                continue;
            }
            let handle = handle.clone();
            handle
                .retire(BridgeStatus::Disconnected, ConnectionError::BridgeUnavailable)
                .await;
            bridges.remove(&user_id);
            warn!(
                user_id = %user_id,
                connection_id = %handle.connection_id,
                "Evicted bridge (heartbeat timeout)"
            );
            self.terminals
                .broadcast_user(
                    &user_id,
                    &status_event("disconnected", Some("BRIDGE_UNAVAILABLE")),
                )
                .await;
            evicted.push(handle.connection_id.clone());
        }

        evicted
    }

    /// Explicit disconnect requested through the IDE. Returns `false` when no
    /// bridge was connected.
    pub async fn disconnect(&self, user_id: &str) -> bool {
        let handle = {
            let mut bridges = self.bridges.write().await;
            bridges.remove(user_id)
        };
        let Some(handle) = handle else {
            return false;
        };
        handle
            .retire(
                BridgeStatus::Disconnected,
                ConnectionError::BridgeDisconnected,
            )
            .await;
        info!(
            user_id,
            connection_id = %handle.connection_id,
            "Bridge disconnected (explicit)"
        );
        self.terminals
            .broadcast_user(user_id, &status_event("disconnected", Some("BRIDGE_DISCONNECTED")))
            .await;
        true
    }

    /// Remove `connection_id` after its agent WS closed, unless a newer
    /// connection already replaced it (a replaced handler must not tear down
    /// its replacement).
    pub async fn remove_if_current(&self, connection_id: &str) {
        let handle = {
            let mut bridges = self.bridges.write().await;
            let user_id = bridges
                .iter()
                .find(|(_, h)| h.connection_id == connection_id)
                .map(|(u, _)| u.clone());
            user_id.and_then(|u| bridges.remove(&u))
        };
        let Some(handle) = handle else {
            return;
        };
        handle
            .retire(
                BridgeStatus::Disconnected,
                ConnectionError::BridgeDisconnected,
            )
            .await;
        info!(
            user_id = %handle.user_id,
            connection_id,
            "Bridge disconnected (agent closed)"
        );
        self.terminals
            .broadcast_user(
                &handle.user_id,
                &status_event("disconnected", Some("BRIDGE_DISCONNECTED")),
            )
            .await;
    }

    /// Status snapshot for the IDE-facing REST endpoint.
    pub async fn status_json(&self, user_id: &str) -> Value {
        match self.get(user_id).await {
            Some(handle) => {
                let last_hb = handle.last_heartbeat_ms.load(Ordering::Relaxed);
                json!({
                    "status": "connected",
                    "connection_id": handle.connection_id,
                    "capacity": handle.queue.capacity(),
                    "active_command_count": handle.queue.active().await,
                    "queue_depth": handle.queue.depth().await,
                    "last_heartbeat_ago_ms": self.now_ms().saturating_sub(last_hb),
                    "connected_since_ms": handle.connected_since.elapsed().as_millis() as u64,
                })
            }
            None => json!({ "status": "disconnected" }),
        }
    }

    /// Retire every bridge (server shutdown).
    pub async fn drain_all(&self) {
        let mut bridges = self.bridges.write().await;
        for (user_id, handle) in bridges.drain() {
            handle
                .retire(
                    BridgeStatus::Disconnected,
                    ConnectionError::BridgeDisconnected,
                )
                .await;
            info!(user_id, "Drained bridge for shutdown");
        }
    }

    /// Number of connected bridges.
    pub async fn bridge_count(&self) -> usize {
        self.bridges.read().await.len()
    }
}

fn status_event(status: &str, reason: Option<&str>) -> Value {
    match reason {
        Some(reason) => json!({"type": "bridge:status", "status": status, "reason": reason}),
        None => json!({"type": "bridge:status", "status": status}),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use tokio::sync::mpsc;

    fn registry(terminals: &TerminalRegistry) -> BridgeRegistry {
        BridgeRegistry::new(Duration::from_secs(30), terminals.clone())
    }

    fn handle_for(
        registry: &BridgeRegistry,
        terminals: &TerminalRegistry,
        user_id: &str,
    ) -> (Arc<BridgeHandle>, mpsc::Receiver<Value>) {
        let (agent_tx, agent_rx) = mpsc::channel(64);
        let connection_id = uuid::Uuid::new_v4().to_string();
        let queue = CommandQueue::new(
            &connection_id,
            5,
            50,
            Duration::from_secs(60),
            agent_tx.clone(),
            terminals.clone(),
        );
        let handle = BridgeHandle::new(&connection_id, user_id, agent_tx, queue, registry.now_ms());
        (handle, agent_rx)
    }

    #[tokio::test]
    async fn test_put_get() {
        let terminals = TerminalRegistry::new();
        let registry = registry(&terminals);
        let (handle, _rx) = handle_for(&registry, &terminals, "user-1");
        registry.put(handle.clone()).await;

        let found = registry.get("user-1").await.unwrap();
        assert_eq!(found.connection_id, handle.connection_id);
        assert_eq!(found.status().await, BridgeStatus::Connected);
        assert!(registry.get("user-2").await.is_none());
    }

    #[tokio::test]
    async fn test_replacement_evicts_old_and_fails_its_commands() {
        let terminals = TerminalRegistry::new();
        let mut term_rx = terminals.register("t1", "user-1").await;
        let registry = registry(&terminals);

        let (old, mut old_agent_rx) = handle_for(&registry, &terminals, "user-1");
        registry.put(old.clone()).await;
        let _ = term_rx.recv().await; // connected event

        old.queue.enqueue("t1", "claude hi").await.unwrap();
        let _ = old_agent_rx.recv().await; // dispatch

        let (new, _new_agent_rx) = handle_for(&registry, &terminals, "user-1");
        registry.put(new.clone()).await;

        assert_eq!(old.status().await, BridgeStatus::Replaced);
        let current = registry.get("user-1").await.unwrap();
        assert_eq!(current.connection_id, new.connection_id);

        // In-flight command failed with BRIDGE_REPLACED, then status events
        let mut saw_replaced_failure = false;
        let mut saw_connected = false;
        while let Ok(msg) = term_rx.try_recv() {
            match msg["type"].as_str().unwrap() {
                "command:result" => {
                    assert_eq!(msg["code"], "BRIDGE_REPLACED");
                    saw_replaced_failure = true;
                }
                "bridge:status" => {
                    if msg["status"] == "connected" {
                        saw_connected = true;
                    }
                }
                other => panic!("unexpected event {other}"),
            }
        }
        assert!(saw_replaced_failure);
        assert!(saw_connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_evicts_silent_connection_once() {
        let terminals = TerminalRegistry::new();
        let mut term_rx = terminals.register("t1", "user-1").await;
        let registry = registry(&terminals);

        let (handle, mut agent_rx) = handle_for(&registry, &terminals, "user-1");
        registry.put(handle.clone()).await;
        let _ = term_rx.recv().await; // connected event

        handle.queue.enqueue("t1", "claude a").await.unwrap(); // in flight
        let _ = agent_rx.recv().await;

        // Inside the 2x window nothing is evicted
        tokio::time::advance(Duration::from_secs(45)).await;
        assert!(registry.sweep().await.is_empty());

        tokio::time::advance(Duration::from_secs(16)).await;
        let evicted = registry.sweep().await;
        assert_eq!(evicted, vec![handle.connection_id.clone()]);
        assert!(registry.get("user-1").await.is_none());
        assert_eq!(handle.status().await, BridgeStatus::Disconnected);

        let mut unavailable_failures = 0;
        let mut saw_disconnected = false;
        while let Ok(msg) = term_rx.try_recv() {
            match msg["type"].as_str().unwrap() {
                "command:result" => {
                    assert_eq!(msg["code"], "BRIDGE_UNAVAILABLE");
                    unavailable_failures += 1;
                }
                "bridge:status" => saw_disconnected = msg["status"] == "disconnected",
                other => panic!("unexpected event {other}"),
            }
        }
        assert_eq!(unavailable_failures, 1, "exactly one failure per command");
        assert!(saw_disconnected);

        // A second sweep finds nothing
        assert!(registry.sweep().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_keeps_connection_alive() {
        let terminals = TerminalRegistry::new();
        let registry = registry(&terminals);
        let (handle, _rx) = handle_for(&registry, &terminals, "user-1");
        registry.put(handle.clone()).await;

        tokio::time::advance(Duration::from_secs(45)).await;
        registry.record_heartbeat(&handle.connection_id).await;
        tokio::time::advance(Duration::from_secs(45)).await;
        assert!(registry.sweep().await.is_empty(), "heartbeat reset the clock");
    }

    #[tokio::test]
    async fn test_heartbeat_unknown_connection_is_noop() {
        let terminals = TerminalRegistry::new();
        let registry = registry(&terminals);
        registry.record_heartbeat("no-such-connection").await;
    }

    #[tokio::test]
    async fn test_explicit_disconnect() {
        let terminals = TerminalRegistry::new();
        let registry = registry(&terminals);
        let (handle, _rx) = handle_for(&registry, &terminals, "user-1");
        registry.put(handle.clone()).await;

        assert!(registry.disconnect("user-1").await);
        assert!(registry.get("user-1").await.is_none());
        assert_eq!(handle.status().await, BridgeStatus::Disconnected);
        assert!(!registry.disconnect("user-1").await);
    }

    #[tokio::test]
    async fn test_remove_if_current_skips_replaced_connection() {
        let terminals = TerminalRegistry::new();
        let registry = registry(&terminals);

        let (old, _old_rx) = handle_for(&registry, &terminals, "user-1");
        registry.put(old.clone()).await;
        let (new, _new_rx) = handle_for(&registry, &terminals, "user-1");
        registry.put(new.clone()).await;

        // The replaced handler's teardown must not remove the replacement
        registry.remove_if_current(&old.connection_id).await;
        assert!(registry.get("user-1").await.is_some());

        registry.remove_if_current(&new.connection_id).await;
        assert!(registry.get("user-1").await.is_none());
    }

    #[tokio::test]
    async fn test_status_json() {
        let terminals = TerminalRegistry::new();
        let registry = registry(&terminals);
        assert_eq!(registry.status_json("user-1").await["status"], "disconnected");

        let (handle, _rx) = handle_for(&registry, &terminals, "user-1");
        registry.put(handle).await;
        let status = registry.status_json("user-1").await;
        assert_eq!(status["status"], "connected");
        assert_eq!(status["capacity"], 5);
        assert_eq!(status["queue_depth"], 0);
    }
}
