//! Terminal WebSocket endpoint.
//!
//! One socket per browser terminal session. Inbound frames carry input
//! lines; the interceptor classifies each line exactly once and either
//! enqueues it on the user's bridge, synthesizes a "bridge not connected"
//! notice, or returns a passthrough directive for the local-shell mechanism.
//! Outbound frames (command output/results, bridge status events) arrive via
//! the terminal registry channel so their ordering matches the dispatcher's
//! state transitions.
//!
//! Closing the socket cancels the session's queued commands and abandons its
//! in-flight ones.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, info_span, Instrument};

use crate::error::ConnectionError;
use crate::terminal::interceptor::Classification;
use crate::AppState;

/// Query parameters for the terminal WebSocket upgrade.
#[derive(Deserialize)]
pub struct TerminalWsQuery {
    /// API key passed as a query parameter (browsers can't set headers on
    /// WebSocket upgrades).
    pub token: String,
    /// Verified user id, injected by the authentication collaborator when it
    /// rewrites the upgrade URL.
    pub user: String,
    /// Terminal session id; generated when absent.
    pub session: Option<String>,
}

/// `GET /api/terminal/ws?token=<key>&user=<id>&session=<id>` — terminal
/// WebSocket upgrade. Returns `403 Forbidden` on auth failure.
pub async fn terminal_ws(
    State(state): State<AppState>,
    Query(query): Query<TerminalWsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    if !crate::auth::constant_time_eq(
        state.config.auth.api_key.as_bytes(),
        query.token.as_bytes(),
    ) {
        return (StatusCode::FORBIDDEN, "Forbidden").into_response();
    }

    let user_id = query.user;
    let session_id = query
        .session
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    ws.on_upgrade(move |socket| {
        let span = info_span!("terminal", user_id = %user_id, session_id = %session_id);
        handle_terminal_ws(socket, state, user_id, session_id).instrument(span)
    })
}

async fn handle_terminal_ws(
    socket: WebSocket,
    state: AppState,
    user_id: String,
    session_id: String,
) {
    let (ws_sink, mut ws_stream) = socket.split();
    let events_rx = state.terminals.register(&session_id, &user_id).await;
    let send_task = crate::ws::spawn_sender(ws_sink, events_rx);
    info!("Terminal connected");

    state
        .terminals
        .send_to_session(
            &session_id,
            json!({
                "type": "terminal:ready",
                "session_id": session_id,
                "bridge": state.bridges.status_json(&user_id).await,
            }),
        )
        .await;

    while let Some(Ok(msg)) = ws_stream.next().await {
        match msg {
            Message::Text(text) => {
                let Ok(parsed) = serde_json::from_str::<Value>(&text) else {
                    continue;
                };
                if parsed["type"].as_str() == Some("terminal:input") {
                    let line = parsed["data"].as_str().unwrap_or("");
                    process_input_line(&state, &user_id, &session_id, line).await;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    // Session closed: queued commands are cancelled without dispatch;
    // dispatched ones are abandoned (output dropped, timeout still reaps).
    state.terminals.unregister(&session_id).await;
    if let Some(handle) = state.bridges.get(&user_id).await {
        handle.queue.cancel_session(&session_id).await;
    }
    info!("Terminal disconnected");
    send_task.abort();
}

/// Classify one input line and perform the single enqueue-or-reject action.
///
/// Routed lines never reach a local shell — when no bridge is connected the
/// terminal gets an explanatory notice instead of a shell "command not
/// found".
async fn process_input_line(state: &AppState, user_id: &str, session_id: &str, line: &str) {
    match state.interceptor.classify(line) {
        Classification::Passthrough => {
            state
                .terminals
                .send_to_session(
                    session_id,
                    json!({"type": "terminal:passthrough", "data": line}),
                )
                .await;
        }
        Classification::Routed => {
            let Some(handle) = state.bridges.get(user_id).await else {
                let err = ConnectionError::NoBridgeConnected;
                state
                    .terminals
                    .send_to_session(
                        session_id,
                        json!({
                            "type": "terminal:notice",
                            "code": err.code(),
                            "message": err.message(),
                        }),
                    )
                    .await;
                return;
            };
            match handle.queue.enqueue(session_id, line).await {
                Ok(command_id) => {
                    state
                        .terminals
                        .send_to_session(
                            session_id,
                            json!({"type": "command:queued", "command_id": command_id}),
                        )
                        .await;
                }
                Err(reject) => {
                    state
                        .terminals
                        .send_to_session(
                            session_id,
                            json!({
                                "type": "terminal:notice",
                                "code": reject.code(),
                                "message": reject.message(),
                            }),
                        )
                        .await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{BridgeHandle, CommandQueue};
    use crate::config::Config;
    use crate::AppState;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn test_state() -> AppState {
        AppState::new(Config::default())
    }

    /// Pair a fake agent for `user_id`, returning the dispatch-side receiver.
    async fn connect_bridge(state: &AppState, user_id: &str) -> mpsc::Receiver<Value> {
        let (agent_tx, agent_rx) = mpsc::channel(64);
        let connection_id = uuid::Uuid::new_v4().to_string();
        let queue = CommandQueue::new(
            &connection_id,
            state.config.bridge.max_commands_per_bridge,
            state.config.bridge.max_queue_depth,
            Duration::from_millis(state.config.bridge.command_timeout_ms),
            agent_tx.clone(),
            state.terminals.clone(),
        );
        let handle = BridgeHandle::new(
            &connection_id,
            user_id,
            agent_tx,
            queue,
            state.bridges.now_ms(),
        );
        state.bridges.put(handle).await;
        agent_rx
    }

    #[tokio::test]
    async fn test_routed_without_bridge_synthesizes_notice() {
        let state = test_state();
        let mut term_rx = state.terminals.register("t1", "user-1").await;

        process_input_line(&state, "user-1", "t1", "claude hello").await;

        let msg = term_rx.recv().await.unwrap();
        assert_eq!(msg["type"], "terminal:notice");
        assert_eq!(msg["code"], "NO_BRIDGE_CONNECTED");
        // Nothing reaches a local shell
        assert!(term_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unrouted_passes_through_unchanged() {
        let state = test_state();
        let mut term_rx = state.terminals.register("t1", "user-1").await;

        process_input_line(&state, "user-1", "t1", "ls -la /tmp").await;

        let msg = term_rx.recv().await.unwrap();
        assert_eq!(msg["type"], "terminal:passthrough");
        assert_eq!(msg["data"], "ls -la /tmp");
        assert!(term_rx.try_recv().is_err(), "processed exactly once");
    }

    #[tokio::test]
    async fn test_routed_with_bridge_enqueues_and_never_passes_through() {
        let state = test_state();
        let mut term_rx = state.terminals.register("t1", "user-1").await;
        let mut agent_rx = connect_bridge(&state, "user-1").await;
        let _ = term_rx.recv().await; // bridge:status connected

        process_input_line(&state, "user-1", "t1", "claude hello").await;

        let ack = term_rx.recv().await.unwrap();
        assert_eq!(ack["type"], "command:queued");
        let dispatch = agent_rx.recv().await.unwrap();
        assert_eq!(dispatch["type"], "command:dispatch");
        assert_eq!(dispatch["raw_input"], "claude hello");
        assert!(term_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_queue_full_notice() {
        let mut config = Config::default();
        config.bridge.max_commands_per_bridge = 1;
        config.bridge.max_queue_depth = 1;
        let state = AppState::new(config);
        let mut term_rx = state.terminals.register("t1", "user-1").await;
        let _agent_rx = connect_bridge(&state, "user-1").await;
        let _ = term_rx.recv().await; // bridge:status connected

        process_input_line(&state, "user-1", "t1", "claude a").await; // dispatched
        process_input_line(&state, "user-1", "t1", "claude b").await; // queued
        process_input_line(&state, "user-1", "t1", "claude c").await; // rejected

        let _ = term_rx.recv().await.unwrap(); // queued ack a
        let _ = term_rx.recv().await.unwrap(); // queued ack b
        let notice = term_rx.recv().await.unwrap();
        assert_eq!(notice["type"], "terminal:notice");
        assert_eq!(notice["code"], "QUEUE_FULL");
    }
}
