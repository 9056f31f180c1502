//! Local-agent WebSocket endpoint.
//!
//! The agent authenticates by consuming a pairing code in its first frame —
//! there is no other credential on this endpoint. On success the handler
//! creates the connection's queue and registry entry, then settles into a
//! read loop ingesting heartbeats, output chunks, and completions until the
//! socket closes or the registry signals shutdown (eviction or replacement).

use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{info, info_span, warn, Instrument};

use crate::bridge::{BridgeHandle, CommandQueue};
use crate::AppState;

/// How long the agent gets to present its pairing code after connecting.
const PAIRING_DEADLINE: Duration = Duration::from_secs(10);

/// Capacity of the agent's outbound message channel.
const AGENT_CHANNEL_CAPACITY: usize = 256;

/// `GET /api/agent/ws` — agent WebSocket upgrade.
///
/// No token check here: the single-use pairing code presented in the first
/// frame is the authentication.
pub async fn agent_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_agent_ws(socket, state))
}

async fn handle_agent_ws(socket: WebSocket, state: AppState) {
    let (mut ws_sink, mut ws_stream) = socket.split();

    // First frame must be pairing:request{code} within the deadline.
    let first = tokio::time::timeout(PAIRING_DEADLINE, ws_stream.next()).await;
    let Ok(Some(Ok(Message::Text(text)))) = first else {
        warn!("Agent disconnected or stalled before pairing");
        return;
    };
    let Ok(request) = serde_json::from_str::<Value>(&text) else {
        warn!("Agent sent invalid pairing frame");
        return;
    };
    if request["type"].as_str() != Some("pairing:request") {
        warn!(
            msg_type = request["type"].as_str().unwrap_or(""),
            "Agent's first frame was not pairing:request"
        );
        return;
    }

    let code = request["code"].as_str().unwrap_or("");
    let user_id = match state.pairing.consume_code(code).await {
        Ok(user_id) => user_id,
        Err(err) => {
            info!(code = err.code(), "Pairing rejected");
            let result = json!({
                "type": "pairing:result",
                "ok": false,
                "code": err.code(),
                "message": err.message(),
            });
            let _ = ws_sink
                .send(Message::Text(
                    serde_json::to_string(&result).expect("Value serializes").into(),
                ))
                .await;
            return;
        }
    };

    let connection_id = uuid::Uuid::new_v4().to_string();
    let span = info_span!("bridge_agent", user_id = %user_id, connection_id = %connection_id);
    run_connection(ws_sink, ws_stream, state, user_id.clone(), connection_id)
        .instrument(span)
        .await;
}

/// Post-pairing connection lifetime: registry entry, send task, read loop,
/// teardown.
async fn run_connection(
    mut ws_sink: futures::stream::SplitSink<WebSocket, Message>,
    mut ws_stream: futures::stream::SplitStream<WebSocket>,
    state: AppState,
    user_id: String,
    connection_id: String,
) {
    let bridge_config = &state.config.bridge;
    let (agent_tx, agent_rx) = mpsc::channel::<Value>(AGENT_CHANNEL_CAPACITY);
    let queue = CommandQueue::new(
        &connection_id,
        bridge_config.max_commands_per_bridge,
        bridge_config.max_queue_depth,
        Duration::from_millis(bridge_config.command_timeout_ms),
        agent_tx.clone(),
        state.terminals.clone(),
    );
    let handle = BridgeHandle::new(
        &connection_id,
        &user_id,
        agent_tx,
        queue.clone(),
        state.bridges.now_ms(),
    );
    let mut shutdown_rx = handle.shutdown_tx.subscribe();

    // put() applies the single-active policy (evicts any prior bridge)
    state.bridges.put(handle).await;

    let ack = json!({
        "type": "pairing:result",
        "ok": true,
        "connection_id": connection_id,
    });
    let _ = ws_sink
        .send(Message::Text(
            serde_json::to_string(&ack).expect("Value serializes").into(),
        ))
        .await;

    let send_task = crate::ws::spawn_sender(ws_sink, agent_rx);

    loop {
        let msg = tokio::select! {
            msg = ws_stream.next() => {
                let Some(Ok(msg)) = msg else { break };
                msg
            }
            _ = shutdown_rx.changed() => {
                info!("Agent handler shutting down (retired by registry)");
                break;
            }
        };
        match msg {
            Message::Text(text) => {
                let Ok(parsed) = serde_json::from_str::<Value>(&text) else {
                    continue;
                };
                match parsed["type"].as_str().unwrap_or("") {
                    "bridge:heartbeat" => {
                        state.bridges.record_heartbeat(&connection_id).await;
                    }
                    "command:output" => {
                        let command_id = parsed["command_id"].as_str().unwrap_or("");
                        let chunk = parsed["chunk"].as_str().unwrap_or("");
                        let stream = parsed["stream"].as_str().unwrap_or("stdout");
                        queue.deliver_output(command_id, chunk, stream).await;
                    }
                    "command:complete" => {
                        let command_id = parsed["command_id"].as_str().unwrap_or("");
                        let exit_code = parsed["exit_code"]
                            .as_i64()
                            .and_then(|v| i32::try_from(v).ok())
                            .unwrap_or(-1);
                        queue.complete(command_id, exit_code).await;
                    }
                    "bridge:disconnect" => {
                        info!("Agent requested disconnect");
                        break;
                    }
                    other => {
                        warn!(msg_type = other, "Unknown message from agent");
                    }
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    // No-op when this handler lost to a replacement — the new connection
    // must survive the old handler's teardown.
    state.bridges.remove_if_current(&connection_id).await;
    send_task.abort();
}
