//! WebSocket transports for the bridge.
//!
//! Two endpoints share this protocol family; all messages are JSON objects
//! with a `"type"` field.
//!
//! ## Agent endpoint (`GET /api/agent/ws`)
//!
//! | Direction | Type                | Fields                              |
//! |-----------|---------------------|-------------------------------------|
//! | agent →   | `pairing:request`   | `code` (must be the first frame)    |
//! | ← agent   | `pairing:result`    | `ok`, `connection_id` or `code`+`message` |
//! | agent →   | `bridge:heartbeat`  | —                                   |
//! | ← agent   | `command:dispatch`  | `command_id`, `raw_input`           |
//! | agent →   | `command:output`    | `command_id`, `chunk`, `stream`     |
//! | agent →   | `command:complete`  | `command_id`, `exit_code`           |
//! | both      | `bridge:disconnect` | `reason?`                           |
//!
//! ## Terminal endpoint (`GET /api/terminal/ws?token=&user=&session=`)
//!
//! | Direction | Type                   | Fields                           |
//! |-----------|------------------------|----------------------------------|
//! | term →    | `terminal:input`       | `data` (one line)                |
//! | ← term    | `terminal:ready`       | `session_id`, `bridge`           |
//! | ← term    | `terminal:passthrough` | `data` (run in the local shell)  |
//! | ← term    | `terminal:notice`      | `code`, `message`                |
//! | ← term    | `command:queued`       | `command_id`                     |
//! | ← term    | `command:output`       | `command_id`, `chunk`, `stream`  |
//! | ← term    | `command:result`       | `command_id`, `status`, `exit_code?`, `code?`, `message?` |
//! | ← term    | `bridge:status`        | `status`, `reason?`              |

pub mod agent;
pub mod terminal;

use axum::extract::ws::{Message, WebSocket};
use futures::stream::SplitSink;
use futures::SinkExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Forward messages from an mpsc receiver to a WS sink until either side
/// closes. Both endpoints use this as their send task.
pub(crate) fn spawn_sender(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Value>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let text = serde_json::to_string(&msg).expect("Value serializes");
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    })
}
