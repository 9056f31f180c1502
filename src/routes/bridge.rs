//! Bridge status and explicit-disconnect endpoints.

use axum::{extract::State, http::HeaderMap, http::StatusCode, Json};
use serde_json::{json, Value};

use crate::auth::verified_user;
use crate::error::ConnectionError;
use crate::AppState;

/// `GET /api/bridge/status` — current bridge state for the authenticated user.
///
/// Returns `connected` with capacity, active count, queue depth, and
/// heartbeat age, or plain `disconnected`.
pub async fn status(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let user_id = verified_user(&headers)?;
    Ok(Json(state.bridges.status_json(&user_id).await))
}

/// `DELETE /api/bridge` — explicitly disconnect the user's bridge.
///
/// Outstanding commands fail with `BRIDGE_DISCONNECTED` and the agent socket
/// is closed. Returns `404 Not Found` when no bridge is connected.
pub async fn disconnect(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let user_id = verified_user(&headers)?;
    if state.bridges.disconnect(&user_id).await {
        Ok(Json(json!({"disconnected": true})))
    } else {
        let err = ConnectionError::NoBridgeConnected;
        Err((
            StatusCode::NOT_FOUND,
            Json(json!({"error": err.message(), "code": err.code()})),
        ))
    }
}
