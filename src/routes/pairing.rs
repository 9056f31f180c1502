//! Pairing-code issuance endpoint.

use axum::{extract::State, http::HeaderMap, http::StatusCode, Json};
use serde_json::{json, Value};

use crate::auth::verified_user;
use crate::error::PairingError;
use crate::AppState;

/// `POST /api/pairing/code` — issue a pairing code for the authenticated user.
///
/// The user types the code into their local agent within the expiry window.
/// Returns `429 Too Many Requests` when the per-user rate limit is hit.
pub async fn create_code(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let user_id = verified_user(&headers)?;

    match state.pairing.generate_code(&user_id).await {
        Ok((code, expiry)) => Ok(Json(json!({
            "code": code,
            "expires_in_ms": expiry.as_millis() as u64,
        }))),
        Err(err) => {
            let status = if err == PairingError::RateLimited {
                StatusCode::TOO_MANY_REQUESTS
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            Err((
                status,
                Json(json!({"error": err.message(), "code": err.code()})),
            ))
        }
    }
}
