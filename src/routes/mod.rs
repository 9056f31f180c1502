//! IDE-facing REST route handlers.
//!
//! - `health` — unauthenticated liveness probe
//! - `pairing` — pairing-code issuance
//! - `bridge` — bridge status and explicit disconnect

pub mod bridge;
pub mod health;
pub mod pairing;
