//! Pairing-code issuance and consumption.
//!
//! A pairing code is a short-lived, single-use secret that binds one local
//! agent instance to one authenticated user. The IDE requests a code on the
//! user's behalf; the user types it into the local agent, which submits it as
//! the first frame of its WebSocket connection.
//!
//! Lifecycle: `unconsumed → consumed`, exactly once. Consumption after the
//! expiry window is rejected even if the code was never used. Expired and
//! consumed requests are pruned by [`PairingService::sweep`], which runs on
//! the same periodic schedule as the bridge heartbeat sweep.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::OsRng;
use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::PairingError;

/// Window over which per-user issuance is rate limited.
const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);

/// A stored pairing request awaiting consumption or expiry.
#[derive(Debug, Clone)]
pub struct PairingRequest {
    pub code: String,
    pub user_id: String,
    pub issued_at: Instant,
    pub expires_at: Instant,
    pub consumed_at: Option<Instant>,
}

/// Issues and validates pairing codes.
///
/// Cloneable — all clones share the same inner state.
#[derive(Clone)]
pub struct PairingService {
    inner: Arc<Mutex<PairingInner>>,
    code_length: usize,
    expiry: Duration,
    max_codes_per_minute: usize,
}

struct PairingInner {
    /// Outstanding requests keyed by code.
    codes: HashMap<String, PairingRequest>,
    /// Recent issuance timestamps per user, for rate limiting.
    recent: HashMap<String, VecDeque<Instant>>,
}

impl PairingService {
    #[must_use]
    pub fn new(code_length: usize, expiry: Duration, max_codes_per_minute: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(PairingInner {
                codes: HashMap::new(),
                recent: HashMap::new(),
            })),
            code_length,
            expiry,
            max_codes_per_minute,
        }
    }

    /// Issue a fresh pairing code for `user_id`.
    ///
    /// Returns the code and its validity window. Fails with
    /// [`PairingError::RateLimited`] when the user has requested more than
    /// the configured number of codes in the last minute.
    pub async fn generate_code(&self, user_id: &str) -> Result<(String, Duration), PairingError> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;

        let recent = inner.recent.entry(user_id.to_string()).or_default();
        while recent
            .front()
            .is_some_and(|t| now.duration_since(*t) > RATE_LIMIT_WINDOW)
        {
            recent.pop_front();
        }
        if recent.len() >= self.max_codes_per_minute {
            return Err(PairingError::RateLimited);
        }
        recent.push_back(now);

        // Regenerate on the (unlikely) collision with an outstanding code.
        let code = loop {
            let candidate = random_code(self.code_length);
            if !inner.codes.contains_key(&candidate) {
                break candidate;
            }
        };

        inner.codes.insert(
            code.clone(),
            PairingRequest {
                code: code.clone(),
                user_id: user_id.to_string(),
                issued_at: now,
                expires_at: now + self.expiry,
                consumed_at: None,
            },
        );

        info!(user_id, "Issued pairing code");
        Ok((code, self.expiry))
    }

    /// Consume a pairing code, returning the `user_id` it was bound to.
    ///
    /// A code is consumable exactly once and only within its expiry window.
    pub async fn consume_code(&self, code: &str) -> Result<String, PairingError> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;

        let request = inner.codes.get_mut(code).ok_or(PairingError::InvalidCode)?;
        if request.consumed_at.is_some() {
            return Err(PairingError::AlreadyUsed);
        }
        if now >= request.expires_at {
            return Err(PairingError::ExpiredCode);
        }

        request.consumed_at = Some(now);
        let user_id = request.user_id.clone();
        info!(user_id, "Pairing code consumed");
        Ok(user_id)
    }

    /// Prune requests whose expiry window has passed (consumed or not) and
    /// stale rate-limit bookkeeping. Returns the number of codes removed.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;

        let before = inner.codes.len();
        inner.codes.retain(|_, req| now < req.expires_at);
        let removed = before - inner.codes.len();

        inner.recent.retain(|_, stamps| {
            while stamps
                .front()
                .is_some_and(|t| now.duration_since(*t) > RATE_LIMIT_WINDOW)
            {
                stamps.pop_front();
            }
            !stamps.is_empty()
        });

        if removed > 0 {
            debug!(removed, "Pruned expired pairing codes");
        }
        removed
    }

    /// Number of outstanding (unexpired) requests. Test and status helper.
    pub async fn outstanding(&self) -> usize {
        self.inner.lock().await.codes.len()
    }
}

/// Generate a cryptographically random decimal code of `length` digits.
fn random_code(length: usize) -> String {
    let mut rng = OsRng;
    (0..length).map(|_| char::from(b'0' + rng.gen_range(0..10))).collect()
}
