// SPDX-License-Identifier: MIT OR Apache-2.0
//! The approval token store: a process-wide, concurrent map from opaque
//! token to the set of high-impact operations it authorizes.
//!
//! Tokens are minted at the end of a plan run that recorded at least one
//! command-classified operation, and are single-use and time-bounded. A
//! lightweight background reaper removes expired entries so the store does
//! not grow without bound under abandoned plans, mirroring the
//! cancellation-token/notify idiom used elsewhere in this workspace for
//! background signaling.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// One operation recorded at plan time, to be authorized by the resulting
/// approval token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedOperation {
    /// Method name.
    pub method: String,
    /// Arguments the call was made with.
    pub args: serde_json::Value,
}

#[derive(Debug, Clone)]
struct ApprovalRecord {
    operations: Vec<PlannedOperation>,
    expires_at: Instant,
}

/// Reason a presented token was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalError {
    /// No record exists for the token (never minted, already consumed, or
    /// already reaped).
    NotFound,
    /// A record exists but its `expires_at` has passed.
    Expired,
}

impl std::fmt::Display for ApprovalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound => f.write_str("approval token not found"),
            Self::Expired => f.write_str("approval token expired"),
        }
    }
}

/// Process-wide store of minted approval tokens.
///
/// Clone is cheap: it shares the same underlying map and reaper task.
#[derive(Clone)]
pub struct ApprovalTokenStore {
    inner: Arc<Mutex<HashMap<Uuid, ApprovalRecord>>>,
}

/// How often the background reaper sweeps for expired tokens.
const REAP_INTERVAL: Duration = Duration::from_secs(5);

impl ApprovalTokenStore {
    /// Construct an empty store and spawn its background reaper task.
    ///
    /// Requires a running Tokio runtime (the reaper is spawned with
    /// [`tokio::spawn`]).
    #[must_use]
    pub fn new() -> Self {
        let inner = Arc::new(Mutex::new(HashMap::new()));
        let reaper_inner = Arc::clone(&inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(REAP_INTERVAL);
            loop {
                ticker.tick().await;
                let now = Instant::now();
                let mut map = reaper_inner.lock().unwrap();
                let before = map.len();
                map.retain(|_, record| record.expires_at > now);
                let reaped = before - map.len();
                if reaped > 0 {
                    tracing::debug!(reaped, "approval token reaper swept expired tokens");
                }
            }
        });
        Self { inner }
    }

    /// Mint a new token authorizing `operations`, expiring after `ttl`.
    #[must_use]
    pub fn put(&self, operations: Vec<PlannedOperation>, ttl: Duration) -> Uuid {
        let token = Uuid::new_v4();
        let record = ApprovalRecord {
            operations,
            expires_at: Instant::now() + ttl,
        };
        self.inner.lock().unwrap().insert(token, record);
        tracing::info!(%token, ttl_secs = ttl.as_secs(), "approval token minted");
        token
    }

    /// Validate `token` without consuming it.
    ///
    /// A script may invoke several command-classified methods within the
    /// same apply run, all authorized by the same token, so validation is
    /// non-consuming; the controller calls [`Self::delete`] once at the end
    /// of a successful apply run.
    pub fn validate(&self, token: &Uuid) -> Result<Vec<PlannedOperation>, ApprovalError> {
        let mut map = self.inner.lock().unwrap();
        match map.get(token) {
            None => Err(ApprovalError::NotFound),
            Some(record) if record.expires_at <= Instant::now() => {
                map.remove(token);
                Err(ApprovalError::Expired)
            }
            Some(record) => Ok(record.operations.clone()),
        }
    }

    /// Remove `token` unconditionally (single-use consumption after a
    /// successful apply run).
    pub fn delete(&self, token: &Uuid) {
        if self.inner.lock().unwrap().remove(token).is_some() {
            tracing::info!(%token, "approval token consumed");
        }
    }

    /// Number of tokens currently stored (including not-yet-reaped expired
    /// ones). Exposed for tests and diagnostics.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    /// `true` if no tokens are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ApprovalTokenStore {
    fn default() -> Self {
        Self::new()
    }
}
