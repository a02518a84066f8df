//! Reconnection policy.
//!
//! Recovers from transient peer-connection failures without caller
//! involvement: exponential backoff with jitter, a fixed attempt ceiling,
//! and per-peer failure tracking. Once the ceiling is reached the peer is
//! left permanently failed and the caller is responsible for surfacing it.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::signaling::PeerId;

/// Maximum reconnection attempts before giving up on a peer.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Initial delay before the first retry (milliseconds).
pub const DEFAULT_INITIAL_DELAY_MS: u64 = 1_000;

/// Cap on the backoff delay (milliseconds).
pub const DEFAULT_MAX_DELAY_MS: u64 = 15_000;

/// Configuration for retry behavior with exponential backoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 = never retry).
    pub max_attempts: u32,
    /// Initial delay between retries in milliseconds.
    pub initial_delay_ms: u64,
    /// Maximum delay between retries in milliseconds.
    pub max_delay_ms: u64,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Jitter factor to randomize delays (0.0 to 1.0).
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_delay_ms: DEFAULT_INITIAL_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            backoff_multiplier: 2.0,
            jitter_factor: 0.2,
        }
    }
}

impl RetryConfig {
    /// Calculate delay for a given attempt number (0-indexed).
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let base_delay =
            self.initial_delay_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        let capped_delay = base_delay.min(self.max_delay_ms as f64);

        let jitter_range = capped_delay * self.jitter_factor;
        let jitter = if jitter_range > 0.0 {
            (rand::random::<f64>() * 2.0 - 1.0) * jitter_range
        } else {
            0.0
        };

        let final_delay = (capped_delay + jitter).max(0.0) as u64;
        Duration::from_millis(final_delay)
    }

    /// Check if we should retry given the current attempt count.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Per-peer failure tracking.
#[derive(Debug, Clone, Default)]
struct RetryTracker {
    consecutive_failures: u32,
    total_attempts: u32,
    last_error: Option<String>,
}

/// Snapshot of one peer's retry history.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryStats {
    pub consecutive_failures: u32,
    pub total_attempts: u32,
    pub last_error: Option<String>,
}

/// Outcome of recording a connection failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the given backoff delay; `attempt` is 1-based.
    Retry { attempt: u32, delay: Duration },
    /// Ceiling reached; the peer stays failed until the caller re-initiates.
    GiveUp { attempts: u32, last_error: String },
}

/// Tracks failures per peer and decides whether and when to reconnect.
pub struct ReconnectSupervisor {
    config: RetryConfig,
    trackers: Mutex<HashMap<PeerId, RetryTracker>>,
}

impl ReconnectSupervisor {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            trackers: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Record a failure for a peer and decide the next step.
    pub async fn on_failure(&self, peer_id: &str, error: &str) -> RetryDecision {
        let mut trackers = self.trackers.lock().await;
        let tracker = trackers.entry(peer_id.to_string()).or_default();
        tracker.consecutive_failures += 1;
        tracker.total_attempts += 1;
        tracker.last_error = Some(error.to_string());

        let failures = tracker.consecutive_failures;
        if self.config.should_retry(failures) {
            let delay = self.config.calculate_delay(failures - 1);
            debug!(
                "connection to {} failed (attempt {}), retrying in {:?}: {}",
                peer_id, failures, delay, error
            );
            RetryDecision::Retry {
                attempt: failures,
                delay,
            }
        } else {
            warn!(
                "connection to {} permanently failed after {} attempts: {}",
                peer_id, failures, error
            );
            RetryDecision::GiveUp {
                attempts: failures,
                last_error: error.to_string(),
            }
        }
    }

    /// Reset a peer's failure count after a successful connection.
    pub async fn on_connected(&self, peer_id: &str) {
        let mut trackers = self.trackers.lock().await;
        if let Some(tracker) = trackers.get_mut(peer_id) {
            tracker.consecutive_failures = 0;
            tracker.last_error = None;
        }
    }

    /// Drop tracking for a peer (explicit teardown).
    pub async fn forget(&self, peer_id: &str) {
        self.trackers.lock().await.remove(peer_id);
    }

    pub async fn clear(&self) {
        self.trackers.lock().await.clear();
    }

    /// Consecutive failure count for a peer, for observability.
    pub async fn failures(&self, peer_id: &str) -> u32 {
        self.trackers
            .lock()
            .await
            .get(peer_id)
            .map(|t| t.consecutive_failures)
            .unwrap_or(0)
    }

    /// Retry history for a peer, for observability.
    pub async fn stats(&self, peer_id: &str) -> Option<RetryStats> {
        self.trackers.lock().await.get(peer_id).map(|t| RetryStats {
            consecutive_failures: t.consecutive_failures,
            total_attempts: t.total_attempts,
            last_error: t.last_error.clone(),
        })
    }
}
