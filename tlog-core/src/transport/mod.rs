//! Delivery of event batches to the collection endpoint
//!
//! ## Architecture
//!
//! - [`Transport`] is the network seam: one async send for normal operation,
//!   one fire-and-forget beacon for teardown. [`HttpTransport`] implements it
//!   with reqwest.
//! - [`DeliveryUnit`] sits on top: it classifies failures, persists batches
//!   that failed transiently, and recovers them on the next start.
//!
//! Failure classes:
//! - **Permanent** (HTTP 4xx): logged at most once per status per minute,
//!   batch discarded, never retried
//! - **Transient** (network, timeout, 5xx): batch persisted under
//!   `tlog:{project}:queue` and resent by [`DeliveryUnit::recover_persisted_events`]

mod client;
mod delivery;

pub use client::HttpTransport;
pub use delivery::{DeliveryStats, DeliveryUnit, RecoveryOutcome};

use async_trait::async_trait;

/// Request timeout for async sends
pub const SEND_TIMEOUT_SECS: u64 = 10;

/// Largest body a beacon may carry (64 KiB)
pub const BEACON_MAX_BYTES: usize = 64 * 1024;

/// Maximum age of a persisted payload that is still resent (2 hours)
pub const RECOVERY_WINDOW_MS: i64 = 2 * 60 * 60 * 1000;

/// A persisted payload younger than this was just written by another tab
pub const PERSIST_RACE_WINDOW_MS: i64 = 1_000;

/// Repeated permanent failures with the same status are logged once per window
pub const PERMANENT_ERROR_LOG_THROTTLE_MS: i64 = 60_000;

/// Result of one delivery attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered,
    /// Client error; resending cannot succeed
    PermanentFailure { status: u16 },
    /// Network error, timeout or server error; worth persisting
    TransientFailure { reason: String },
}

impl SendOutcome {
    /// Classify an HTTP status code
    pub fn from_status(status: u16) -> Self {
        match status {
            200..=299 => SendOutcome::Delivered,
            400..=499 => SendOutcome::PermanentFailure { status },
            _ => SendOutcome::TransientFailure {
                reason: format!("HTTP {}", status),
            },
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, SendOutcome::TransientFailure { .. })
    }
}

/// Network seam for batch delivery
#[async_trait]
pub trait Transport: Send + Sync {
    /// POST `body` (JSON) and classify the result. Must give up after
    /// [`SEND_TIMEOUT_SECS`].
    async fn send(&self, body: String) -> SendOutcome;

    /// Queue `body` for delivery without waiting. Returns whether the
    /// platform accepted it; never blocks on the network.
    fn send_beacon(&self, body: String) -> bool;
}
