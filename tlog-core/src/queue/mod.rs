//! Event queue engine
//!
//! Admission pipeline for every draft handed to `track()`:
//!
//! ```text
//! draft ─► type check ─► session? ──no──► pending buffer (replayed later)
//!                          │yes
//!                          ▼
//!   session_start guard ─► global rate ─► per-name rate ─► session caps
//!   ─► sampling ─► stamp ─► dedup ─► queue (max 100) ─► flush at 50 / every 10s
//! ```
//!
//! `session_start` and `session_end` skip rate limits, caps and sampling so a
//! loaded page can never lose its session boundaries.

mod dedup;
mod engine;
mod limits;

pub use dedup::{fingerprint, DedupCache};
pub use engine::EventQueue;
pub use limits::{GlobalRateLimiter, PerNameLimiter, SessionCaps};

/// Maximum queued events before the oldest non-boundary event is evicted
pub const MAX_QUEUE_LENGTH: usize = 100;

/// Queue length that triggers an immediate flush
pub const BATCH_SIZE_THRESHOLD: usize = 50;

/// Background flush period
pub const FLUSH_INTERVAL_MS: u64 = 10_000;

/// Drafts held while no session exists
pub const MAX_PENDING_EVENTS: usize = 100;

/// Global fixed window
pub const GLOBAL_RATE_WINDOW_MS: i64 = 1_000;
pub const GLOBAL_RATE_LIMIT: usize = 50;

/// Sliding window for same-name custom events
pub const PER_NAME_WINDOW_MS: i64 = 60_000;

/// All events of one session, boundary events excluded
pub const MAX_EVENTS_PER_SESSION: usize = 1_000;

/// Same fingerprint within this window is a duplicate
pub const DEDUP_WINDOW_MS: i64 = 500;

/// Above this many entries, stale fingerprints are pruned
pub const DEDUP_CACHE_PRUNE_AT: usize = 1_000;

/// Age at which a fingerprint is stale during pruning
pub const DEDUP_CACHE_PRUNE_AGE_MS: i64 = 5_000;

/// Above this many entries the cache is cleared outright
pub const DEDUP_CACHE_HARD_LIMIT: usize = 2_000;

/// Custom event name length limit
pub const MAX_CUSTOM_EVENT_NAME_LENGTH: usize = 120;

/// Serialized custom event metadata limit
pub const MAX_CUSTOM_EVENT_METADATA_BYTES: usize = 8 * 1024;
