//! Session lifecycle and cross-tab coordination
//!
//! One logical session per project spans every open tab. Tabs converge by
//! broadcasting new session ids and adopting any id fresher than their own;
//! there is no lock and no leader.

pub mod channel;
pub mod lifecycle;

pub use channel::{ChannelPort, CrossTabChannel, LocalBroadcastHub};
pub use lifecycle::{generate_session_id, session_created_at, SessionLifecycle, SessionPhase};

/// Broadcasts older than this are ignored
pub const BROADCAST_FRESHNESS_MS: i64 = 5_000;
