//! # tlog-core
//!
//! Event delivery and session coordination engine for tlog.
//!
//! This library provides:
//! - An event queue with deduplication, sampling, rate limits and batching
//! - Batch delivery with persistence and recovery across restarts
//! - A logical session shared by every tab of a project
//! - Storage areas with in-memory fallback and quota cleanup
//! - Configuration and logging infrastructure
//!
//! ## Architecture
//!
//! Producers hand partial events to [`Tracker::track`]. The queue stamps,
//! filters and batches them; the delivery unit sends batches and persists the
//! ones that fail; the session lifecycle owns the session id and keeps tabs
//! converged over a [`session::CrossTabChannel`]. [`runtime::spawn`] runs a
//! tracker as a single actor task driven by timers and page signals.
//!
//! ## Example
//!
//! ```rust,no_run
//! use tlog_core::{Config, EventDraft, Tracker};
//!
//! let config = Config::load().expect("failed to load config");
//! let mut tracker = Tracker::open(config).expect("failed to open tracker");
//!
//! tracker.start_tracking().expect("failed to start session");
//! tracker.track(EventDraft::custom("signup", None));
//! tracker.stop_tracking();
//! ```

// Re-export commonly used items at the crate root
pub use config::Config;
pub use context::{Clock, ManualClock, SharedState, SystemClock};
pub use error::{Error, Result};
pub use queue::EventQueue;
pub use runtime::TrackerHandle;
pub use tracker::{Tracker, TrackerParts};
pub use types::*;

// Public modules
pub mod config;
pub mod context;
pub mod error;
pub mod logging;
pub mod queue;
pub mod runtime;
pub mod session;
pub mod storage;
pub mod tracker;
pub mod transport;
pub mod types;
