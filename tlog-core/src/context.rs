//! Shared tracking context and time source
//!
//! [`SharedState`] is the one mutable record every engine reads. It is passed
//! by `&mut` reference rather than living in a global, and each key has a
//! single owner that writes it:
//!
//! | Key | Owner |
//! |-----|-------|
//! | `session_id` | session engine |
//! | `has_start_session` | queue engine sets it, session engine resets it |
//! | `config`, `user_id`, `device`, `page_url` | tracker (host wiring) |

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crate::config::Config;
use crate::types::DeviceType;

/// Wall-clock source in milliseconds since the Unix epoch
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

/// Reads the system clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Hand-driven clock for tests and simulations
///
/// Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<AtomicI64>,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now: Arc::new(AtomicI64::new(start_ms)),
        }
    }

    pub fn set(&self, ms: i64) {
        self.now.store(ms, Ordering::SeqCst);
    }

    pub fn advance(&self, ms: i64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Process-wide tracking state
#[derive(Debug, Clone)]
pub struct SharedState {
    pub config: Config,
    pub user_id: String,
    pub device: DeviceType,
    /// URL stamped on drafts that carry none
    pub page_url: String,
    /// Current logical session, `None` while idle
    pub session_id: Option<String>,
    /// A `session_start` was queued for the current logical session
    pub has_start_session: bool,
}

impl SharedState {
    pub fn new(config: Config, user_id: impl Into<String>) -> Self {
        let device = config.project.device;
        Self {
            config,
            user_id: user_id.into(),
            device,
            page_url: String::new(),
            session_id: None,
            has_start_session: false,
        }
    }

    pub fn project_id(&self) -> &str {
        &self.config.project.id
    }
}
