//! Admission limits: global rate, per-name rate and per-session caps

use std::collections::{HashMap, HashSet, VecDeque};

use crate::types::EventType;

use super::{
    GLOBAL_RATE_LIMIT, GLOBAL_RATE_WINDOW_MS, MAX_EVENTS_PER_SESSION, PER_NAME_WINDOW_MS,
};

/// Fixed-window counter shared by every non-boundary event
#[derive(Debug, Default)]
pub struct GlobalRateLimiter {
    window_start: i64,
    count: usize,
}

impl GlobalRateLimiter {
    pub fn allow(&mut self, now: i64) -> bool {
        if now - self.window_start >= GLOBAL_RATE_WINDOW_MS {
            self.window_start = now;
            self.count = 0;
        }

        if self.count < GLOBAL_RATE_LIMIT {
            self.count += 1;
            true
        } else {
            false
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Sliding 60s window per custom event name
#[derive(Debug, Default)]
pub struct PerNameLimiter {
    windows: HashMap<String, VecDeque<i64>>,
}

impl PerNameLimiter {
    pub fn allow(&mut self, name: &str, now: i64, max_per_window: usize) -> bool {
        let window = self.windows.entry(name.to_string()).or_default();

        while window
            .front()
            .is_some_and(|&at| now - at >= PER_NAME_WINDOW_MS)
        {
            window.pop_front();
        }

        if window.len() >= max_per_window {
            return false;
        }

        window.push_back(now);
        true
    }

    pub fn reset(&mut self) {
        self.windows.clear();
    }
}

/// Lifetime-of-session counters per event type
#[derive(Debug, Default)]
pub struct SessionCaps {
    session_id: Option<String>,
    counts: HashMap<EventType, usize>,
    total: usize,
    /// Types whose breach was already logged this session
    warned: HashSet<EventType>,
    total_warned: bool,
}

impl SessionCaps {
    /// Per-type cap; `None` means only the session total applies
    pub fn cap_for(event_type: EventType) -> Option<usize> {
        match event_type {
            EventType::Click => Some(500),
            EventType::Scroll => Some(120),
            EventType::Custom => Some(500),
            EventType::ViewportVisible => Some(200),
            _ => None,
        }
    }

    /// Start counting from zero when the session changes
    pub fn bind_session(&mut self, session_id: &str) {
        if self.session_id.as_deref() != Some(session_id) {
            self.reset();
            self.session_id = Some(session_id.to_string());
        }
    }

    pub fn allow(&mut self, event_type: EventType) -> bool {
        if self.total >= MAX_EVENTS_PER_SESSION {
            if !self.total_warned {
                tracing::warn!(
                    limit = MAX_EVENTS_PER_SESSION,
                    "Session event limit reached, dropping further events"
                );
                self.total_warned = true;
            }
            return false;
        }

        if let Some(cap) = Self::cap_for(event_type) {
            let count = self.counts.get(&event_type).copied().unwrap_or(0);
            if count >= cap {
                if self.warned.insert(event_type) {
                    tracing::warn!(
                        event_type = %event_type,
                        limit = cap,
                        "Per-session limit reached for event type, dropping further events"
                    );
                }
                return false;
            }
        }

        true
    }

    pub fn record(&mut self, event_type: EventType) {
        *self.counts.entry(event_type).or_default() += 1;
        self.total += 1;
    }

    pub fn count(&self, event_type: EventType) -> usize {
        self.counts.get(&event_type).copied().unwrap_or(0)
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
