//! Event fingerprints and the sliding duplicate-suppression cache

use std::collections::HashMap;

use sha2::{Digest, Sha256};

use crate::types::{Event, EventData};

use super::{DEDUP_CACHE_HARD_LIMIT, DEDUP_CACHE_PRUNE_AGE_MS, DEDUP_CACHE_PRUNE_AT, DEDUP_WINDOW_MS};

/// Coarse identity of an event: type, page and type-specific discriminators
///
/// Returns a 16-character hex digest of SHA-256 over those parts. Capture
/// time and event id are deliberately left out.
pub fn fingerprint(event: &Event) -> String {
    let discriminator = match &event.data {
        EventData::Click { click_data } => format!(
            "{}:{}",
            round_to_10(click_data.x),
            round_to_10(click_data.y)
        ),
        EventData::Scroll { scroll_data } => {
            format!("{}:{:?}", scroll_data.depth, scroll_data.direction)
        }
        EventData::Custom { custom_event } => custom_event.name.clone(),
        EventData::WebVitals { web_vitals } => web_vitals.vital_type.clone(),
        EventData::Error { error_data } => {
            format!("{:?}:{}", error_data.kind, error_data.message)
        }
        EventData::ViewportVisible { viewport_data } => viewport_data.selector.clone(),
        EventData::SessionEnd { session_end_reason } => session_end_reason.as_str().to_string(),
        EventData::PageView { .. } | EventData::SessionStart => String::new(),
    };

    let input = format!(
        "{}|{}|{}",
        event.event_type().as_str(),
        event.page_url,
        discriminator
    );

    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let result = hasher.finalize();
    hex::encode(&result[..8])
}

fn round_to_10(v: f64) -> i64 {
    ((v / 10.0).round() * 10.0) as i64
}

/// Fingerprint → last-seen timestamp
#[derive(Debug, Default)]
pub struct DedupCache {
    seen: HashMap<String, i64>,
}

impl DedupCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `fingerprint` was seen within the dedup window. Either way the
    /// fingerprint's timestamp moves to `now`, so a steady stream of repeats
    /// keeps being suppressed.
    pub fn is_duplicate(&mut self, fingerprint: &str, now: i64) -> bool {
        if self.seen.len() > DEDUP_CACHE_HARD_LIMIT {
            tracing::warn!(entries = self.seen.len(), "Dedup cache overflow, clearing");
            self.seen.clear();
        } else if self.seen.len() > DEDUP_CACHE_PRUNE_AT {
            self.seen
                .retain(|_, seen_at| now - *seen_at <= DEDUP_CACHE_PRUNE_AGE_MS);
        }

        match self.seen.get_mut(fingerprint) {
            Some(seen_at) if now - *seen_at < DEDUP_WINDOW_MS => {
                *seen_at = now;
                true
            }
            _ => {
                self.seen.insert(fingerprint.to_string(), now);
                false
            }
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn clear(&mut self) {
        self.seen.clear();
    }
}
