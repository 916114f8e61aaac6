//! In-memory event queue with admission control and flush scheduling

use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::broadcast;

use crate::context::{Clock, SharedState};
use crate::error::{Error, Result};
use crate::transport::DeliveryUnit;
use crate::types::{Event, EventBatch, EventData, EventDraft, EventType};

use super::dedup::{fingerprint, DedupCache};
use super::limits::{GlobalRateLimiter, PerNameLimiter, SessionCaps};
use super::{
    BATCH_SIZE_THRESHOLD, MAX_CUSTOM_EVENT_METADATA_BYTES, MAX_CUSTOM_EVENT_NAME_LENGTH,
    MAX_PENDING_EVENTS, MAX_QUEUE_LENGTH,
};

/// Capacity of the listener fan-out channel
const LISTENER_CAPACITY: usize = 256;

/// Owns queued events from `track()` until they are sent or persisted
pub struct EventQueue {
    delivery: DeliveryUnit,
    clock: Arc<dyn Clock>,
    events: VecDeque<Event>,
    /// Drafts tracked before any session existed
    pending: VecDeque<EventDraft>,
    dedup: DedupCache,
    rate: GlobalRateLimiter,
    per_name: PerNameLimiter,
    caps: SessionCaps,
    listeners: broadcast::Sender<Event>,
    /// Background interval flush is active
    interval_armed: bool,
    /// Set while the caller owns the next flush
    defer_dispatch: bool,
    rng: StdRng,
}

impl EventQueue {
    pub fn new(delivery: DeliveryUnit, clock: Arc<dyn Clock>) -> Self {
        let (listeners, _) = broadcast::channel(LISTENER_CAPACITY);
        Self {
            delivery,
            clock,
            events: VecDeque::with_capacity(MAX_QUEUE_LENGTH),
            pending: VecDeque::new(),
            dedup: DedupCache::new(),
            rate: GlobalRateLimiter::default(),
            per_name: PerNameLimiter::default(),
            caps: SessionCaps::default(),
            listeners,
            interval_armed: false,
            defer_dispatch: false,
            rng: StdRng::from_os_rng(),
        }
    }

    /// Deterministic sampling draws
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn delivery(&self) -> &DeliveryUnit {
        &self.delivery
    }

    /// Receive every event as it is enqueued
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.listeners.subscribe()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_interval_armed(&self) -> bool {
        self.interval_armed
    }

    /// Queued events in arrival order
    pub fn events(&self) -> impl Iterator<Item = &Event> {
        self.events.iter()
    }

    /// Admit a draft. Never fails: rejected drafts are logged and dropped.
    pub fn track(&mut self, state: &mut SharedState, draft: EventDraft) {
        let Some(event_type) = draft.event_type() else {
            tracing::warn!("Dropping event draft without a type");
            return;
        };

        let now = self.clock.now_ms();

        let Some(session_id) = state.session_id.clone() else {
            self.hold_pending(state, draft, now);
            return;
        };
        self.caps.bind_session(&session_id);

        if event_type == EventType::SessionStart && state.has_start_session {
            tracing::debug!(session_id = %session_id, "session_start already tracked for this session");
            return;
        }

        if !event_type.is_boundary() && !self.admit(state, &draft, event_type, now) {
            return;
        }

        let Some(data) = draft.data else {
            return;
        };
        let event = Event {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: draft.timestamp.unwrap_or(now),
            page_url: draft.page_url.unwrap_or_else(|| state.page_url.clone()),
            from_page_url: draft.from_page_url,
            data,
        };

        if self.dedup.is_duplicate(&fingerprint(&event), event.timestamp) {
            tracing::trace!(event_type = %event_type, "Suppressed duplicate event");
            return;
        }

        if event_type == EventType::SessionStart {
            state.has_start_session = true;
        }
        if !event_type.is_boundary() {
            self.caps.record(event_type);
        }

        self.enqueue(state, event);
    }

    /// Like [`Self::track`], but never starts a threshold flush
    ///
    /// For teardown paths that flush synchronously right after, so the whole
    /// batch leaves through that flush.
    pub fn track_before_sync_flush(&mut self, state: &mut SharedState, draft: EventDraft) {
        self.defer_dispatch = true;
        self.track(state, draft);
        self.defer_dispatch = false;
    }

    /// Rate limits, caps and sampling for non-boundary events
    fn admit(
        &mut self,
        state: &SharedState,
        draft: &EventDraft,
        event_type: EventType,
        now: i64,
    ) -> bool {
        if !self.rate.allow(now) {
            tracing::warn!(event_type = %event_type, "Global rate limit reached, dropping event");
            return false;
        }

        if let Some(EventData::Custom { custom_event }) = &draft.data {
            let max = state.config.tracking.max_same_event_per_minute;
            if !self.per_name.allow(&custom_event.name, now, max) {
                tracing::warn!(
                    name = %custom_event.name,
                    limit = max,
                    "Custom event fired too often, dropping"
                );
                return false;
            }
        }

        if !self.caps.allow(event_type) {
            return false;
        }

        let rate = state.config.tracking.sampling_rate;
        rate >= 1.0 || self.rng.random::<f64>() < rate
    }

    fn hold_pending(&mut self, state: &SharedState, mut draft: EventDraft, now: i64) {
        // Stamp now so replay keeps capture order and page
        draft.timestamp.get_or_insert(now);
        if draft.page_url.is_none() {
            draft.page_url = Some(state.page_url.clone());
        }

        if self.pending.len() >= MAX_PENDING_EVENTS {
            self.pending.pop_front();
            tracing::debug!(
                capacity = MAX_PENDING_EVENTS,
                "Pending buffer full, dropped oldest draft"
            );
        }
        self.pending.push_back(draft);
    }

    fn enqueue(&mut self, state: &SharedState, event: Event) {
        // No receivers is fine
        let _ = self.listeners.send(event.clone());
        self.events.push_back(event);

        if self.events.len() > MAX_QUEUE_LENGTH {
            let victim = self
                .events
                .iter()
                .position(|e| !e.event_type().is_boundary())
                .unwrap_or(0);
            if let Some(evicted) = self.events.remove(victim) {
                tracing::warn!(
                    event_type = %evicted.event_type(),
                    "Queue full, evicted oldest event"
                );
            }
        }

        self.interval_armed = true;

        if self.events.len() >= BATCH_SIZE_THRESHOLD && !self.defer_dispatch {
            self.dispatch_flush(state);
        }
    }

    /// Flush now without blocking the caller: spawned onto the current
    /// runtime, or sent synchronously when there is none.
    fn dispatch_flush(&mut self, state: &SharedState) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let flush = self.flush_immediately(state);
                handle.spawn(flush);
            }
            Err(_) => {
                self.flush_immediately_sync(state);
            }
        }
    }

    /// Replay drafts held while no session existed
    pub fn flush_pending_events(&mut self, state: &mut SharedState) {
        if state.session_id.is_none() || self.pending.is_empty() {
            return;
        }

        let drafts: Vec<EventDraft> = self.pending.drain(..).collect();
        tracing::debug!(count = drafts.len(), "Replaying pending events");
        for draft in drafts {
            self.track(state, draft);
        }
    }

    /// Validated custom event
    ///
    /// Invalid names or metadata are dropped with a warning, or returned as
    /// [`Error::Validation`] when `tracking.qa_mode` is on.
    pub fn send_custom_event(
        &mut self,
        state: &mut SharedState,
        name: &str,
        metadata: Option<serde_json::Value>,
    ) -> Result<()> {
        match validate_custom_event(name, metadata) {
            Ok(metadata) => {
                self.track(state, EventDraft::custom(name, metadata));
                Ok(())
            }
            Err(e) if state.config.tracking.qa_mode => Err(e),
            Err(e) => {
                tracing::warn!(name, error = %e, "Dropping invalid custom event");
                Ok(())
            }
        }
    }

    /// Wire payload for the current queue
    ///
    /// Same-fingerprint events collapse to their latest occurrence, then the
    /// batch is ordered by capture time. `None` without a session or events.
    pub fn build_payload(&self, state: &SharedState) -> Option<EventBatch> {
        let session_id = state.session_id.clone()?;
        if self.events.is_empty() {
            return None;
        }

        let mut by_fingerprint: HashMap<String, usize> = HashMap::new();
        let mut events: Vec<Event> = Vec::with_capacity(self.events.len());
        for event in &self.events {
            match by_fingerprint.entry(fingerprint(event)) {
                Entry::Occupied(slot) => events[*slot.get()] = event.clone(),
                Entry::Vacant(slot) => {
                    slot.insert(events.len());
                    events.push(event.clone());
                }
            }
        }
        events.sort_by_key(|e| e.timestamp);

        Some(EventBatch {
            user_id: state.user_id.clone(),
            session_id,
            device: state.device,
            events,
            global_metadata: state.config.tracking.global_metadata.clone(),
        })
    }

    /// Build the payload and hand the queue over to delivery
    fn take_batch(&mut self, state: &SharedState) -> Option<EventBatch> {
        let batch = self.build_payload(state)?;
        self.events.clear();
        self.interval_armed = false;
        Some(batch)
    }

    /// Async flush for normal operation
    ///
    /// Events leave the queue before the request starts; a failed send is
    /// persisted by the delivery unit, never requeued.
    pub fn flush_immediately(
        &mut self,
        state: &SharedState,
    ) -> impl Future<Output = bool> + Send + 'static {
        let nothing_queued = self.events.is_empty();
        let batch = self.take_batch(state);
        let delivery = self.delivery.clone();

        async move {
            match batch {
                Some(batch) => delivery.send(batch).await,
                None => nothing_queued,
            }
        }
    }

    /// Synchronous flush for teardown paths
    pub fn flush_immediately_sync(&mut self, state: &SharedState) -> bool {
        if self.events.is_empty() {
            return true;
        }
        match self.take_batch(state) {
            Some(batch) => self.delivery.send_sync(batch),
            None => false,
        }
    }

    /// Interval tick: a flush future when the interval is armed and events wait
    pub fn flush_if_due(
        &mut self,
        state: &SharedState,
    ) -> Option<impl Future<Output = bool> + Send + 'static> {
        if !self.interval_armed || self.events.is_empty() {
            return None;
        }
        Some(self.flush_immediately(state))
    }

    /// Full reset: queue, pending drafts, caches and the interval
    pub fn stop(&mut self) {
        self.events.clear();
        self.pending.clear();
        self.dedup.clear();
        self.rate.reset();
        self.per_name.reset();
        self.caps.reset();
        self.interval_armed = false;
    }
}

fn validate_custom_event(
    name: &str,
    metadata: Option<serde_json::Value>,
) -> Result<Option<serde_json::Map<String, serde_json::Value>>> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(Error::Validation("custom event name is empty".to_string()));
    }
    if name.chars().count() > MAX_CUSTOM_EVENT_NAME_LENGTH {
        return Err(Error::Validation(format!(
            "custom event name longer than {} characters",
            MAX_CUSTOM_EVENT_NAME_LENGTH
        )));
    }

    match metadata {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::Object(map)) => {
            let size = serde_json::to_string(&map)?.len();
            if size > MAX_CUSTOM_EVENT_METADATA_BYTES {
                return Err(Error::Validation(format!(
                    "custom event metadata is {} bytes, limit is {}",
                    size, MAX_CUSTOM_EVENT_METADATA_BYTES
                )));
            }
            Ok(Some(map))
        }
        Some(_) => Err(Error::Validation(
            "custom event metadata must be a JSON object".to_string(),
        )),
    }
}
