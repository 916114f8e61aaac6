//! Session state machine: `Idle -> Tracking -> Ending -> Idle`

use std::sync::Arc;

use rand::Rng;

use crate::context::{Clock, SharedState};
use crate::error::Result;
use crate::queue::EventQueue;
use crate::storage::{broadcast_channel_name, session_key, StorageKind, StorageManager};
use crate::types::{
    BroadcastAction, BroadcastMessage, EventData, EventDraft, SessionEndReason, SessionRecord,
};

use super::channel::{ChannelPort, CrossTabChannel};
use super::BROADCAST_FRESHNESS_MS;

const ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const ID_SUFFIX_LEN: usize = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Tracking,
    /// Inside `end_session`, until teardown completes
    Ending,
}

/// Owns `session_id` and `has_start_session` in [`SharedState`]
pub struct SessionLifecycle {
    storage: Arc<StorageManager>,
    clock: Arc<dyn Clock>,
    channel: Arc<dyn CrossTabChannel>,
    phase: SessionPhase,
    port: Option<ChannelPort>,
    /// Inactivity deadline in ms since epoch; `None` while hidden or idle
    deadline: Option<i64>,
    listeners_attached: bool,
    hidden: bool,
    last_end: Option<SessionEndReason>,
}

impl SessionLifecycle {
    pub fn new(
        storage: Arc<StorageManager>,
        clock: Arc<dyn Clock>,
        channel: Arc<dyn CrossTabChannel>,
    ) -> Self {
        Self {
            storage,
            clock,
            channel,
            phase: SessionPhase::Idle,
            port: None,
            deadline: None,
            listeners_attached: false,
            hidden: false,
            last_end: None,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn is_tracking(&self) -> bool {
        self.phase == SessionPhase::Tracking
    }

    pub fn inactivity_deadline(&self) -> Option<i64> {
        self.deadline
    }

    pub fn has_channel(&self) -> bool {
        self.port.is_some()
    }

    /// Reason the previous session ended, until the next start
    pub fn last_end_reason(&self) -> Option<SessionEndReason> {
        self.last_end
    }

    /// Stored session record for the current project
    pub fn stored_session(&self, state: &SharedState) -> Option<SessionRecord> {
        self.storage
            .get_json(StorageKind::Durable, &session_key(state.project_id()))
    }

    /// Begin tracking, recovering the stored session when it is still fresh
    ///
    /// A no-op while already tracking. On error every partial step is undone
    /// and the state is back to `Idle`.
    pub fn start_tracking(&mut self, state: &mut SharedState, queue: &mut EventQueue) -> Result<()> {
        if self.phase != SessionPhase::Idle {
            tracing::debug!(phase = ?self.phase, "start_tracking ignored, session already active");
            return Ok(());
        }

        let now = self.clock.now_ms();
        let timeout = state.config.tracking.session_timeout_ms as i64;
        let key = session_key(state.project_id());

        let (session_id, recovered) = match self.recoverable_session(state, now, timeout) {
            Some(record) => (record.id, true),
            None => (generate_session_id(now), false),
        };

        self.storage.set_json(
            StorageKind::Durable,
            &key,
            &SessionRecord {
                id: session_id.clone(),
                last_activity: now,
            },
        );
        state.session_id = Some(session_id.clone());

        let port = match self.channel.open(&broadcast_channel_name(state.project_id())) {
            Ok(port) => port,
            Err(e) => {
                tracing::error!(session_id = %session_id, error = %e, "Session start failed, unwinding");
                self.unwind(state, recovered);
                return Err(e);
            }
        };

        if !recovered {
            queue.track(state, EventDraft::new(EventData::SessionStart));
            port.post(&BroadcastMessage {
                action: BroadcastAction::SessionStart,
                project_id: state.project_id().to_string(),
                session_id: session_id.clone(),
                timestamp: now,
                reason: None,
            });
        }
        self.port = Some(port);

        self.phase = SessionPhase::Tracking;
        self.last_end = None;
        self.hidden = false;
        self.deadline = Some(now + timeout);
        self.listeners_attached = true;

        if recovered {
            tracing::info!(session_id = %session_id, "Recovered session");
        } else {
            tracing::info!(session_id = %session_id, "Started new session");
        }

        queue.flush_pending_events(state);
        Ok(())
    }

    fn recoverable_session(
        &self,
        state: &SharedState,
        now: i64,
        timeout: i64,
    ) -> Option<SessionRecord> {
        let record = self.stored_session(state)?;
        if now - record.last_activity < timeout {
            Some(record)
        } else {
            tracing::debug!(
                session_id = %record.id,
                idle_ms = now - record.last_activity,
                "Stored session expired"
            );
            None
        }
    }

    fn unwind(&mut self, state: &mut SharedState, recovered: bool) {
        self.deadline = None;
        self.listeners_attached = false;
        self.port = None;
        if !recovered {
            self.storage
                .remove(StorageKind::Durable, &session_key(state.project_id()));
        }
        state.session_id = None;
        state.has_start_session = false;
        self.phase = SessionPhase::Idle;
    }

    /// Click, keydown or scroll
    ///
    /// While tracking this pushes the inactivity deadline out and refreshes
    /// the stored `last_activity`. While idle after an inactivity end it
    /// starts a new session.
    pub fn activity(&mut self, state: &mut SharedState, queue: &mut EventQueue) {
        match self.phase {
            SessionPhase::Tracking if self.listeners_attached => {
                let now = self.clock.now_ms();
                if !self.hidden {
                    self.deadline = Some(now + state.config.tracking.session_timeout_ms as i64);
                }
                self.touch(state, now);
            }
            SessionPhase::Idle if self.last_end == Some(SessionEndReason::Inactivity) => {
                tracing::info!("Activity after inactivity timeout, resuming tracking");
                if let Err(e) = self.start_tracking(state, queue) {
                    tracing::warn!(error = %e, "Could not resume tracking");
                }
            }
            _ => {}
        }
    }

    fn touch(&self, state: &SharedState, now: i64) {
        let Some(session_id) = state.session_id.as_deref() else {
            return;
        };
        let key = session_key(state.project_id());
        let stored = self.stored_session(state);
        let last_activity = match &stored {
            // Another tab may have written a later timestamp
            Some(record) if record.id == session_id => record.last_activity.max(now),
            _ => now,
        };
        self.storage.set_json(
            StorageKind::Durable,
            &key,
            &SessionRecord {
                id: session_id.to_string(),
                last_activity,
            },
        );
    }

    /// Hidden tabs never expire from wall-clock time alone
    pub fn visibility_changed(&mut self, state: &SharedState, hidden: bool) {
        self.hidden = hidden;
        if self.phase != SessionPhase::Tracking || !self.listeners_attached {
            return;
        }
        if hidden {
            self.deadline = None;
        } else {
            let now = self.clock.now_ms();
            self.deadline = Some(now + state.config.tracking.session_timeout_ms as i64);
        }
    }

    /// Inactivity timer fired
    pub fn on_inactivity_timeout(&mut self, state: &mut SharedState, queue: &mut EventQueue) {
        if self.phase == SessionPhase::Tracking && self.deadline.is_some() {
            self.end_session(state, queue, SessionEndReason::Inactivity);
        }
    }

    /// Synchronous end of the current session
    ///
    /// Tracks `session_end`, flushes through the sync path, broadcasts the
    /// end and tears down timers, listeners and the channel before returning.
    /// The stored record survives only a `page_unload` end.
    pub fn end_session(
        &mut self,
        state: &mut SharedState,
        queue: &mut EventQueue,
        reason: SessionEndReason,
    ) {
        if self.phase != SessionPhase::Tracking {
            return;
        }
        self.phase = SessionPhase::Ending;

        let session_id = state.session_id.clone().unwrap_or_default();
        queue.track_before_sync_flush(
            state,
            EventDraft::new(EventData::SessionEnd {
                session_end_reason: reason,
            }),
        );
        if !queue.flush_immediately_sync(state) {
            tracing::warn!(
                session_id = %session_id,
                reason = reason.as_str(),
                "Final flush failed, events left for recovery"
            );
        }

        if let Some(port) = self.port.take() {
            port.post(&BroadcastMessage {
                action: BroadcastAction::SessionEnd,
                project_id: state.project_id().to_string(),
                session_id: session_id.clone(),
                timestamp: self.clock.now_ms(),
                reason: Some(reason),
            });
        }
        self.deadline = None;
        self.listeners_attached = false;

        if reason != SessionEndReason::PageUnload {
            self.storage
                .remove(StorageKind::Durable, &session_key(state.project_id()));
        }
        state.session_id = None;
        state.has_start_session = false;

        self.phase = SessionPhase::Idle;
        self.last_end = Some(reason);
        tracing::info!(session_id = %session_id, reason = reason.as_str(), "Session ended");
    }

    /// Manual end plus a full queue reset
    pub fn stop_tracking(&mut self, state: &mut SharedState, queue: &mut EventQueue) {
        self.end_session(state, queue, SessionEndReason::ManualStop);
        queue.stop();
    }

    /// Hard stop from any state, without a `session_end`
    pub fn destroy(&mut self, state: &mut SharedState) {
        self.deadline = None;
        self.listeners_attached = false;
        self.port = None;
        self.last_end = None;
        self.phase = SessionPhase::Idle;
        state.session_id = None;
        state.has_start_session = false;
    }

    /// Drain messages that already arrived on the channel
    pub fn poll_broadcasts(&mut self, state: &mut SharedState) {
        while let Some(message) = self.port.as_mut().and_then(ChannelPort::try_recv) {
            self.on_broadcast(state, message);
        }
    }

    /// Next message from the channel; pends forever without one
    pub async fn next_broadcast(&mut self) -> Option<BroadcastMessage> {
        match self.port.as_mut() {
            Some(port) => port.recv().await,
            None => std::future::pending().await,
        }
    }

    /// Advisory message from another tab (or this one)
    ///
    /// Never sets `has_start_session`; only the queue does that when it
    /// actually enqueues a `session_start`.
    pub fn on_broadcast(&mut self, state: &mut SharedState, message: BroadcastMessage) {
        if message.project_id != state.project_id() {
            return;
        }
        let now = self.clock.now_ms();
        if now - message.timestamp > BROADCAST_FRESHNESS_MS {
            tracing::debug!(session_id = %message.session_id, "Ignoring stale broadcast");
            return;
        }

        match message.action {
            BroadcastAction::SessionStart => {
                if state.session_id.as_deref() == Some(message.session_id.as_str()) {
                    return;
                }
                if self.phase != SessionPhase::Tracking {
                    return;
                }
                let local_created = state
                    .session_id
                    .as_deref()
                    .and_then(session_created_at)
                    .unwrap_or(i64::MIN);
                if message.timestamp > local_created {
                    tracing::info!(
                        from = ?state.session_id,
                        to = %message.session_id,
                        "Adopting fresher session from another tab"
                    );
                    state.session_id = Some(message.session_id.clone());
                    self.storage.set_json(
                        StorageKind::Durable,
                        &session_key(state.project_id()),
                        &SessionRecord {
                            id: message.session_id,
                            last_activity: now,
                        },
                    );
                }
            }
            BroadcastAction::SessionEnd => {
                tracing::debug!(
                    session_id = %message.session_id,
                    reason = ?message.reason,
                    "Another tab ended its session"
                );
            }
        }
    }
}

/// `"{ms}-{9 base36 chars}"`
pub fn generate_session_id(now: i64) -> String {
    let mut rng = rand::rng();
    let suffix: String = (0..ID_SUFFIX_LEN)
        .map(|_| ID_ALPHABET[rng.random_range(0..ID_ALPHABET.len())] as char)
        .collect();
    format!("{now}-{suffix}")
}

/// Creation time encoded in a session id
pub fn session_created_at(session_id: &str) -> Option<i64> {
    session_id.split_once('-')?.0.parse().ok()
}
