//! Batch delivery with persistence-based recovery

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::context::Clock;
use crate::error::Result;
use crate::storage::{queue_key, StorageKind, StorageManager};
use crate::types::{EventBatch, PersistedPayload, RequestMetadata};

use super::{
    SendOutcome, Transport, BEACON_MAX_BYTES, PERMANENT_ERROR_LOG_THROTTLE_MS,
    PERSIST_RACE_WINDOW_MS, RECOVERY_WINDOW_MS,
};

/// Delivery statistics
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeliveryStats {
    /// Batches accepted by the endpoint (async, beacon or recovery)
    pub batches_sent: usize,
    /// Events inside those batches
    pub events_sent: usize,
    /// Batches discarded after a 4xx
    pub permanent_failures: usize,
    /// Batches that failed transiently
    pub transient_failures: usize,
    /// Batches written to storage for recovery
    pub batches_persisted: usize,
}

/// What a recovery attempt did with the persisted payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// Nothing persisted
    NothingPersisted,
    /// Another recovery is in flight
    AlreadyRunning,
    /// Payload could not be decoded; removed
    Corrupt,
    /// Payload older than the recovery window or empty; removed unsent
    Discarded,
    /// Resent successfully; removed
    Delivered,
    /// Endpoint rejected it permanently; removed
    Rejected,
    /// Transient failure; payload kept for the next load
    Retained,
}

/// Sends batches and owns the persisted recovery payload
///
/// Cheap to clone; clones share statistics and the recovery guard.
#[derive(Clone)]
pub struct DeliveryUnit {
    inner: Arc<DeliveryInner>,
}

struct DeliveryInner {
    transport: Arc<dyn Transport>,
    storage: Arc<StorageManager>,
    clock: Arc<dyn Clock>,
    queue_key: String,
    recovering: AtomicBool,
    /// (status, logged_at) of the last permanent failure written to the log
    last_permanent_log: Mutex<Option<(u16, i64)>>,
    stats: Mutex<DeliveryStats>,
}

/// Clears the recovery flag when recovery returns, on every path
struct RecoveryGuard<'a>(&'a AtomicBool);

impl Drop for RecoveryGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl DeliveryUnit {
    pub fn new(
        transport: Arc<dyn Transport>,
        storage: Arc<StorageManager>,
        clock: Arc<dyn Clock>,
        project_id: &str,
    ) -> Self {
        Self {
            inner: Arc::new(DeliveryInner {
                transport,
                storage,
                clock,
                queue_key: queue_key(project_id),
                recovering: AtomicBool::new(false),
                last_permanent_log: Mutex::new(None),
                stats: Mutex::new(DeliveryStats::default()),
            }),
        }
    }

    /// Get current delivery statistics
    pub fn stats(&self) -> DeliveryStats {
        self.inner
            .stats
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    fn update_stats(&self, f: impl FnOnce(&mut DeliveryStats)) {
        if let Ok(mut stats) = self.inner.stats.lock() {
            f(&mut stats);
        }
    }

    /// Request body: the batch plus `_metadata`
    pub fn encode(&self, batch: &EventBatch) -> Result<String> {
        let mut body = serde_json::to_value(batch)?;
        let referer = batch
            .events
            .iter()
            .max_by_key(|e| e.timestamp)
            .map(|e| e.page_url.clone())
            .unwrap_or_default();
        let metadata = RequestMetadata {
            referer,
            timestamp: self.inner.clock.now_ms(),
        };
        if let Some(map) = body.as_object_mut() {
            map.insert("_metadata".to_string(), serde_json::to_value(metadata)?);
        }
        Ok(serde_json::to_string(&body)?)
    }

    /// Async send. Transient failures are persisted for recovery.
    pub async fn send(&self, batch: EventBatch) -> bool {
        if batch.events.is_empty() {
            return true;
        }

        let body = match self.encode(&batch) {
            Ok(body) => body,
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode batch, dropping it");
                return false;
            }
        };

        let outcome = self.inner.transport.send(body).await;
        self.handle_outcome(&batch, outcome)
    }

    /// Teardown send: beacon when the body fits, otherwise persist and
    /// report failure without attempting the request.
    pub fn send_sync(&self, batch: EventBatch) -> bool {
        if batch.events.is_empty() {
            return true;
        }

        let body = match self.encode(&batch) {
            Ok(body) => body,
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode batch, dropping it");
                return false;
            }
        };

        if body.len() > BEACON_MAX_BYTES {
            tracing::warn!(
                bytes = body.len(),
                limit = BEACON_MAX_BYTES,
                "Batch too large for beacon, persisting for recovery"
            );
            self.persist(&batch);
            return false;
        }

        if self.inner.transport.send_beacon(body) {
            self.update_stats(|s| {
                s.batches_sent += 1;
                s.events_sent += batch.events.len();
            });
            true
        } else {
            tracing::warn!(
                events = batch.events.len(),
                "Beacon refused, persisting for recovery"
            );
            self.persist(&batch);
            false
        }
    }

    fn handle_outcome(&self, batch: &EventBatch, outcome: SendOutcome) -> bool {
        match outcome {
            SendOutcome::Delivered => {
                self.update_stats(|s| {
                    s.batches_sent += 1;
                    s.events_sent += batch.events.len();
                });
                tracing::debug!(
                    session_id = %batch.session_id,
                    events = batch.events.len(),
                    "Delivered batch"
                );
                true
            }
            SendOutcome::PermanentFailure { status } => {
                self.update_stats(|s| s.permanent_failures += 1);
                self.log_permanent_failure(status, batch.events.len());
                false
            }
            SendOutcome::TransientFailure { reason } => {
                self.update_stats(|s| s.transient_failures += 1);
                tracing::warn!(
                    session_id = %batch.session_id,
                    events = batch.events.len(),
                    reason = %reason,
                    "Transient delivery failure, persisting batch"
                );
                self.persist(batch);
                false
            }
        }
    }

    fn log_permanent_failure(&self, status: u16, events: usize) {
        let now = self.inner.clock.now_ms();
        let Ok(mut last) = self.inner.last_permanent_log.lock() else {
            return;
        };

        let throttled = matches!(
            *last,
            Some((last_status, at)) if last_status == status && now - at < PERMANENT_ERROR_LOG_THROTTLE_MS
        );
        if throttled {
            tracing::debug!(status, events, "Batch rejected again, discarding");
        } else {
            tracing::warn!(status, events, "Batch rejected by endpoint, discarding without retry");
            *last = Some((status, now));
        }
    }

    /// Write `batch` as the recovery payload unless another tab just did.
    pub fn persist(&self, batch: &EventBatch) {
        let now = self.inner.clock.now_ms();
        let storage = &self.inner.storage;

        if let Some(existing) =
            storage.get_json::<PersistedPayload>(StorageKind::Durable, &self.inner.queue_key)
        {
            if now - existing.timestamp < PERSIST_RACE_WINDOW_MS {
                tracing::debug!(
                    age_ms = now - existing.timestamp,
                    "Recent recovery payload already written, skipping persist"
                );
                return;
            }
        }

        let payload = PersistedPayload {
            batch: batch.clone(),
            timestamp: now,
        };
        storage.set_json(StorageKind::Durable, &self.inner.queue_key, &payload);
        self.update_stats(|s| s.batches_persisted += 1);
    }

    /// The currently persisted recovery payload, if any
    pub fn persisted_payload(&self) -> Option<PersistedPayload> {
        self.inner
            .storage
            .get_json(StorageKind::Durable, &self.inner.queue_key)
    }

    /// Resend the persisted payload from an earlier load
    ///
    /// Only one recovery runs at a time.
    pub async fn recover_persisted_events(&self) -> RecoveryOutcome {
        if self
            .inner
            .recovering
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return RecoveryOutcome::AlreadyRunning;
        }
        let _guard = RecoveryGuard(&self.inner.recovering);

        let storage = &self.inner.storage;
        let key = &self.inner.queue_key;

        let Some(raw) = storage.get(StorageKind::Durable, key) else {
            return RecoveryOutcome::NothingPersisted;
        };

        let payload: PersistedPayload = match serde_json::from_str(&raw) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(error = %e, "Discarding corrupt recovery payload");
                storage.remove(StorageKind::Durable, key);
                return RecoveryOutcome::Corrupt;
            }
        };

        let age = self.inner.clock.now_ms() - payload.timestamp;
        if age > RECOVERY_WINDOW_MS || payload.batch.events.is_empty() {
            tracing::info!(
                age_ms = age,
                events = payload.batch.events.len(),
                "Discarding stale recovery payload"
            );
            storage.remove(StorageKind::Durable, key);
            return RecoveryOutcome::Discarded;
        }

        let body = match self.encode(&payload.batch) {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(error = %e, "Recovery payload cannot be encoded, discarding");
                storage.remove(StorageKind::Durable, key);
                return RecoveryOutcome::Corrupt;
            }
        };

        match self.inner.transport.send(body).await {
            SendOutcome::Delivered => {
                self.update_stats(|s| {
                    s.batches_sent += 1;
                    s.events_sent += payload.batch.events.len();
                });
                tracing::info!(
                    events = payload.batch.events.len(),
                    "Recovered persisted events"
                );
                storage.remove(StorageKind::Durable, key);
                RecoveryOutcome::Delivered
            }
            SendOutcome::PermanentFailure { status } => {
                self.update_stats(|s| s.permanent_failures += 1);
                self.log_permanent_failure(status, payload.batch.events.len());
                storage.remove(StorageKind::Durable, key);
                RecoveryOutcome::Rejected
            }
            SendOutcome::TransientFailure { reason } => {
                self.update_stats(|s| s.transient_failures += 1);
                tracing::debug!(reason = %reason, "Recovery send failed, keeping payload");
                RecoveryOutcome::Retained
            }
        }
    }
}
