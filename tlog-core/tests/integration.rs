//! Integration tests for the tracker: queue, sessions, delivery and recovery
//!
//! Tabs are simulated as separate trackers over the same SQLite file and the
//! same broadcast hub; reloads are simulated by dropping a tracker and opening
//! a new one on the same file.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tlog_core::queue::BATCH_SIZE_THRESHOLD;
use tlog_core::runtime;
use tlog_core::session::{CrossTabChannel, LocalBroadcastHub};
use tlog_core::storage::{queue_key, session_key, MemoryArea, SqliteArea, StorageKind, StorageManager};
use tlog_core::transport::{RecoveryOutcome, SendOutcome, Transport};
use tlog_core::{
    ClickData, Config, EventBatch, EventDraft, ManualClock, PersistedPayload, ScrollDirection,
    SessionRecord, Tracker, TrackerParts,
};

const START: i64 = 1_700_000_000_000;
const TIMEOUT: i64 = 900_000;

/// Transport that plays back scripted outcomes (default: delivered)
#[derive(Default)]
struct ScriptedTransport {
    outcomes: Mutex<VecDeque<SendOutcome>>,
    bodies: Mutex<Vec<serde_json::Value>>,
}

impl ScriptedTransport {
    fn failing_with(outcome: SendOutcome) -> Self {
        Self {
            outcomes: Mutex::new(VecDeque::from([outcome])),
            ..Default::default()
        }
    }

    fn batches(&self) -> Vec<serde_json::Value> {
        self.bodies.lock().unwrap().clone()
    }

    fn events_of_type(&self, event_type: &str) -> usize {
        self.batches()
            .iter()
            .flat_map(|b| b["events"].as_array().cloned().unwrap_or_default())
            .filter(|e| e["type"] == event_type)
            .count()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, body: String) -> SendOutcome {
        self.bodies
            .lock()
            .unwrap()
            .push(serde_json::from_str(&body).unwrap());
        self.outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(SendOutcome::Delivered)
    }

    fn send_beacon(&self, body: String) -> bool {
        self.bodies
            .lock()
            .unwrap()
            .push(serde_json::from_str(&body).unwrap());
        true
    }
}

fn config() -> Config {
    let mut config = Config::default();
    config.project.id = "shop".to_string();
    config.tracking.session_timeout_ms = TIMEOUT as u64;
    config
}

fn storage_at(path: &Path) -> Arc<StorageManager> {
    Arc::new(StorageManager::new(
        Some(Box::new(SqliteArea::open(path).unwrap())),
        Some(Box::new(MemoryArea::new())),
    ))
}

fn open_tab(
    path: &Path,
    hub: &Arc<LocalBroadcastHub>,
    clock: &ManualClock,
    transport: &Arc<ScriptedTransport>,
) -> Tracker {
    let channel: Arc<dyn CrossTabChannel> = hub.clone();
    Tracker::new(TrackerParts {
        config: config(),
        transport: transport.clone(),
        storage: storage_at(path),
        channel,
        clock: Arc::new(clock.clone()),
    })
}

struct Harness {
    _dir: TempDir,
    path: std::path::PathBuf,
    hub: Arc<LocalBroadcastHub>,
    clock: ManualClock,
    transport: Arc<ScriptedTransport>,
}

impl Harness {
    fn new() -> Self {
        tlog_core::logging::init_test();
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("storage.db");
        Self {
            _dir: dir,
            path,
            hub: Arc::new(LocalBroadcastHub::new()),
            clock: ManualClock::new(START),
            transport: Arc::new(ScriptedTransport::default()),
        }
    }

    fn tab(&self) -> Tracker {
        open_tab(&self.path, &self.hub, &self.clock, &self.transport)
    }

    fn stored_session(&self) -> Option<SessionRecord> {
        storage_at(&self.path).get_json(StorageKind::Durable, &session_key("shop"))
    }
}

fn click(x: f64, y: f64) -> EventDraft {
    EventDraft::click(ClickData {
        x,
        y,
        tag: "a".to_string(),
        ..Default::default()
    })
}

fn session_starts_queued(tracker: &Tracker) -> usize {
    tracker
        .queue()
        .events()
        .filter(|e| e.event_type() == tlog_core::EventType::SessionStart)
        .count()
}

// ============================================
// Queue properties
// ============================================

#[test]
fn test_queue_length_counts_admitted_events() {
    let h = Harness::new();
    let mut tab = h.tab();
    tab.start_tracking().unwrap();

    tab.track(click(10.0, 10.0));
    tab.track(click(12.0, 9.0)); // duplicate of the first
    tab.track(EventDraft::scroll(25, ScrollDirection::Down));
    tab.track(EventDraft::default()); // no type
    tab.track(EventDraft::custom("signup", None));
    h.clock.advance(10_000);
    tab.track(click(10.0, 10.0)); // outside the dedup window

    // session_start + click + scroll + custom + click
    assert_eq!(tab.queue_length(), 5);
}

#[test]
fn test_same_clicks_collapse_or_not_by_time() {
    let h = Harness::new();
    let mut tab = h.tab();
    tab.start_tracking().unwrap();
    let base = tab.queue_length();

    tab.track(click(300.0, 120.0));
    h.clock.advance(300);
    tab.track(click(304.0, 117.0));
    assert_eq!(tab.queue_length(), base + 1);

    h.clock.advance(10_000);
    tab.track(click(300.0, 120.0));
    assert_eq!(tab.queue_length(), base + 2);
}

// ============================================
// Session properties
// ============================================

#[test]
fn test_start_twice_keeps_one_session() {
    let h = Harness::new();
    let mut tab = h.tab();
    tab.start_tracking().unwrap();
    let id = tab.session_id().map(str::to_string);
    tab.start_tracking().unwrap();

    assert_eq!(tab.session_id().map(str::to_string), id);
    assert_eq!(session_starts_queued(&tab), 1);
}

#[test]
fn test_reload_within_timeout_recovers_session() {
    let h = Harness::new();
    let first_id = {
        let mut tab = h.tab();
        tab.start_tracking().unwrap();
        tab.session_id().unwrap().to_string()
    };

    h.clock.advance(TIMEOUT - 1);
    let mut reloaded = h.tab();
    reloaded.start_tracking().unwrap();
    assert_eq!(reloaded.session_id(), Some(first_id.as_str()));
    assert_eq!(session_starts_queued(&reloaded), 0);
}

#[test]
fn test_reload_after_timeout_starts_new_session() {
    let h = Harness::new();
    let first_id = {
        let mut tab = h.tab();
        tab.start_tracking().unwrap();
        tab.session_id().unwrap().to_string()
    };

    h.clock.advance(TIMEOUT + 1);
    let mut reloaded = h.tab();
    reloaded.start_tracking().unwrap();
    assert_ne!(reloaded.session_id(), Some(first_id.as_str()));
    assert_eq!(session_starts_queued(&reloaded), 1);
}

#[test]
fn test_page_unload_retains_record_manual_stop_clears_it() {
    let h = Harness::new();
    let mut tab = h.tab();
    tab.start_tracking().unwrap();
    tab.page_unload();
    assert!(h.stored_session().is_some());
    assert!(tab.session_id().is_none());

    let mut tab = h.tab();
    tab.start_tracking().unwrap();
    tab.stop_tracking();
    assert!(h.stored_session().is_none());
}

#[test]
fn test_reload_after_page_unload_counts_as_recovered() {
    let h = Harness::new();
    let first_id = {
        let mut tab = h.tab();
        tab.start_tracking().unwrap();
        let id = tab.session_id().unwrap().to_string();
        tab.page_unload();
        id
    };
    assert_eq!(h.transport.events_of_type("session_end"), 1);

    h.clock.advance(2_000);
    let mut reloaded = h.tab();
    reloaded.start_tracking().unwrap();
    assert_eq!(reloaded.session_id(), Some(first_id.as_str()));
    assert_eq!(session_starts_queued(&reloaded), 0);
    assert_eq!(h.stored_session().unwrap().last_activity, START + 2_000);
}

#[test]
fn test_own_broadcast_never_duplicates_session_start() {
    let h = Harness::new();
    let mut tab = h.tab();
    tab.start_tracking().unwrap();
    tab.poll_broadcasts();
    tab.track(EventDraft::new(tlog_core::EventData::SessionStart));
    h.clock.advance(1_000);
    tab.poll_broadcasts();

    assert_eq!(session_starts_queued(&tab), 1);
    assert!(tab.state().has_start_session);
    assert!(tab.flush_immediately_sync());
    assert_eq!(h.transport.events_of_type("session_start"), 1);
}

#[test]
fn test_second_tab_joins_stored_session() {
    let h = Harness::new();
    let mut first = h.tab();
    first.start_tracking().unwrap();

    h.clock.advance(1_000);
    let mut second = h.tab();
    second.start_tracking().unwrap();
    first.poll_broadcasts();
    second.poll_broadcasts();

    assert_eq!(first.session_id(), second.session_id());
    assert_eq!(session_starts_queued(&second), 0);
    // Both tabs share one user id through durable storage
    assert_eq!(first.user_id(), second.user_id());
}

// ============================================
// Delivery and recovery
// ============================================

fn persisted_batch(timestamp: i64) -> String {
    let payload = PersistedPayload {
        batch: EventBatch {
            user_id: "u-1".to_string(),
            session_id: format!("{START}-abcdefghi"),
            device: Default::default(),
            events: vec![tlog_core::Event {
                id: "e-1".to_string(),
                timestamp,
                page_url: "https://shop.example/".to_string(),
                from_page_url: None,
                data: tlog_core::EventData::SessionStart,
            }],
            global_metadata: None,
        },
        timestamp,
    };
    serde_json::to_string(&payload).unwrap()
}

#[tokio::test]
async fn test_three_hour_old_payload_is_discarded() {
    let h = Harness::new();
    let tab = h.tab();
    h.clock.set(START + 3 * 60 * 60 * 1000);
    tab.storage()
        .set(StorageKind::Durable, &queue_key("shop"), &persisted_batch(START));

    assert_eq!(tab.recover_persisted_events().await, RecoveryOutcome::Discarded);
    assert!(h.transport.batches().is_empty());
    assert!(tab.storage().get(StorageKind::Durable, &queue_key("shop")).is_none());
}

#[tokio::test]
async fn test_transient_failure_is_recovered_on_next_load() {
    let h = Harness::new();
    let failing = Arc::new(ScriptedTransport::failing_with(SendOutcome::TransientFailure {
        reason: "connection reset".to_string(),
    }));
    let mut tab = open_tab(&h.path, &h.hub, &h.clock, &failing);
    tab.start_tracking().unwrap();
    tab.track(EventDraft::custom("checkout", None));
    assert!(!tab.flush_immediately().await);
    assert_eq!(tab.queue_length(), 0);
    drop(tab);

    h.clock.advance(60_000);
    let reloaded = h.tab();
    assert_eq!(reloaded.recover_persisted_events().await, RecoveryOutcome::Delivered);
    assert_eq!(h.transport.events_of_type("custom"), 1);
    assert!(reloaded
        .storage()
        .get(StorageKind::Durable, &queue_key("shop"))
        .is_none());
}

#[tokio::test]
async fn test_permanent_failure_is_dropped() {
    let h = Harness::new();
    let rejecting = Arc::new(ScriptedTransport::failing_with(SendOutcome::PermanentFailure {
        status: 400,
    }));
    let mut tab = open_tab(&h.path, &h.hub, &h.clock, &rejecting);
    tab.start_tracking().unwrap();
    assert!(!tab.flush_immediately().await);
    assert!(tab.delivery().persisted_payload().is_none());
    assert_eq!(tab.delivery().stats().permanent_failures, 1);
}

// ============================================
// Actor runtime
// ============================================

#[tokio::test(start_paused = true)]
async fn test_burst_flushes_before_interval() {
    let h = Harness::new();
    let (handle, _task) = runtime::spawn(h.tab());
    handle.start_tracking().await.unwrap();

    // session_start plus these reach the threshold
    for i in 0..(BATCH_SIZE_THRESHOLD - 1) {
        handle.track(EventDraft::custom(format!("burst-{i}"), None)).await;
    }
    assert_eq!(handle.queue_length().await, 0);

    // Well before the 10s interval
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(h.transport.batches().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_interval_flushes_small_queue() {
    let h = Harness::new();
    let (handle, _task) = runtime::spawn(h.tab());
    handle.start_tracking().await.unwrap();
    handle.track(EventDraft::custom("one", None)).await;

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(h.transport.batches().is_empty());

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(h.transport.batches().len(), 1);
    assert_eq!(handle.queue_length().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_inactivity_ends_session() {
    let h = Harness::new();
    let (handle, _task) = runtime::spawn(h.tab());
    handle.start_tracking().await.unwrap();
    assert!(handle.session_id().await.is_some());

    tokio::time::sleep(Duration::from_millis(TIMEOUT as u64 + 1_000)).await;
    assert!(handle.session_id().await.is_none());
    assert_eq!(h.transport.events_of_type("session_end"), 1);
    assert!(h.stored_session().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_hidden_tab_survives_timeout() {
    let h = Harness::new();
    let (handle, _task) = runtime::spawn(h.tab());
    handle.start_tracking().await.unwrap();
    handle.visibility_changed(true).await;

    tokio::time::sleep(Duration::from_millis(2 * TIMEOUT as u64)).await;
    assert!(handle.session_id().await.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_page_unload_through_runtime() {
    let h = Harness::new();
    let (handle, task) = runtime::spawn(h.tab());
    handle.start_tracking().await.unwrap();
    handle.track(EventDraft::custom("last", None)).await;
    handle.page_unload().await;

    assert_eq!(h.transport.events_of_type("custom"), 1);
    assert_eq!(h.transport.events_of_type("session_end"), 1);
    assert!(h.stored_session().is_some());

    drop(handle);
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_startup_recovery_runs_on_spawn() {
    let h = Harness::new();
    h.clock.advance(60_000);
    storage_at(&h.path).set(
        StorageKind::Durable,
        &queue_key("shop"),
        &persisted_batch(START),
    );

    let (_handle, _task) = runtime::spawn(h.tab());
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(h.transport.events_of_type("session_start"), 1);
}
