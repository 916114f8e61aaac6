//! Tracker: the four engines composed around one [`SharedState`]
//!
//! ```text
//!  producers ──track()──►┌──────────────┐  batches  ┌──────────────┐
//!                        │  EventQueue  │ ────────► │ DeliveryUnit │──► Transport
//!  signals ─────────────►├──────────────┤           └──────┬───────┘
//!  (activity, unload)    │ SessionLife- │                  │ persist / recover
//!                        │    cycle     │◄── CrossTabChannel
//!                        └──────┬───────┘                  ▼
//!                               └────────────────► StorageManager
//! ```
//!
//! All methods are synchronous except the async flush and recovery, which
//! return `'static` futures so a runtime can spawn them.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::config::Config;
use crate::context::{Clock, SharedState, SystemClock};
use crate::error::Result;
use crate::queue::EventQueue;
use crate::session::{CrossTabChannel, LocalBroadcastHub, SessionLifecycle};
use crate::storage::{
    page_key, MemoryArea, SqliteArea, StorageKind, StorageManager, USER_ID_KEY,
};
use crate::transport::{DeliveryUnit, HttpTransport, RecoveryOutcome, Transport};
use crate::types::{BroadcastMessage, Event, EventDraft, PageViewData, SessionEndReason};

/// Everything a tracker needs from its environment
pub struct TrackerParts {
    pub config: Config,
    pub transport: Arc<dyn Transport>,
    pub storage: Arc<StorageManager>,
    pub channel: Arc<dyn CrossTabChannel>,
    pub clock: Arc<dyn Clock>,
}

/// One tab's tracker
pub struct Tracker {
    state: SharedState,
    queue: EventQueue,
    session: SessionLifecycle,
    delivery: DeliveryUnit,
    storage: Arc<StorageManager>,
    clock: Arc<dyn Clock>,
}

impl Tracker {
    pub fn new(parts: TrackerParts) -> Self {
        let TrackerParts {
            config,
            transport,
            storage,
            channel,
            clock,
        } = parts;

        let user_id = load_or_create_user_id(&storage);
        let state = SharedState::new(config, user_id);

        let delivery = DeliveryUnit::new(
            transport,
            storage.clone(),
            clock.clone(),
            state.project_id(),
        );
        let queue = EventQueue::new(delivery.clone(), clock.clone());
        let session = SessionLifecycle::new(storage.clone(), clock.clone(), channel);

        Self {
            state,
            queue,
            session,
            delivery,
            storage,
            clock,
        }
    }

    /// Tracker over the on-disk durable area, the HTTP collector and the
    /// process-wide channel hub, so trackers opened in one process converge
    /// like tabs of one origin
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;

        let durable = SqliteArea::open(&Config::storage_path())?.with_quota(config.storage.quota_bytes);
        let session = MemoryArea::with_quota(config.storage.quota_bytes);
        let transport = HttpTransport::new(&config.collector)?;

        Ok(Self::new(TrackerParts {
            transport: Arc::new(transport),
            storage: Arc::new(StorageManager::new(
                Some(Box::new(durable)),
                Some(Box::new(session)),
            )),
            channel: LocalBroadcastHub::process(),
            clock: Arc::new(SystemClock),
            config,
        }))
    }

    pub fn state(&self) -> &SharedState {
        &self.state
    }

    pub fn session_id(&self) -> Option<&str> {
        self.state.session_id.as_deref()
    }

    pub fn user_id(&self) -> &str {
        &self.state.user_id
    }

    pub fn is_tracking(&self) -> bool {
        self.session.is_tracking()
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    pub fn storage(&self) -> &Arc<StorageManager> {
        &self.storage
    }

    pub fn delivery(&self) -> &DeliveryUnit {
        &self.delivery
    }

    pub fn queue(&self) -> &EventQueue {
        &self.queue
    }

    // ---- producer API ----

    pub fn track(&mut self, draft: EventDraft) {
        self.queue.track(&mut self.state, draft);
    }

    pub fn send_custom_event(
        &mut self,
        name: &str,
        metadata: Option<serde_json::Value>,
    ) -> Result<()> {
        self.queue
            .send_custom_event(&mut self.state, name, metadata)
    }

    /// Move this tab to `url` and track a `page_view`
    ///
    /// The previous URL is kept in the session area so `from_page_url`
    /// survives a reload of the tab.
    pub fn navigate(&mut self, url: &str, page_view: PageViewData) {
        let key = page_key(self.state.project_id());
        let previous = self
            .storage
            .get(StorageKind::Session, &key)
            .or_else(|| Some(self.state.page_url.clone()))
            .filter(|prev| !prev.is_empty() && prev != url);

        self.storage.set(StorageKind::Session, &key, url);
        self.state.page_url = url.to_string();

        let mut draft = EventDraft::page_view(page_view).with_page_url(url);
        if let Some(previous) = previous {
            draft = draft.with_from_page_url(previous);
        }
        self.track(draft);
    }

    pub fn flush_pending_events(&mut self) {
        self.queue.flush_pending_events(&mut self.state);
    }

    pub fn flush_immediately(&mut self) -> impl Future<Output = bool> + Send + 'static {
        self.queue.flush_immediately(&self.state)
    }

    pub fn flush_immediately_sync(&mut self) -> bool {
        self.queue.flush_immediately_sync(&self.state)
    }

    pub fn queue_length(&self) -> usize {
        self.queue.len()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.queue.subscribe()
    }

    // ---- session boundary ----

    pub fn start_tracking(&mut self) -> Result<()> {
        self.session
            .start_tracking(&mut self.state, &mut self.queue)
    }

    pub fn stop_tracking(&mut self) {
        self.session
            .stop_tracking(&mut self.state, &mut self.queue);
    }

    pub fn destroy(&mut self) {
        self.session.destroy(&mut self.state);
    }

    // ---- signals ----

    pub fn activity(&mut self) {
        self.session.activity(&mut self.state, &mut self.queue);
    }

    pub fn visibility_changed(&mut self, hidden: bool) {
        self.session.visibility_changed(&self.state, hidden);
    }

    pub fn page_unload(&mut self) {
        self.session
            .end_session(&mut self.state, &mut self.queue, SessionEndReason::PageUnload);
    }

    pub fn inactivity_deadline(&self) -> Option<i64> {
        self.session.inactivity_deadline()
    }

    pub fn on_inactivity_timeout(&mut self) {
        self.session
            .on_inactivity_timeout(&mut self.state, &mut self.queue);
    }

    pub fn on_flush_interval(&mut self) -> Option<impl Future<Output = bool> + Send + 'static> {
        self.queue.flush_if_due(&self.state)
    }

    pub fn on_broadcast(&mut self, message: BroadcastMessage) {
        self.session.on_broadcast(&mut self.state, message);
    }

    pub fn poll_broadcasts(&mut self) {
        self.session.poll_broadcasts(&mut self.state);
    }

    pub async fn next_broadcast(&mut self) -> Option<BroadcastMessage> {
        self.session.next_broadcast().await
    }

    /// Resend the batch a previous run left behind
    pub fn recover_persisted_events(&self) -> impl Future<Output = RecoveryOutcome> + Send + 'static {
        let delivery = self.delivery.clone();
        async move { delivery.recover_persisted_events().await }
    }
}

fn load_or_create_user_id(storage: &StorageManager) -> String {
    if let Some(id) = storage
        .get(StorageKind::Durable, USER_ID_KEY)
        .filter(|id| !id.is_empty())
    {
        return id;
    }

    let id = uuid::Uuid::new_v4().to_string();
    if !storage.set(StorageKind::Durable, USER_ID_KEY, &id) {
        tracing::warn!("User id kept in memory only, durable storage rejected it");
    }
    tracing::debug!(user_id = %id, "Created user id");
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ManualClock;
    use crate::transport::SendOutcome;
    use async_trait::async_trait;

    struct NullTransport;

    #[async_trait]
    impl Transport for NullTransport {
        async fn send(&self, _body: String) -> SendOutcome {
            SendOutcome::Delivered
        }

        fn send_beacon(&self, _body: String) -> bool {
            true
        }
    }

    fn tracker(storage: Arc<StorageManager>) -> Tracker {
        Tracker::new(TrackerParts {
            config: Config::default(),
            transport: Arc::new(NullTransport),
            storage,
            channel: Arc::new(LocalBroadcastHub::new()),
            clock: Arc::new(ManualClock::new(1_700_000_000_000)),
        })
    }

    #[test]
    fn test_user_id_is_created_once() {
        let storage = Arc::new(StorageManager::in_memory());
        let first = tracker(storage.clone()).user_id().to_string();
        assert!(uuid::Uuid::parse_str(&first).is_ok());
        assert_eq!(storage.get(StorageKind::Durable, USER_ID_KEY), Some(first.clone()));

        let second = tracker(storage).user_id().to_string();
        assert_eq!(first, second);
    }

    #[test]
    fn test_navigate_records_previous_page() {
        let mut t = tracker(Arc::new(StorageManager::in_memory()));
        t.start_tracking().unwrap();
        t.navigate("https://shop.example/", PageViewData::default());
        t.navigate("https://shop.example/cart", PageViewData::default());

        let views: Vec<&Event> = t
            .queue()
            .events()
            .filter(|e| e.event_type() == crate::types::EventType::PageView)
            .collect();
        assert_eq!(views.len(), 2);
        assert_eq!(views[0].from_page_url, None);
        assert_eq!(
            views[1].from_page_url.as_deref(),
            Some("https://shop.example/")
        );
        assert_eq!(views[1].page_url, "https://shop.example/cart");
        assert_eq!(t.state().page_url, "https://shop.example/cart");
    }

    #[test]
    fn test_tracking_before_start_is_replayed() {
        let mut t = tracker(Arc::new(StorageManager::in_memory()));
        t.track(EventDraft::custom("early", None));
        assert_eq!(t.queue_length(), 0);
        t.start_tracking().unwrap();
        // session_start plus the replayed draft
        assert_eq!(t.queue_length(), 2);
    }
}
