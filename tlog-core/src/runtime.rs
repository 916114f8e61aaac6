//! Single-task actor that owns a [`Tracker`]
//!
//! API calls and page signals arrive as [`Command`]s on one mailbox. The loop
//! also waits on the flush interval, the inactivity deadline and the
//! cross-tab channel. Every handler runs to completion before the next one
//! starts; the only awaited work (network sends, recovery) is spawned so the
//! mailbox keeps draining.
//!
//! ```rust,ignore
//! let (handle, task) = runtime::spawn(Tracker::open(config)?);
//! handle.start_tracking().await?;
//! handle.track(EventDraft::custom("signup", None)).await;
//! handle.page_unload().await;
//! ```

use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::error::{Error, Result};
use crate::queue::FLUSH_INTERVAL_MS;
use crate::tracker::Tracker;
use crate::types::{Event, EventDraft, PageViewData};

/// Mailbox depth before senders wait
const MAILBOX_CAPACITY: usize = 1024;

/// Messages handled by the tracker task
#[derive(Debug)]
pub enum Command {
    Track(EventDraft),
    Navigate {
        url: String,
        page_view: PageViewData,
    },
    SendCustomEvent {
        name: String,
        metadata: Option<serde_json::Value>,
        reply: oneshot::Sender<Result<()>>,
    },
    FlushPending,
    Flush(oneshot::Sender<bool>),
    FlushSync(oneshot::Sender<bool>),
    QueueLength(oneshot::Sender<usize>),
    SessionId(oneshot::Sender<Option<String>>),
    StartTracking(oneshot::Sender<Result<()>>),
    StopTracking(oneshot::Sender<()>),
    Destroy,
    Activity,
    Visibility { hidden: bool },
    PageUnload(oneshot::Sender<()>),
    Subscribe(oneshot::Sender<broadcast::Receiver<Event>>),
}

/// Cloneable handle to a running tracker task
#[derive(Debug, Clone)]
pub struct TrackerHandle {
    tx: mpsc::Sender<Command>,
}

/// Spawn the tracker task on the current runtime
///
/// The task first resends any batch persisted by an earlier run. It exits
/// when every handle is dropped, after a final synchronous flush.
pub fn spawn(tracker: Tracker) -> (TrackerHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
    let task = tokio::spawn(run(tracker, rx));
    (TrackerHandle { tx }, task)
}

impl TrackerHandle {
    async fn send(&self, command: Command) {
        if self.tx.send(command).await.is_err() {
            tracing::debug!("Tracker task has stopped, command dropped");
        }
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Option<T> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(make(reply)).await.ok()?;
        rx.await.ok()
    }

    pub async fn track(&self, draft: EventDraft) {
        self.send(Command::Track(draft)).await;
    }

    pub async fn navigate(&self, url: impl Into<String>, page_view: PageViewData) {
        self.send(Command::Navigate {
            url: url.into(),
            page_view,
        })
        .await;
    }

    pub async fn send_custom_event(
        &self,
        name: impl Into<String>,
        metadata: Option<serde_json::Value>,
    ) -> Result<()> {
        let name = name.into();
        self.request(|reply| Command::SendCustomEvent {
            name,
            metadata,
            reply,
        })
        .await
        .unwrap_or(Ok(()))
    }

    pub async fn flush_pending_events(&self) {
        self.send(Command::FlushPending).await;
    }

    pub async fn flush_immediately(&self) -> bool {
        self.request(Command::Flush).await.unwrap_or(false)
    }

    pub async fn flush_immediately_sync(&self) -> bool {
        self.request(Command::FlushSync).await.unwrap_or(false)
    }

    pub async fn queue_length(&self) -> usize {
        self.request(Command::QueueLength).await.unwrap_or(0)
    }

    pub async fn session_id(&self) -> Option<String> {
        self.request(Command::SessionId).await.flatten()
    }

    pub async fn start_tracking(&self) -> Result<()> {
        self.request(Command::StartTracking)
            .await
            .unwrap_or_else(|| Err(Error::SessionStart("tracker task has stopped".to_string())))
    }

    pub async fn stop_tracking(&self) {
        self.request(Command::StopTracking).await;
    }

    pub async fn destroy(&self) {
        self.send(Command::Destroy).await;
    }

    pub async fn activity(&self) {
        self.send(Command::Activity).await;
    }

    pub async fn visibility_changed(&self, hidden: bool) {
        self.send(Command::Visibility { hidden }).await;
    }

    /// Returns once the session has ended and the final flush was handed off
    pub async fn page_unload(&self) {
        self.request(Command::PageUnload).await;
    }

    pub async fn subscribe(&self) -> Option<broadcast::Receiver<Event>> {
        self.request(Command::Subscribe).await
    }
}

async fn run(mut tracker: Tracker, mut rx: mpsc::Receiver<Command>) {
    let recovery = tracker.recover_persisted_events();
    tokio::spawn(async move {
        let outcome = recovery.await;
        tracing::debug!(?outcome, "Startup recovery finished");
    });

    let period = Duration::from_millis(FLUSH_INTERVAL_MS);
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // (deadline in clock ms, matching runtime instant), re-derived only when
    // the tracker moves its deadline
    let mut armed: Option<(i64, Instant)> = None;

    loop {
        let deadline = tracker.inactivity_deadline();
        if armed.map(|(ms, _)| ms) != deadline {
            armed = deadline.map(|ms| {
                let remaining = (ms - tracker.now_ms()).max(0) as u64;
                (ms, Instant::now() + Duration::from_millis(remaining))
            });
        }
        let inactivity = armed.map(|(_, at)| at);

        tokio::select! {
            command = rx.recv() => match command {
                Some(command) => handle(&mut tracker, command),
                None => break,
            },
            _ = interval.tick() => {
                if let Some(flush) = tracker.on_flush_interval() {
                    tokio::spawn(flush);
                }
            }
            _ = sleep_until(inactivity) => tracker.on_inactivity_timeout(),
            Some(message) = tracker.next_broadcast() => tracker.on_broadcast(message),
        }
    }

    if !tracker.flush_immediately_sync() {
        tracing::warn!("Final flush on shutdown failed");
    }
    tracker.destroy();
    tracing::debug!("Tracker task stopped");
}

fn handle(tracker: &mut Tracker, command: Command) {
    match command {
        Command::Track(draft) => tracker.track(draft),
        Command::Navigate { url, page_view } => tracker.navigate(&url, page_view),
        Command::SendCustomEvent {
            name,
            metadata,
            reply,
        } => {
            let _ = reply.send(tracker.send_custom_event(&name, metadata));
        }
        Command::FlushPending => tracker.flush_pending_events(),
        Command::Flush(reply) => {
            let flush = tracker.flush_immediately();
            tokio::spawn(async move {
                let _ = reply.send(flush.await);
            });
        }
        Command::FlushSync(reply) => {
            let _ = reply.send(tracker.flush_immediately_sync());
        }
        Command::QueueLength(reply) => {
            let _ = reply.send(tracker.queue_length());
        }
        Command::SessionId(reply) => {
            let _ = reply.send(tracker.session_id().map(str::to_string));
        }
        Command::StartTracking(reply) => {
            let _ = reply.send(tracker.start_tracking());
        }
        Command::StopTracking(reply) => {
            tracker.stop_tracking();
            let _ = reply.send(());
        }
        Command::Destroy => tracker.destroy(),
        Command::Activity => tracker.activity(),
        Command::Visibility { hidden } => tracker.visibility_changed(hidden),
        Command::PageUnload(reply) => {
            tracker.page_unload();
            let _ = reply.send(());
        }
        Command::Subscribe(reply) => {
            let _ = reply.send(tracker.subscribe());
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
