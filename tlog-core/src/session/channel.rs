//! Cross-tab broadcast channel
//!
//! Every tab of a project opens the same named channel. A message posted on
//! a port is delivered to every open port of that name, the sender's own
//! included, so consumers must treat their own messages as no-ops.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use tokio::sync::broadcast;

use crate::error::{Error, Result};
use crate::types::BroadcastMessage;

/// Messages buffered per channel before slow ports start lagging
const CHANNEL_CAPACITY: usize = 64;

static PROCESS_HUB: OnceLock<Arc<LocalBroadcastHub>> = OnceLock::new();

/// Source of named broadcast channels shared by the tabs of one origin
pub trait CrossTabChannel: Send + Sync {
    /// Open a port on `name`. Failing here aborts session start.
    fn open(&self, name: &str) -> Result<ChannelPort>;
}

/// One tab's handle on a named channel
#[derive(Debug)]
pub struct ChannelPort {
    name: String,
    sender: broadcast::Sender<BroadcastMessage>,
    receiver: broadcast::Receiver<BroadcastMessage>,
}

impl ChannelPort {
    pub fn new(name: impl Into<String>, sender: broadcast::Sender<BroadcastMessage>) -> Self {
        let receiver = sender.subscribe();
        Self {
            name: name.into(),
            sender,
            receiver,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Post to every open port, this one included
    pub fn post(&self, message: &BroadcastMessage) {
        if let Err(e) = self.sender.send(message.clone()) {
            tracing::debug!(channel = %self.name, error = %e, "Broadcast had no receivers");
        }
    }

    /// Next message if one is already waiting
    pub fn try_recv(&mut self) -> Option<BroadcastMessage> {
        loop {
            match self.receiver.try_recv() {
                Ok(message) => return Some(message),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    tracing::warn!(channel = %self.name, skipped, "Broadcast port lagged");
                }
                Err(_) => return None,
            }
        }
    }

    /// Wait for the next message; `None` once the channel is closed
    pub async fn recv(&mut self) -> Option<BroadcastMessage> {
        loop {
            match self.receiver.recv().await {
                Ok(message) => return Some(message),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(channel = %self.name, skipped, "Broadcast port lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// In-process hub: trackers sharing one hub behave like tabs of one origin
#[derive(Debug, Default)]
pub struct LocalBroadcastHub {
    channels: Mutex<HashMap<String, broadcast::Sender<BroadcastMessage>>>,
}

impl LocalBroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// The hub shared by every tracker of this process
    pub fn process() -> Arc<Self> {
        PROCESS_HUB.get_or_init(|| Arc::new(Self::new())).clone()
    }
}

impl CrossTabChannel for LocalBroadcastHub {
    fn open(&self, name: &str) -> Result<ChannelPort> {
        let mut channels = self
            .channels
            .lock()
            .map_err(|_| Error::SessionStart(format!("broadcast hub poisoned opening {name}")))?;

        let sender = channels
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone();

        Ok(ChannelPort::new(name, sender))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BroadcastAction;

    fn message(session_id: &str) -> BroadcastMessage {
        BroadcastMessage {
            action: BroadcastAction::SessionStart,
            project_id: "shop".to_string(),
            session_id: session_id.to_string(),
            timestamp: 1,
            reason: None,
        }
    }

    #[test]
    fn test_ports_on_same_name_see_each_other() {
        let hub = LocalBroadcastHub::new();
        let mut a = hub.open("tlog:shop:broadcast").unwrap();
        let mut b = hub.open("tlog:shop:broadcast").unwrap();
        let mut other = hub.open("tlog:blog:broadcast").unwrap();

        a.post(&message("s-1"));

        assert_eq!(b.try_recv().unwrap().session_id, "s-1");
        // Sender hears itself
        assert_eq!(a.try_recv().unwrap().session_id, "s-1");
        assert!(other.try_recv().is_none());
        assert!(b.try_recv().is_none());
    }

    #[test]
    fn test_process_hub_is_shared() {
        let first = LocalBroadcastHub::process();
        let second = LocalBroadcastHub::process();
        assert!(Arc::ptr_eq(&first, &second));

        let a = first.open("tlog:process-test:broadcast").unwrap();
        let mut b = second.open("tlog:process-test:broadcast").unwrap();
        a.post(&message("s-9"));
        assert_eq!(b.try_recv().unwrap().session_id, "s-9");
    }

    #[tokio::test]
    async fn test_async_recv() {
        let hub = LocalBroadcastHub::new();
        let a = hub.open("c").unwrap();
        let mut b = hub.open("c").unwrap();
        a.post(&message("s-2"));
        assert_eq!(b.recv().await.unwrap().session_id, "s-2");
    }

    #[test]
    fn test_lagging_port_skips_ahead() {
        let hub = LocalBroadcastHub::new();
        let a = hub.open("c").unwrap();
        let mut b = hub.open("c").unwrap();
        for i in 0..(CHANNEL_CAPACITY + 3) {
            a.post(&message(&format!("s-{i}")));
        }
        let first = b.try_recv().unwrap();
        assert_eq!(first.session_id, "s-3");
    }
}
