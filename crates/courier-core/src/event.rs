use tokio::sync::broadcast;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MediaRetryResult {
    Success { direct_path: Option<String> },
    Failure { code: u16 },
}

/// Lifecycle notifications forwarded through the relay. The inbound layer
/// publishes media updates here; `update_media_message` waits on them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RelayEvent {
    MediaUpdate {
        message_id: String,
        result: MediaRetryResult,
    },
}

pub type EventReceiver = broadcast::Receiver<RelayEvent>;

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RelayEvent>,
}

impl EventBus {
    pub fn new(size: usize) -> Self {
        let (tx, _) = broadcast::channel(size);
        Self { tx }
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: RelayEvent) {
        let _ = self.tx.send(event);
    }
}
