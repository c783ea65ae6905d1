//! In-process transport: inbound events are pushed by the caller, outbound sends are recorded.
//!
//! Used by the console mode of the CLI and by tests.

use crate::message::ContentItem;
use crate::transport::{
    Transport, TransportError, TransportEvent, UploadTarget, EVENT_QUEUE_CAPACITY,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};

/// Where an outbound send went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    User(i64),
    Group(i64),
    Temp { user_id: i64, group_id: i64 },
}

/// One recorded outbound send.
#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    pub destination: Destination,
    pub chain: Vec<ContentItem>,
}

impl SentMessage {
    pub fn text(&self) -> String {
        crate::message::chain_text(&self.chain)
    }
}

pub struct MemoryTransport {
    events_tx: mpsc::Sender<TransportEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
    sent: Mutex<Vec<SentMessage>>,
    sent_tx: broadcast::Sender<SentMessage>,
    uploads: AtomicU64,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (sent_tx, _) = broadcast::channel(EVENT_QUEUE_CAPACITY);
        Self {
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            sent: Mutex::new(Vec::new()),
            sent_tx,
            uploads: AtomicU64::new(0),
        }
    }

    /// Deliver an inbound event to the subscriber.
    pub async fn push(&self, event: TransportEvent) -> Result<(), TransportError> {
        self.events_tx
            .send(event)
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// All sends recorded so far, in order.
    pub async fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().await.clone()
    }

    /// Live feed of outbound sends (only sends after this call are observed).
    pub fn watch_sent(&self) -> broadcast::Receiver<SentMessage> {
        self.sent_tx.subscribe()
    }

    /// Poll until at least `count` sends were recorded or `timeout` elapses; returns what was recorded.
    pub async fn wait_for_sent(&self, count: usize, timeout: Duration) -> Vec<SentMessage> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let sent = self.sent().await;
            if sent.len() >= count || tokio::time::Instant::now() >= deadline {
                return sent;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn record(&self, destination: Destination, chain: &[ContentItem]) {
        let sent = SentMessage {
            destination,
            chain: chain.to_vec(),
        };
        self.sent.lock().await.push(sent.clone());
        // No watchers is fine.
        let _ = self.sent_tx.send(sent);
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn id(&self) -> &str {
        "memory"
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<TransportEvent>, TransportError> {
        self.events_rx
            .lock()
            .await
            .take()
            .ok_or(TransportError::AlreadySubscribed)
    }

    async fn send_to_user(
        &self,
        user_id: i64,
        chain: &[ContentItem],
    ) -> Result<(), TransportError> {
        self.record(Destination::User(user_id), chain).await;
        Ok(())
    }

    async fn send_to_group(
        &self,
        group_id: i64,
        chain: &[ContentItem],
    ) -> Result<(), TransportError> {
        self.record(Destination::Group(group_id), chain).await;
        Ok(())
    }

    async fn send_to_temp(
        &self,
        user_id: i64,
        group_id: i64,
        chain: &[ContentItem],
    ) -> Result<(), TransportError> {
        self.record(Destination::Temp { user_id, group_id }, chain)
            .await;
        Ok(())
    }

    async fn upload_image(
        &self,
        bytes: Vec<u8>,
        target: UploadTarget,
    ) -> Result<ContentItem, TransportError> {
        let n = self.uploads.fetch_add(1, Ordering::SeqCst);
        Ok(ContentItem::Image {
            image_id: Some(format!("memory-{}-{}-{}", target.as_str(), n, bytes.len())),
            url: None,
        })
    }
}
