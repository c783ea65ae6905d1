//! Transport boundary: the chat connection that delivers inbound events and accepts outbound sends.
//!
//! A transport hands out exactly one inbound event receiver (`subscribe`) and exposes
//! send-to-user, send-to-group and send-to-temp plus image upload.

mod memory;
mod mirai;

pub use memory::{Destination, MemoryTransport, SentMessage};
pub use mirai::MiraiTransport;

use crate::message::{ContentItem, GroupInfo, Message, Sender, SourceType, UserInfo};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Capacity of the inbound event queue between a transport and its subscriber.
pub const EVENT_QUEUE_CAPACITY: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("transport api error {code}: {msg}")]
    Api { code: i64, msg: String },
    #[error("transport not connected")]
    NotConnected,
    #[error("transport event stream already subscribed")]
    AlreadySubscribed,
    #[error("transport closed")]
    Closed,
}

/// Raw inbound event as delivered by a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Friend {
        sender: UserInfo,
        chain: Vec<ContentItem>,
    },
    Group {
        sender: UserInfo,
        group: GroupInfo,
        chain: Vec<ContentItem>,
    },
    Temp {
        sender: UserInfo,
        group: GroupInfo,
        chain: Vec<ContentItem>,
    },
}

impl TransportEvent {
    /// Build the canonical message for this event.
    pub fn into_message(self) -> Message {
        match self {
            TransportEvent::Friend { sender, chain } => Message::new(Sender::Friend(sender), chain),
            TransportEvent::Group {
                sender,
                group,
                chain,
            } => Message::new(
                Sender::Group {
                    member: sender,
                    group,
                },
                chain,
            ),
            TransportEvent::Temp {
                sender,
                group,
                chain,
            } => Message::new(
                Sender::Temp {
                    member: sender,
                    group,
                },
                chain,
            ),
        }
    }
}

/// Destination kind hint for image uploads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadTarget {
    Friend,
    Group,
    Temp,
}

impl UploadTarget {
    pub fn as_str(self) -> &'static str {
        match self {
            UploadTarget::Friend => "friend",
            UploadTarget::Group => "group",
            UploadTarget::Temp => "temp",
        }
    }
}

impl From<SourceType> for UploadTarget {
    fn from(source: SourceType) -> Self {
        match source {
            SourceType::Friend => UploadTarget::Friend,
            SourceType::Group => UploadTarget::Group,
            SourceType::Temp => UploadTarget::Temp,
        }
    }
}

/// A chat connection. Shared by the dispatcher and every running procedure.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Transport id for logs (e.g. "mirai").
    fn id(&self) -> &str;

    /// Take the inbound event receiver. Succeeds once; later calls fail with `AlreadySubscribed`.
    async fn subscribe(&self) -> Result<mpsc::Receiver<TransportEvent>, TransportError>;

    async fn send_to_user(&self, user_id: i64, chain: &[ContentItem])
        -> Result<(), TransportError>;

    async fn send_to_group(
        &self,
        group_id: i64,
        chain: &[ContentItem],
    ) -> Result<(), TransportError>;

    async fn send_to_temp(
        &self,
        user_id: i64,
        group_id: i64,
        chain: &[ContentItem],
    ) -> Result<(), TransportError>;

    /// Upload raw image bytes; the returned item can be used in later sends.
    async fn upload_image(
        &self,
        bytes: Vec<u8>,
        target: UploadTarget,
    ) -> Result<ContentItem, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: i64) -> UserInfo {
        UserInfo {
            id,
            name: String::new(),
        }
    }

    #[test]
    fn group_event_keeps_group_identity() {
        let event = TransportEvent::Group {
            sender: user(100),
            group: GroupInfo {
                id: 55,
                name: "rust".to_string(),
            },
            chain: vec![ContentItem::plain("hi")],
        };
        let msg = event.into_message();
        assert_eq!(msg.source(), SourceType::Group);
        assert_eq!(msg.sender().user_id(), 100);
        assert_eq!(msg.sender().group().map(|g| g.name.as_str()), Some("rust"));
        assert_eq!(msg.text(), "hi");
    }

    #[test]
    fn upload_target_from_source() {
        assert_eq!(UploadTarget::from(SourceType::Temp).as_str(), "temp");
        assert_eq!(UploadTarget::from(SourceType::Friend), UploadTarget::Friend);
    }
}
