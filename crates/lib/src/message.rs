//! Normalized inbound message: who sent it (friend, group member, or temp contact) and its content chain.

/// Where a message came from. Fixed for the lifetime of a procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceType {
    Friend,
    Group,
    Temp,
}

/// A chat user (friend or group member).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    pub id: i64,
    /// Nickname for friends, member name for group/temp senders. May be empty.
    pub name: String,
}

/// The group a group or temp message was sent from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupInfo {
    pub id: i64,
    pub name: String,
}

/// Sender identity. Friend messages never carry a group; group and temp messages always do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sender {
    Friend(UserInfo),
    Group { member: UserInfo, group: GroupInfo },
    Temp { member: UserInfo, group: GroupInfo },
}

impl Sender {
    pub fn source(&self) -> SourceType {
        match self {
            Sender::Friend(_) => SourceType::Friend,
            Sender::Group { .. } => SourceType::Group,
            Sender::Temp { .. } => SourceType::Temp,
        }
    }

    pub fn user(&self) -> &UserInfo {
        match self {
            Sender::Friend(user) => user,
            Sender::Group { member, .. } | Sender::Temp { member, .. } => member,
        }
    }

    pub fn user_id(&self) -> i64 {
        self.user().id
    }

    /// The originating group; `None` for friend messages.
    pub fn group(&self) -> Option<&GroupInfo> {
        match self {
            Sender::Friend(_) => None,
            Sender::Group { group, .. } | Sender::Temp { group, .. } => Some(group),
        }
    }

    pub fn group_id(&self) -> Option<i64> {
        self.group().map(|g| g.id)
    }
}

/// One item of a message content chain.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentItem {
    /// Text run.
    Plain(String),
    /// Image, either received or returned by an upload. Either field may be absent depending on the transport.
    Image {
        image_id: Option<String>,
        url: Option<String>,
    },
    /// Built-in emoticon.
    Face { face_id: i64, name: Option<String> },
    /// Mention of a group member.
    At { target: i64 },
    /// Any item this crate does not model; `raw` is the transport payload, sent back verbatim.
    Other {
        kind: String,
        raw: serde_json::Value,
    },
}

impl ContentItem {
    pub fn plain(text: impl Into<String>) -> Self {
        ContentItem::Plain(text.into())
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ContentItem::Plain(text) => Some(text),
            _ => None,
        }
    }
}

/// A normalized inbound event. Immutable once constructed.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    sender: Sender,
    chain: Vec<ContentItem>,
}

impl Message {
    pub fn new(sender: Sender, chain: Vec<ContentItem>) -> Self {
        Self { sender, chain }
    }

    /// Friend message with a single text run.
    pub fn friend_text(user_id: i64, text: impl Into<String>) -> Self {
        Self::new(
            Sender::Friend(UserInfo {
                id: user_id,
                name: String::new(),
            }),
            vec![ContentItem::plain(text)],
        )
    }

    /// Group message with a single text run.
    pub fn group_text(group_id: i64, user_id: i64, text: impl Into<String>) -> Self {
        let (member, group) = member_of(group_id, user_id);
        Self::new(Sender::Group { member, group }, vec![ContentItem::plain(text)])
    }

    /// Temp (group-originated private) message with a single text run.
    pub fn temp_text(group_id: i64, user_id: i64, text: impl Into<String>) -> Self {
        let (member, group) = member_of(group_id, user_id);
        Self::new(Sender::Temp { member, group }, vec![ContentItem::plain(text)])
    }

    pub fn source(&self) -> SourceType {
        self.sender.source()
    }

    pub fn sender(&self) -> &Sender {
        &self.sender
    }

    /// First item of the chain. A one-item chain is valid; an empty chain has no primary content.
    pub fn primary_content(&self) -> Option<&ContentItem> {
        self.chain.first()
    }

    pub fn content_chain(&self) -> &[ContentItem] {
        &self.chain
    }

    /// Concatenation of the text runs in chain order; other items are skipped.
    pub fn text(&self) -> String {
        chain_text(&self.chain)
    }
}

/// Concatenate the text runs of a content chain, skipping non-text items.
pub fn chain_text(chain: &[ContentItem]) -> String {
    chain.iter().filter_map(ContentItem::as_text).collect()
}

fn member_of(group_id: i64, user_id: i64) -> (UserInfo, GroupInfo) {
    (
        UserInfo {
            id: user_id,
            name: String::new(),
        },
        GroupInfo {
            id: group_id,
            name: String::new(),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_follows_sender_variant() {
        assert_eq!(Message::friend_text(1, "a").source(), SourceType::Friend);
        assert_eq!(Message::group_text(9, 1, "a").source(), SourceType::Group);
        assert_eq!(Message::temp_text(9, 1, "a").source(), SourceType::Temp);
    }

    #[test]
    fn friend_sender_has_no_group() {
        let msg = Message::friend_text(100, "hi");
        assert_eq!(msg.sender().user_id(), 100);
        assert_eq!(msg.sender().group_id(), None);
        let msg = Message::temp_text(7, 100, "hi");
        assert_eq!(msg.sender().group_id(), Some(7));
    }

    #[test]
    fn text_skips_non_text_items() {
        let msg = Message::new(
            Sender::Friend(UserInfo {
                id: 1,
                name: "a".to_string(),
            }),
            vec![
                ContentItem::plain("hello "),
                ContentItem::Image {
                    image_id: Some("{abc}.png".to_string()),
                    url: None,
                },
                ContentItem::At { target: 5 },
                ContentItem::plain("world"),
            ],
        );
        assert_eq!(msg.text(), "hello world");
        assert_eq!(msg.primary_content(), Some(&ContentItem::plain("hello ")));
    }

    #[test]
    fn single_item_and_empty_chains() {
        let msg = Message::friend_text(1, "only");
        assert_eq!(msg.primary_content(), Some(&ContentItem::plain("only")));
        let empty = Message::new(msg.sender().clone(), Vec::new());
        assert_eq!(empty.primary_content(), None);
        assert_eq!(empty.text(), "");
    }
}
