//! # Messaging Module
//!
//! Domain types for messages and conversations.
//!
//! ## Message Anatomy
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         MESSAGE STRUCTURE                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Message                                                               │
//! │  ─────────────────────────────────                                      │
//! │  messageId      "uuid-v4"            Globally unique                   │
//! │  spaceId        "Qm..."              Space (== channelId for DMs)      │
//! │  channelId      "Qm..."              Channel within the space          │
//! │  createdDate    1712345678901        Logical timestamp (ms),           │
//! │                                      monotonic per sender              │
//! │  content        { type: "post" ... } Closed tagged union               │
//! │  reactions      [...]                Aggregated per emoji              │
//! │  mentions       { memberIds, ... }                                     │
//! │  replyMetadata  { parentAuthor, parentChannelId }?                     │
//! │  isPinned / pinnedAt / pinnedBy      Pin state machine                 │
//! │                                                                         │
//! │  Direct conversations: spaceId == channelId == counterparty address,  │
//! │  and the conversation id is "spaceId/channelId".                      │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The content union is closed: every task handler and store accessor
//! matches on it exhaustively, so adding a message kind is a compile-time
//! event, not a runtime surprise.

use serde::{Deserialize, Serialize};

// ============================================================================
// MESSAGE CONTENT
// ============================================================================

/// Message text that may arrive as a single string or as multiple lines.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum MessageText {
    /// A single block of text
    Plain(String),
    /// Multiple lines, joined with spaces for indexing and previews
    Lines(Vec<String>),
}

impl MessageText {
    /// Flatten to a single string.
    pub fn as_plain(&self) -> String {
        match self {
            Self::Plain(s) => s.clone(),
            Self::Lines(lines) => lines.join(" "),
        }
    }
}

impl From<&str> for MessageText {
    fn from(s: &str) -> Self {
        Self::Plain(s.to_string())
    }
}

/// Whether a mute content message mutes or unmutes the target.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MuteAction {
    /// Mute the target user
    Mute,
    /// Lift an existing mute
    Unmute,
}

/// Whether a pin content message pins or unpins the target.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PinAction {
    /// Pin the target message
    Pin,
    /// Unpin the target message
    Unpin,
}

/// The tagged content union carried by every message.
///
/// Wire and storage representation uses a `type` tag with the original
/// kebab-case names, e.g. `{"type":"post","senderId":...,"text":...}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum MessageContent {
    /// A user-authored text post
    #[serde(rename = "post")]
    Post {
        /// Sender address
        #[serde(rename = "senderId")]
        sender_id: String,
        /// Post text
        text: MessageText,
        /// Message id this post replies to
        #[serde(rename = "repliesToMessageId", skip_serializing_if = "Option::is_none")]
        replies_to_message_id: Option<String>,
    },
    /// A system event rendered inline (joins, renames, ...)
    #[serde(rename = "event")]
    Event {
        /// Sender address
        #[serde(rename = "senderId")]
        sender_id: String,
        /// Event text
        text: String,
        /// Message id this event relates to
        #[serde(rename = "repliesToMessageId", skip_serializing_if = "Option::is_none")]
        replies_to_message_id: Option<String>,
    },
    /// Embedded media (image, gif, video)
    #[serde(rename = "embed")]
    Embed {
        /// Sender address
        #[serde(rename = "senderId")]
        sender_id: String,
        /// Full-size image URL
        #[serde(rename = "imageUrl", skip_serializing_if = "Option::is_none")]
        image_url: Option<String>,
        /// Thumbnail URL
        #[serde(rename = "thumbnailUrl", skip_serializing_if = "Option::is_none")]
        thumbnail_url: Option<String>,
        /// Video URL
        #[serde(rename = "videoUrl", skip_serializing_if = "Option::is_none")]
        video_url: Option<String>,
        /// Message id this embed replies to
        #[serde(rename = "repliesToMessageId", skip_serializing_if = "Option::is_none")]
        replies_to_message_id: Option<String>,
    },
    /// An emoji reaction to another message
    #[serde(rename = "reaction")]
    Reaction {
        /// Sender address
        #[serde(rename = "senderId")]
        sender_id: String,
        /// Emoji id
        reaction: String,
        /// Target message id
        #[serde(rename = "messageId")]
        message_id: String,
    },
    /// Removal of a previously added reaction
    #[serde(rename = "remove-reaction")]
    RemoveReaction {
        /// Sender address
        #[serde(rename = "senderId")]
        sender_id: String,
        /// Emoji id
        reaction: String,
        /// Target message id
        #[serde(rename = "messageId")]
        message_id: String,
    },
    /// Request to remove a message
    #[serde(rename = "remove-message")]
    RemoveMessage {
        /// Sender address
        #[serde(rename = "senderId")]
        sender_id: String,
        /// Message id to remove
        #[serde(rename = "removeMessageId")]
        remove_message_id: String,
    },
    /// A member joined the conversation
    #[serde(rename = "join")]
    Join {
        /// Sender address
        #[serde(rename = "senderId")]
        sender_id: String,
    },
    /// A member left the conversation
    #[serde(rename = "leave")]
    Leave {
        /// Sender address
        #[serde(rename = "senderId")]
        sender_id: String,
    },
    /// A member was kicked
    #[serde(rename = "kick")]
    Kick {
        /// Sender address
        #[serde(rename = "senderId")]
        sender_id: String,
    },
    /// A moderation mute/unmute action
    #[serde(rename = "mute")]
    Mute {
        /// Sender address (the moderator)
        #[serde(rename = "senderId")]
        sender_id: String,
        /// The muted/unmuted user
        #[serde(rename = "targetUserId")]
        target_user_id: String,
        /// Unique id for replay deduplication
        #[serde(rename = "muteId")]
        mute_id: String,
        /// When the action was taken (ms)
        timestamp: i64,
        /// Mute or unmute
        action: MuteAction,
    },
    /// Sender updated their display profile
    #[serde(rename = "update-profile")]
    UpdateProfile {
        /// Sender address
        #[serde(rename = "senderId")]
        sender_id: String,
        /// New display name
        #[serde(rename = "displayName")]
        display_name: String,
        /// New avatar URL
        #[serde(rename = "userIcon")]
        user_icon: String,
    },
    /// A sticker
    #[serde(rename = "sticker")]
    Sticker {
        /// Sender address
        #[serde(rename = "senderId")]
        sender_id: String,
        /// Sticker id, resolved at render time
        #[serde(rename = "stickerId")]
        sticker_id: String,
        /// Message id this sticker replies to
        #[serde(rename = "repliesToMessageId", skip_serializing_if = "Option::is_none")]
        replies_to_message_id: Option<String>,
    },
    /// A pin/unpin action targeting another message
    #[serde(rename = "pin")]
    Pin {
        /// Sender address
        #[serde(rename = "senderId")]
        sender_id: String,
        /// Target message id
        #[serde(rename = "targetMessageId")]
        target_message_id: String,
        /// Pin or unpin
        action: PinAction,
    },
}

impl MessageContent {
    /// The sender address, regardless of variant.
    pub fn sender_id(&self) -> &str {
        match self {
            Self::Post { sender_id, .. }
            | Self::Event { sender_id, .. }
            | Self::Embed { sender_id, .. }
            | Self::Reaction { sender_id, .. }
            | Self::RemoveReaction { sender_id, .. }
            | Self::RemoveMessage { sender_id, .. }
            | Self::Join { sender_id }
            | Self::Leave { sender_id }
            | Self::Kick { sender_id }
            | Self::Mute { sender_id, .. }
            | Self::UpdateProfile { sender_id, .. }
            | Self::Sticker { sender_id, .. }
            | Self::Pin { sender_id, .. } => sender_id,
        }
    }

    /// Searchable plain text, if this content kind carries any.
    ///
    /// Only posts and events are indexed; everything else returns None.
    pub fn searchable_text(&self) -> Option<String> {
        match self {
            Self::Post { text, .. } => Some(text.as_plain()),
            Self::Event { text, .. } => Some(text.clone()),
            _ => None,
        }
    }
}

// ============================================================================
// MESSAGE
// ============================================================================

/// An aggregated emoji reaction on a message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Reaction {
    /// Emoji id
    pub emoji_id: String,
    /// Emoji display name
    pub emoji_name: String,
    /// Space the emoji belongs to (empty for DMs)
    pub space_id: String,
    /// Number of members who reacted
    pub count: u32,
    /// Addresses of the members who reacted
    pub member_ids: Vec<String>,
}

/// Mention metadata extracted at compose time.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct Mentions {
    /// Mentioned member addresses
    pub member_ids: Vec<String>,
    /// Mentioned role ids
    pub role_ids: Vec<String>,
    /// Mentioned channel ids
    pub channel_ids: Vec<String>,
    /// Whether @everyone was used
    #[serde(skip_serializing_if = "Option::is_none")]
    pub everyone: Option<bool>,
}

/// Reply linkage stored alongside a message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReplyMetadata {
    /// Author of the replied-to message
    pub parent_author: String,
    /// Channel of the replied-to message
    pub parent_channel_id: String,
}

/// An immutable content envelope persisted in the messages table.
///
/// Messages are only ever mutated in place for pin-status toggles and
/// reaction aggregation; everything else is append/delete.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Globally unique message id
    pub message_id: String,
    /// Space this message belongs to
    pub space_id: String,
    /// Channel within the space (== spaceId for direct conversations)
    pub channel_id: String,
    /// Logical creation timestamp (ms), monotonic per sender
    pub created_date: i64,
    /// Last modification timestamp (ms)
    pub modified_date: i64,
    /// Encryption nonce from the secure channel (hex)
    pub nonce: String,
    /// Digest algorithm used for the content hash
    pub digest_algorithm: String,
    /// Hash of the last modification
    pub last_modified_hash: String,
    /// The tagged content union
    pub content: MessageContent,
    /// Aggregated reactions
    #[serde(default)]
    pub reactions: Vec<Reaction>,
    /// Mention metadata
    #[serde(default)]
    pub mentions: Mentions,
    /// Reply linkage
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_metadata: Option<ReplyMetadata>,
    /// Whether the message is currently pinned
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_pinned: Option<bool>,
    /// When the message was pinned (ms)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pinned_at: Option<i64>,
    /// Who pinned the message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pinned_by: Option<String>,
}

impl Message {
    /// Whether this message lives in a direct conversation.
    ///
    /// For DMs, `spaceId == channelId` and both equal the counterparty
    /// address; channel messages always have distinct ids.
    pub fn is_direct(&self) -> bool {
        self.space_id == self.channel_id
    }

    /// The conversation id this message belongs to.
    pub fn conversation_id(&self) -> String {
        conversation_id(&self.space_id, &self.channel_id)
    }
}

/// Builds the canonical conversation id for a (space, channel) pair.
pub fn conversation_id(space_id: &str, channel_id: &str) -> String {
    format!("{}/{}", space_id, channel_id)
}

// ============================================================================
// CONVERSATION
// ============================================================================

/// Conversation kind.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ConversationType {
    /// Peer-to-peer conversation
    Direct,
    /// Space/channel conversation
    Group,
}

impl ConversationType {
    /// Database string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Group => "group",
        }
    }

    /// Parse from the database string representation.
    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "direct" => Some(Self::Direct),
            "group" => Some(Self::Group),
            _ => None,
        }
    }
}

/// One row per conversation: the sidebar-facing projection of a message
/// stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    /// Conversation id: "spaceId/channelId", or the counterparty address
    /// pair for DMs
    pub conversation_id: String,
    /// Direct or group
    #[serde(rename = "type")]
    pub conversation_type: ConversationType,
    /// Last-message timestamp (ms); the `by_type_time` index mirrors this
    pub timestamp: i64,
    /// Counterparty or space address
    pub address: String,
    /// Display icon URL
    pub icon: String,
    /// Display name
    pub display_name: String,
    /// Last timestamp the local user read up to (ms)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_read_timestamp: Option<i64>,
    /// Id of the most recent message, for sidebar previews
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message_id: Option<String>,
}

// ============================================================================
// PAGINATION
// ============================================================================

/// Direction of a cursor-based page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaginationDirection {
    /// Strictly newer than the cursor
    Forward,
    /// Strictly older than the cursor
    Backward,
}

/// A page of messages in ascending chronological order, with continuation
/// cursors.
///
/// `next_cursor` continues in the *requested* direction and is only present
/// when the page was full; `prev_cursor` marks the boundary of the returned
/// page for paging the other way.
#[derive(Debug, Clone)]
pub struct MessagePage {
    /// Messages in ascending `created_date` order
    pub messages: Vec<Message>,
    /// Continuation cursor (only when the page was full)
    pub next_cursor: Option<i64>,
    /// Boundary cursor of the returned page
    pub prev_cursor: Option<i64>,
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn post(sender: &str, text: &str) -> MessageContent {
        MessageContent::Post {
            sender_id: sender.to_string(),
            text: text.into(),
            replies_to_message_id: None,
        }
    }

    #[test]
    fn test_content_tag_roundtrip() {
        let content = post("addr-alice", "hello");
        let json = serde_json::to_string(&content).unwrap();
        assert!(json.contains("\"type\":\"post\""));
        assert!(json.contains("\"senderId\":\"addr-alice\""));

        let back: MessageContent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, content);
    }

    #[test]
    fn test_kebab_case_tags() {
        let content = MessageContent::RemoveMessage {
            sender_id: "a".into(),
            remove_message_id: "m1".into(),
        };
        let json = serde_json::to_string(&content).unwrap();
        assert!(json.contains("\"type\":\"remove-message\""));
    }

    #[test]
    fn test_message_text_lines_flatten() {
        let text = MessageText::Lines(vec!["one".into(), "two".into()]);
        assert_eq!(text.as_plain(), "one two");

        // string | string[] union on the wire
        let parsed: MessageText = serde_json::from_str(r#"["a","b"]"#).unwrap();
        assert_eq!(parsed.as_plain(), "a b");
    }

    #[test]
    fn test_searchable_text_only_posts_and_events() {
        assert_eq!(post("a", "hi").searchable_text(), Some("hi".to_string()));
        let sticker = MessageContent::Sticker {
            sender_id: "a".into(),
            sticker_id: "s1".into(),
            replies_to_message_id: None,
        };
        assert_eq!(sticker.searchable_text(), None);
    }

    #[test]
    fn test_direct_conversation_identity() {
        let msg = Message {
            message_id: "m1".into(),
            space_id: "addr-bob".into(),
            channel_id: "addr-bob".into(),
            created_date: 100,
            modified_date: 100,
            nonce: String::new(),
            digest_algorithm: "sha-256".into(),
            last_modified_hash: String::new(),
            content: post("addr-bob", "hey"),
            reactions: vec![],
            mentions: Mentions::default(),
            reply_metadata: None,
            is_pinned: None,
            pinned_at: None,
            pinned_by: None,
        };
        assert!(msg.is_direct());
        assert_eq!(msg.conversation_id(), "addr-bob/addr-bob");
    }

    #[test]
    fn test_conversation_type_strings() {
        assert_eq!(ConversationType::Direct.as_str(), "direct");
        assert_eq!(
            ConversationType::from_str_opt("group"),
            Some(ConversationType::Group)
        );
        assert_eq!(ConversationType::from_str_opt("other"), None);
    }
}
