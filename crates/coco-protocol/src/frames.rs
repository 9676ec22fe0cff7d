//! Frame types for the live connection.
//!
//! Every frame is a JSON envelope `{"type": <tag>, "data": <body>}`. Bodies use
//! camelCase field names to match the HTTP API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Frame type identifiers, mainly useful for logging and metrics labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    NewMessage,
    TypingStatus,
    ReadReceipt,
    Notification,
}

impl FrameType {
    /// The tag used in the `type` field of the envelope.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameType::NewMessage => "new_message",
            FrameType::TypingStatus => "typing_status",
            FrameType::ReadReceipt => "read_receipt",
            FrameType::Notification => "notification",
        }
    }
}

impl std::fmt::Display for FrameType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of content carried by a chat message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    #[default]
    Text,
    /// Content is an image encoded as a `data:` URL.
    Image,
}

/// Delivery status reported by the server for a persisted message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireStatus {
    Sent,
    Delivered,
    Read,
}

/// A persisted chat message as returned by the API and relayed on the socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    /// Server-assigned identifier.
    pub id: String,
    /// Conversation the message belongs to.
    pub chat_id: String,
    /// Author of the message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
    /// Text, or a `data:` URL for images.
    pub content: String,
    #[serde(rename = "type", default)]
    pub kind: ContentKind,
    /// Creation time as set by the sending client.
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<WireStatus>,
}

/// Typing indicator for a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingStatus {
    pub chat_id: String,
    pub is_typing: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// Messages of a conversation were read by a participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
    pub chat_id: String,
    pub message_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reader_id: Option<String>,
}

/// A user-facing notification pushed by the platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireNotification {
    pub id: String,
    /// Notification type, e.g. `ride_request` or `emergency`.
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub read: bool,
}

/// A live connection frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Frame {
    /// A chat message.
    NewMessage(WireMessage),
    /// Typing indicator.
    TypingStatus(TypingStatus),
    /// Read receipt for one or more messages.
    ReadReceipt(ReadReceipt),
    /// System notification for the current user.
    Notification(WireNotification),
}

impl Frame {
    /// Get the frame type.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::NewMessage(_) => FrameType::NewMessage,
            Frame::TypingStatus(_) => FrameType::TypingStatus,
            Frame::ReadReceipt(_) => FrameType::ReadReceipt,
            Frame::Notification(_) => FrameType::Notification,
        }
    }

    /// The conversation this frame targets, if any.
    ///
    /// Notifications belong to the implicit current-user stream and return `None`.
    #[must_use]
    pub fn chat_id(&self) -> Option<&str> {
        match self {
            Frame::NewMessage(m) => Some(&m.chat_id),
            Frame::TypingStatus(t) => Some(&t.chat_id),
            Frame::ReadReceipt(r) => Some(&r.chat_id),
            Frame::Notification(_) => None,
        }
    }

    /// Create a typing frame for the local user.
    #[must_use]
    pub fn typing(chat_id: impl Into<String>, is_typing: bool) -> Self {
        Frame::TypingStatus(TypingStatus {
            chat_id: chat_id.into(),
            is_typing,
            user_id: None,
        })
    }

    /// Create a read receipt frame.
    #[must_use]
    pub fn read_receipt(chat_id: impl Into<String>, message_ids: Vec<String>) -> Self {
        Frame::ReadReceipt(ReadReceipt {
            chat_id: chat_id.into(),
            message_ids,
            reader_id: None,
        })
    }
}
