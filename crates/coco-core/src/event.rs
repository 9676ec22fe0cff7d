//! Event types.
//!
//! An [`Event`] is anything that flows through a channel: chat messages,
//! typing indicators, read receipts and system notifications. Messages sent by
//! the local user start with a [`EventId::Local`] id and are reconciled to the
//! server id once the durable request succeeds.

use chrono::{DateTime, Utc};
use cocoschool_protocol::{ContentKind, Frame, WireMessage, WireNotification, WireStatus};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

use crate::channel::{ChannelError, ChannelId};

/// Identifier of an optimistic, not yet persisted event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalId(pub u64);

static ID_COUNTER: AtomicU64 = AtomicU64::new(1);

impl LocalId {
    /// Generate a process-unique local id.
    #[must_use]
    pub fn generate() -> Self {
        Self(ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "local-{}", self.0)
    }
}

/// Event identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventId {
    /// Temporary id assigned by this client.
    Local(LocalId),
    /// Id assigned by the server once persisted.
    Confirmed(String),
}

impl EventId {
    /// A fresh local id.
    #[must_use]
    pub fn local() -> Self {
        EventId::Local(LocalId::generate())
    }

    /// A server id.
    #[must_use]
    pub fn confirmed(id: impl Into<String>) -> Self {
        EventId::Confirmed(id.into())
    }

    #[must_use]
    pub fn is_confirmed(&self) -> bool {
        matches!(self, EventId::Confirmed(_))
    }

    /// The server id, if confirmed.
    #[must_use]
    pub fn as_confirmed(&self) -> Option<&str> {
        match self {
            EventId::Confirmed(id) => Some(id),
            EventId::Local(_) => None,
        }
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventId::Local(id) => id.fmt(f),
            EventId::Confirmed(id) => f.write_str(id),
        }
    }
}

/// Delivery state of an event.
///
/// ```text
/// Pending ──▶ Sent ──▶ Delivered ──▶ Read
///    │ ▲
///    ▼ │ (manual retry)
///  Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryState {
    Pending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl DeliveryState {
    /// Position on the happy path. `Failed` sits with `Pending`.
    fn rank(self) -> u8 {
        match self {
            DeliveryState::Pending | DeliveryState::Failed => 0,
            DeliveryState::Sent => 1,
            DeliveryState::Delivered => 2,
            DeliveryState::Read => 3,
        }
    }

    /// Check whether `next` is a legal transition from this state.
    #[must_use]
    pub fn can_transition_to(self, next: DeliveryState) -> bool {
        use DeliveryState::*;
        match (self, next) {
            (Pending, Failed) | (Failed, Pending) => true,
            (Failed, _) | (_, Failed) => false,
            (from, to) => to.rank() > from.rank(),
        }
    }

    /// Combine two observations of the same event. Never moves backwards
    /// along the happy path; a confirmed state supersedes `Failed`.
    #[must_use]
    pub fn merge(self, other: DeliveryState) -> DeliveryState {
        use DeliveryState::*;
        match (self, other) {
            (Failed, o) | (o, Failed) if o.rank() > 0 => o,
            (Failed, _) | (_, Failed) => Failed,
            (a, b) => {
                if b.rank() > a.rank() {
                    b
                } else {
                    a
                }
            }
        }
    }
}

impl From<WireStatus> for DeliveryState {
    fn from(status: WireStatus) -> Self {
        match status {
            WireStatus::Sent => DeliveryState::Sent,
            WireStatus::Delivered => DeliveryState::Delivered,
            WireStatus::Read => DeliveryState::Read,
        }
    }
}

/// Content of a chat message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    /// Image as a `data:` URL.
    Image(String),
}

impl Payload {
    #[must_use]
    pub fn kind(&self) -> ContentKind {
        match self {
            Payload::Text(_) => ContentKind::Text,
            Payload::Image(_) => ContentKind::Image,
        }
    }

    #[must_use]
    pub fn content(&self) -> &str {
        match self {
            Payload::Text(s) | Payload::Image(s) => s,
        }
    }

    fn from_wire(kind: ContentKind, content: String) -> Self {
        match kind {
            ContentKind::Text => Payload::Text(content),
            ContentKind::Image => Payload::Image(content),
        }
    }
}

/// A platform notification (ride request, emergency...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    /// Notification type, e.g. `ride_accepted`.
    pub kind: String,
    pub message: Option<String>,
    pub sender_name: Option<String>,
}

/// Discriminant of [`EventBody`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Message,
    TypingStatus,
    ReadReceipt,
    SystemNotification,
}

/// What an event carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventBody {
    Message(Payload),
    Typing { is_typing: bool },
    ReadReceipt { event_ids: Vec<String> },
    Notification(Notice),
}

impl EventBody {
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            EventBody::Message(_) => EventKind::Message,
            EventBody::Typing { .. } => EventKind::TypingStatus,
            EventBody::ReadReceipt { .. } => EventKind::ReadReceipt,
            EventBody::Notification(_) => EventKind::SystemNotification,
        }
    }
}

/// Errors turning a frame into an event.
#[derive(Debug, Error)]
pub enum EventError {
    /// The frame names a channel that cannot exist.
    #[error(transparent)]
    InvalidChannel(#[from] ChannelError),
}

/// Errors changing the delivery state of a cached event.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("Event not found: {0}")]
    NotFound(EventId),

    #[error("Invalid delivery transition {from:?} -> {to:?}")]
    Invalid {
        from: DeliveryState,
        to: DeliveryState,
    },
}

/// An event on a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub id: EventId,
    pub channel: ChannelId,
    /// Sending user, when known.
    pub sender: Option<String>,
    pub body: EventBody,
    /// Creation time; the cache orders by this, not by arrival.
    pub created_at: DateTime<Utc>,
    pub state: DeliveryState,
}

impl Event {
    /// Create an optimistic message from the local user.
    #[must_use]
    pub fn local_message(channel: ChannelId, sender: Option<String>, payload: Payload) -> Self {
        Self {
            id: EventId::local(),
            channel,
            sender,
            body: EventBody::Message(payload),
            created_at: Utc::now(),
            state: DeliveryState::Pending,
        }
    }

    /// Build a confirmed message from its wire form.
    ///
    /// Messages without a status are considered `Sent`.
    ///
    /// # Errors
    ///
    /// Returns an error if the chat id is not a valid channel name.
    pub fn from_wire_message(msg: WireMessage) -> Result<Self, EventError> {
        Ok(Self {
            id: EventId::Confirmed(msg.id),
            channel: ChannelId::new(msg.chat_id)?,
            sender: msg.sender_id,
            body: EventBody::Message(Payload::from_wire(msg.kind, msg.content)),
            created_at: msg.timestamp,
            state: msg.status.map_or(DeliveryState::Sent, DeliveryState::from),
        })
    }

    /// Build a notification event for the current user's stream.
    #[must_use]
    pub fn from_wire_notification(n: WireNotification) -> Self {
        Self {
            id: EventId::Confirmed(n.id),
            channel: ChannelId::notifications(),
            sender: n.sender_name.clone(),
            body: EventBody::Notification(Notice {
                kind: n.kind,
                message: n.message,
                sender_name: n.sender_name,
            }),
            created_at: n.created_at.unwrap_or_else(Utc::now),
            state: if n.read {
                DeliveryState::Read
            } else {
                DeliveryState::Delivered
            },
        }
    }

    /// Convert an inbound frame into an event.
    ///
    /// Typing indicators and read receipts carry no id or timestamp on the
    /// wire; they get a local id and the current time.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame names an invalid channel.
    pub fn from_frame(frame: Frame) -> Result<Self, EventError> {
        match frame {
            Frame::NewMessage(msg) => Self::from_wire_message(msg),
            Frame::Notification(n) => Ok(Self::from_wire_notification(n)),
            Frame::TypingStatus(t) => Ok(Self {
                id: EventId::local(),
                channel: ChannelId::new(t.chat_id)?,
                sender: t.user_id,
                body: EventBody::Typing {
                    is_typing: t.is_typing,
                },
                created_at: Utc::now(),
                state: DeliveryState::Delivered,
            }),
            Frame::ReadReceipt(r) => Ok(Self {
                id: EventId::local(),
                channel: ChannelId::new(r.chat_id)?,
                sender: r.reader_id,
                body: EventBody::ReadReceipt {
                    event_ids: r.message_ids,
                },
                created_at: Utc::now(),
                state: DeliveryState::Delivered,
            }),
        }
    }

    /// The wire form of a confirmed message, for relaying to other participants.
    ///
    /// Returns `None` for anything other than a confirmed chat message.
    #[must_use]
    pub fn to_wire_message(&self) -> Option<WireMessage> {
        let (EventId::Confirmed(id), EventBody::Message(payload)) = (&self.id, &self.body) else {
            return None;
        };
        let status = match self.state {
            DeliveryState::Sent => Some(WireStatus::Sent),
            DeliveryState::Delivered => Some(WireStatus::Delivered),
            DeliveryState::Read => Some(WireStatus::Read),
            DeliveryState::Pending | DeliveryState::Failed => None,
        };
        Some(WireMessage {
            id: id.clone(),
            chat_id: self.channel.as_str().to_string(),
            sender_id: self.sender.clone(),
            content: payload.content().to_string(),
            kind: payload.kind(),
            timestamp: self.created_at,
            status,
        })
    }

    #[must_use]
    pub fn kind(&self) -> EventKind {
        self.body.kind()
    }

    /// Whether this kind of event is kept in the channel cache.
    #[must_use]
    pub fn is_cacheable(&self) -> bool {
        matches!(
            self.body,
            EventBody::Message(_) | EventBody::Notification(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cocoschool_protocol::{ReadReceipt, TypingStatus};

    fn wire(id: &str, status: Option<WireStatus>) -> WireMessage {
        WireMessage {
            id: id.into(),
            chat_id: "chat-1".into(),
            sender_id: Some("u-1".into()),
            content: "hello".into(),
            kind: ContentKind::Text,
            timestamp: "2024-03-01T08:30:00Z".parse().unwrap(),
            status,
        }
    }

    #[test]
    fn test_unique_local_ids() {
        let id1 = LocalId::generate();
        let id2 = LocalId::generate();
        assert_ne!(id1, id2);
        assert!(id1.to_string().starts_with("local-"));
    }

    #[test]
    fn test_state_transitions() {
        use DeliveryState::*;
        assert!(Pending.can_transition_to(Sent));
        assert!(Sent.can_transition_to(Delivered));
        assert!(Delivered.can_transition_to(Read));
        assert!(Pending.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Pending));

        assert!(!Failed.can_transition_to(Sent));
        assert!(!Sent.can_transition_to(Failed));
        assert!(!Read.can_transition_to(Delivered));
        assert!(!Sent.can_transition_to(Sent));
    }

    #[test]
    fn test_state_merge_never_regresses() {
        use DeliveryState::*;
        assert_eq!(Read.merge(Sent), Read);
        assert_eq!(Sent.merge(Delivered), Delivered);
        assert_eq!(Pending.merge(Sent), Sent);
        assert_eq!(Failed.merge(Sent), Sent);
        assert_eq!(Pending.merge(Failed), Failed);
    }

    #[test]
    fn test_message_from_wire() {
        let event = Event::from_wire_message(wire("m-1", None)).unwrap();
        assert_eq!(event.id, EventId::confirmed("m-1"));
        assert_eq!(event.state, DeliveryState::Sent);
        assert_eq!(event.channel.as_str(), "chat-1");

        let read = Event::from_wire_message(wire("m-2", Some(WireStatus::Read))).unwrap();
        assert_eq!(read.state, DeliveryState::Read);
    }

    #[test]
    fn test_reserved_channel_rejected() {
        let mut msg = wire("m-1", None);
        msg.chat_id = "$notifications".into();
        assert!(Event::from_wire_message(msg).is_err());
    }

    #[test]
    fn test_transient_frames() {
        let typing = Event::from_frame(Frame::TypingStatus(TypingStatus {
            chat_id: "chat-1".into(),
            is_typing: true,
            user_id: Some("u-2".into()),
        }))
        .unwrap();
        assert_eq!(typing.kind(), EventKind::TypingStatus);
        assert!(!typing.id.is_confirmed());
        assert!(!typing.is_cacheable());

        let receipt = Event::from_frame(Frame::ReadReceipt(ReadReceipt {
            chat_id: "chat-1".into(),
            message_ids: vec!["m-1".into()],
            reader_id: None,
        }))
        .unwrap();
        assert_eq!(receipt.kind(), EventKind::ReadReceipt);
    }

    #[test]
    fn test_notification_state_follows_read_flag() {
        let n = WireNotification {
            id: "n-1".into(),
            kind: "admin".into(),
            message: Some("School closed".into()),
            sender_name: None,
            created_at: None,
            read: true,
        };
        let event = Event::from_wire_notification(n);
        assert!(event.channel.is_notifications());
        assert_eq!(event.state, DeliveryState::Read);
        assert!(event.is_cacheable());
    }

    #[test]
    fn test_to_wire_message_requires_confirmed_id() {
        let channel = ChannelId::new("chat-1").unwrap();
        let local = Event::local_message(channel, None, Payload::Text("hi".into()));
        assert!(local.to_wire_message().is_none());

        let confirmed = Event::from_wire_message(wire("m-1", None)).unwrap();
        let msg = confirmed.to_wire_message().unwrap();
        assert_eq!(msg.id, "m-1");
        assert_eq!(msg.status, Some(WireStatus::Sent));
    }
}
