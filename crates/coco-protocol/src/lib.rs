//! # cocoschool-protocol
//!
//! Wire definitions shared by the CoCoSchool realtime client and the
//! services it talks to.
//!
//! Live frames travel as JSON objects of the form `{"type": ..., "data": ...}`:
//!
//! - `new_message` - a chat message (also echoed after persistence)
//! - `typing_status` - a participant started or stopped typing
//! - `read_receipt` - messages were read by a participant
//! - `notification` - a user-facing notification (ride request, emergency...)
//!
//! The [`rest`] module holds the request/response bodies of the durable
//! HTTP collaborator.
//!
//! ## Example
//!
//! ```rust
//! use cocoschool_protocol::{codec, Frame};
//!
//! let frame = Frame::typing("chat-42", true);
//! let text = codec::encode(&frame).unwrap();
//! let decoded = codec::decode_str(&text).unwrap();
//! assert_eq!(frame, decoded);
//! ```

pub mod codec;
pub mod frames;
pub mod rest;

pub use codec::{decode, decode_str, encode, ProtocolError};
pub use frames::{
    ContentKind, Frame, FrameType, ReadReceipt, TypingStatus, WireMessage, WireNotification,
    WireStatus,
};
pub use rest::{
    ChatSummary, CreateChatRequest, NewMessageRequest, NotificationIdsRequest,
    NotificationPreferences, NotificationQuery, ReadRequest,
};
