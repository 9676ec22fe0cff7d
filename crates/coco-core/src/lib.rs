//! # cocoschool-core
//!
//! Core types and in-memory state for the CoCoSchool realtime layer.
//!
//! - **Event** - messages, typing indicators, read receipts and notifications
//! - **EventBuffer** - bounded, chronologically ordered per-channel cache
//! - **SubscriberList** - ordered callbacks with per-subscriber failure isolation
//! - **TypingTracker** - who is currently typing in a conversation
//! - **Hub** - the channel map tying the above together
//! - **notify** - system alert formatting and the `Notifier` seam
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌──────────────┐
//! │   Frames /  │────▶│     Hub     │────▶│ EventBuffer  │
//! │ Delivery API│     └─────────────┘     └──────────────┘
//! └─────────────┘            │
//!                            ▼
//!                     ┌──────────────┐
//!                     │SubscriberList│
//!                     └──────────────┘
//! ```

pub mod cache;
pub mod channel;
pub mod event;
pub mod hub;
pub mod notify;
pub mod registry;
pub mod typing;

pub use cache::{Appended, EventBuffer, DEFAULT_CAPACITY};
pub use channel::{ChannelError, ChannelId};
pub use event::{
    DeliveryState, Event, EventBody, EventError, EventId, EventKind, LocalId, Notice, Payload,
    TransitionError,
};
pub use hub::{Change, Hub, HubConfig, HubError, HubStats, Subscription, Update};
pub use notify::{LogNotifier, Notifier, NotifyError, Permission, SystemAlert};
pub use registry::{SubscriberId, SubscriberList};
pub use typing::{TypingState, TypingTracker};
