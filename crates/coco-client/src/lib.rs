//! # cocoschool-client
//!
//! Realtime chat and notification delivery for the CoCoSchool client.
//!
//! - **Realtime** - the context handle: send, retry, read, history, typing
//! - **ChannelView** - per-channel view with loading and error state
//! - **NotificationCenter** - the current user's notification stream and
//!   system alerts
//! - **TypingDebouncer** - reduces keystrokes to typing frames
//! - **HttpStore** - the durable REST API
//!
//! ## Sending a message
//!
//! ```text
//!  send() ──▶ Pending (cached, visible) ──POST /messages──▶ Sent (server id)
//!                      │                                        │
//!                      └──────── error / timeout ──▶ Failed     └──▶ relayed on
//!                                                                    the live socket
//! ```
//!
//! ```rust,ignore
//! use cocoschool_client::{Config, Realtime};
//!
//! let realtime = Realtime::builder(Config::load()?).build()?;
//! realtime.start();
//!
//! let mut view = realtime.open(ChannelId::new("ride-42")?)?;
//! view.send_text("On my way").await?;
//! ```

pub mod config;
pub mod delivery;
pub mod error;
pub mod metrics;
pub mod notifications;
pub mod store;
pub mod typing;
pub mod view;

pub use config::Config;
pub use delivery::{Realtime, RealtimeBuilder};
pub use error::DeliveryError;
pub use notifications::NotificationCenter;
pub use store::{HttpStore, MessageStore, NotificationStore, RequestError};
pub use typing::{TypingDebouncer, TypingPublisher};
pub use view::ChannelView;
