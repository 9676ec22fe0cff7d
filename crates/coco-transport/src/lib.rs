//! # cocoschool-transport
//!
//! Live connection layer for the CoCoSchool realtime client.
//!
//! - **Connector / Connection** - the seam between the connection manager and
//!   a concrete transport
//! - **WebSocket** - `tokio-tungstenite` client sending JSON text frames
//! - **Memory** - in-process connector, handy for tests and local wiring
//! - **ConnectionManager** - one live connection, reconnected after a delay
//!   until explicitly disconnected
//!
//! ## Connection lifecycle
//!
//! ```text
//!  Disconnected ──connect()──▶ Connecting ──ok──▶ Connected
//!       ▲                          ▲  │               │
//!       │                          │  └──fail──┐      │ close / error
//!  disconnect()                    │           ▼      ▼
//!       └──────────────────── Reconnecting { attempt, delay }
//! ```
//!
//! ```rust,ignore
//! use cocoschool_transport::{ConnectionManager, ManagerConfig, WebSocketConnector};
//!
//! let connector = WebSocketConnector::new("ws://127.0.0.1:8080/ws", Some(token));
//! let manager = ConnectionManager::new(Arc::new(connector), sink, ManagerConfig::default());
//! manager.connect();
//! ```

pub mod manager;
pub mod memory;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use manager::{ConnectionManager, ConnectionState, FrameSink, ManagerConfig, ReconnectPolicy};
pub use memory::{MemoryConnector, MemoryPeer};
pub use traits::{Connection, Connector, TransportError};

#[cfg(feature = "websocket")]
pub use websocket::WebSocketConnector;
