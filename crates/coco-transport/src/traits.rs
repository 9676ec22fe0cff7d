//! Transport abstraction traits.
//!
//! A [`Connector`] opens connections to the realtime endpoint; a
//! [`Connection`] moves decoded frames in both directions. The connection
//! manager only talks to these traits, so tests can swap the network for an
//! in-memory pair.

use async_trait::async_trait;
use cocoschool_protocol::{Frame, ProtocolError};
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Operation timed out.
    #[error("Operation timed out")]
    Timeout,

    /// Failed to open a connection.
    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// No live connection to send on.
    #[error("Not connected")]
    NotConnected,

    /// Inbound data was not a valid frame.
    #[error("Malformed frame: {0}")]
    Protocol(#[from] ProtocolError),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Whether the error concerns a single frame only, leaving the
    /// connection usable.
    #[must_use]
    pub fn is_malformed_frame(&self) -> bool {
        matches!(self, TransportError::Protocol(_))
    }
}

/// Opens connections to the realtime endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a new connection.
    async fn connect(&self) -> Result<Box<dyn Connection>, TransportError>;

    /// Transport name (e.g. "websocket").
    fn name(&self) -> &'static str;
}

/// An open connection.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Receive the next frame.
    ///
    /// Returns `None` if the connection is closed cleanly. A
    /// [`TransportError::Protocol`] error means one bad frame was skipped and
    /// the connection can still be read.
    async fn recv(&mut self) -> Result<Option<Frame>, TransportError>;

    /// Send a frame.
    async fn send(&mut self, frame: &Frame) -> Result<(), TransportError>;

    /// Close the connection gracefully.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Check if the connection is still open.
    fn is_open(&self) -> bool;
}
