//! In-process transport.
//!
//! [`MemoryConnector`] hands out connections that were queued with
//! [`MemoryConnector::accept`]. The returned [`MemoryPeer`] plays the server:
//! it pushes JSON text to the client, reads what the client sent and can
//! close the connection. Frames go through the real codec in both
//! directions, so malformed input behaves as it does on a socket.

use async_trait::async_trait;
use cocoschool_protocol::{codec, Frame, ProtocolError};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;

use crate::traits::{Connection, Connector, TransportError};

/// Connector backed by queued in-memory connections.
#[derive(Default)]
pub struct MemoryConnector {
    pending: Mutex<VecDeque<MemoryConnection>>,
    attempts: AtomicUsize,
}

impl MemoryConnector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a connection for the next `connect` call.
    ///
    /// When nothing is queued, `connect` fails as if the endpoint refused.
    pub fn accept(&self) -> MemoryPeer {
        let (to_client, from_server) = mpsc::unbounded_channel();
        let (to_server, from_client) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(true));

        let conn = MemoryConnection {
            inbound: from_server,
            outbound: to_server,
            open: Arc::clone(&open),
        };
        if let Ok(mut pending) = self.pending.lock() {
            pending.push_back(conn);
        }

        MemoryPeer {
            to_client: Some(to_client),
            from_client,
            open,
        }
    }

    /// Number of `connect` calls so far.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Box<dyn Connection>, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let next = self
            .pending
            .lock()
            .map_err(|_| TransportError::Other("connector state poisoned".into()))?
            .pop_front();

        match next {
            Some(conn) => {
                debug!("Memory connection opened");
                Ok(Box::new(conn))
            }
            None => Err(TransportError::ConnectFailed("no peer accepting".into())),
        }
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Client half of an in-memory connection.
pub struct MemoryConnection {
    inbound: mpsc::UnboundedReceiver<String>,
    outbound: mpsc::UnboundedSender<String>,
    open: Arc<AtomicBool>,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        match self.inbound.recv().await {
            Some(text) => codec::decode_str(&text).map(Some).map_err(Into::into),
            None => {
                self.open.store(false, Ordering::SeqCst);
                Ok(None)
            }
        }
    }

    async fn send(&mut self, frame: &Frame) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::ConnectionClosed);
        }
        let text = codec::encode(frame)?;
        self.outbound
            .send(text)
            .map_err(|_| TransportError::SendFailed("peer gone".into()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.open.store(false, Ordering::SeqCst);
        self.inbound.close();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

/// Server half of an in-memory connection.
pub struct MemoryPeer {
    to_client: Option<mpsc::UnboundedSender<String>>,
    from_client: mpsc::UnboundedReceiver<String>,
    open: Arc<AtomicBool>,
}

impl MemoryPeer {
    /// Push a frame to the client. Returns `false` once the client is gone.
    pub fn deliver(&self, frame: &Frame) -> bool {
        match codec::encode(frame) {
            Ok(text) => self.deliver_raw(text),
            Err(_) => false,
        }
    }

    /// Push raw text to the client, valid JSON or not.
    pub fn deliver_raw(&self, text: impl Into<String>) -> bool {
        self.to_client
            .as_ref()
            .is_some_and(|tx| tx.send(text.into()).is_ok())
    }

    /// Next frame sent by the client, waiting for it.
    ///
    /// # Errors
    ///
    /// Returns an error if the client sent something that does not decode.
    pub async fn next_sent(&mut self) -> Result<Option<Frame>, ProtocolError> {
        match self.from_client.recv().await {
            Some(text) => codec::decode_str(&text).map(Some),
            None => Ok(None),
        }
    }

    /// Next frame sent by the client, if one is already waiting.
    #[must_use]
    pub fn try_next_sent(&mut self) -> Option<Frame> {
        self.from_client
            .try_recv()
            .ok()
            .and_then(|text| codec::decode_str(&text).ok())
    }

    /// Close the connection from the server side.
    pub fn close(&mut self) {
        self.to_client = None;
    }

    /// Whether the client still considers the connection open.
    #[must_use]
    pub fn is_client_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}
