//! Connection manager.
//!
//! Owns the single live connection of a client. A background task runs the
//! state machine: connect (bounded by a timeout), read frames into the
//! [`FrameSink`], and on close or error wait out the reconnect delay and try
//! again, until [`ConnectionManager::disconnect`] is called. Commands reach
//! the task over an mpsc channel so the connection itself never leaves it.

use cocoschool_protocol::Frame;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::traits::{Connection, Connector, TransportError};

const COMMAND_BUFFER: usize = 64;

/// Observable state of the live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Waiting `delay` before connect attempt number `attempt + 1`.
    Reconnecting { attempt: u32, delay: Duration },
}

impl ConnectionState {
    #[must_use]
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Short name, used as a metrics label.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting { .. } => "reconnecting",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delay between reconnect attempts.
///
/// With `max_delay <= delay` the delay is fixed. Otherwise it doubles per
/// attempt, capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub delay: Duration,
    pub max_delay: Duration,
}

impl ReconnectPolicy {
    #[must_use]
    pub fn fixed(delay: Duration) -> Self {
        Self {
            delay,
            max_delay: delay,
        }
    }

    #[must_use]
    pub fn exponential(delay: Duration, max_delay: Duration) -> Self {
        Self { delay, max_delay }
    }

    /// Delay before retry number `attempt` (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if self.max_delay <= self.delay {
            return self.delay;
        }
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(3))
    }
}

/// Connection manager configuration.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub reconnect: ReconnectPolicy,
    /// Upper bound for one connect attempt.
    pub connect_timeout: Duration,
    /// Upper bound for one outbound publish.
    pub send_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            connect_timeout: Duration::from_secs(10),
            send_timeout: Duration::from_secs(5),
        }
    }
}

/// Receives what the live connection produces.
///
/// Called from the connection task; implementations must not block.
pub trait FrameSink: Send + Sync {
    /// A decoded inbound frame.
    fn on_frame(&self, frame: Frame);

    /// An inbound frame was dropped because it did not decode.
    fn on_malformed(&self, _error: &TransportError) {}

    /// The connection state changed.
    fn on_state(&self, _state: ConnectionState) {}
}

enum Command {
    Publish {
        frame: Frame,
        reply: oneshot::Sender<Result<(), TransportError>>,
    },
    Shutdown,
}

struct Running {
    commands: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

struct Shared {
    connector: Arc<dyn Connector>,
    sink: Arc<dyn FrameSink>,
    config: ManagerConfig,
    state: watch::Sender<ConnectionState>,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "Connection state changed");
            self.sink.on_state(state);
        }
    }
}

/// How a connected session ended.
enum SessionEnd {
    Lost,
    Shutdown,
}

/// Keeps one live connection open.
pub struct ConnectionManager {
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
}

impl ConnectionManager {
    #[must_use]
    pub fn new(connector: Arc<dyn Connector>, sink: Arc<dyn FrameSink>, config: ManagerConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                connector,
                sink,
                config,
                state,
            }),
            running: Mutex::new(None),
        }
    }

    /// Start connecting. No-op if already connected or connecting.
    ///
    /// Must be called within a tokio runtime. Returns `true` if a new
    /// connection task was started.
    pub fn connect(&self) -> bool {
        let Ok(mut running) = self.running.lock() else {
            warn!("Connection manager state poisoned");
            return false;
        };

        if running.as_ref().is_some_and(|r| !r.task.is_finished()) {
            debug!("Already connected or connecting");
            return false;
        }

        info!(transport = self.shared.connector.name(), "Connecting");
        let (commands, rx) = mpsc::channel(COMMAND_BUFFER);
        let shared = Arc::clone(&self.shared);
        let task = tokio::spawn(run(shared, rx));
        *running = Some(Running { commands, task });
        true
    }

    /// Close the connection and cancel any pending reconnect. A later
    /// [`connect`](Self::connect) starts over.
    pub async fn disconnect(&self) {
        let running = match self.running.lock() {
            Ok(mut running) => running.take(),
            Err(_) => None,
        };
        let Some(Running { commands, mut task }) = running else {
            return;
        };

        let _ = commands.try_send(Command::Shutdown);
        if timeout(self.shared.config.send_timeout, &mut task).await.is_err() {
            warn!("Connection task did not stop in time, aborting");
            task.abort();
        }
        self.shared.set_state(ConnectionState::Disconnected);
        info!("Disconnected");
    }

    /// Send a frame over the live connection.
    ///
    /// Best-effort: nothing is queued for later.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::NotConnected`] when there is no live
    /// connection, [`TransportError::Timeout`] when the send does not finish
    /// within the send timeout, or the connection's own send error.
    pub async fn publish(&self, frame: Frame) -> Result<(), TransportError> {
        if !self.state().is_connected() {
            return Err(TransportError::NotConnected);
        }
        let commands = self
            .running
            .lock()
            .ok()
            .and_then(|r| r.as_ref().map(|r| r.commands.clone()))
            .ok_or(TransportError::NotConnected)?;

        let send = async move {
            let (reply, rx) = oneshot::channel();
            commands
                .send(Command::Publish { frame, reply })
                .await
                .map_err(|_| TransportError::NotConnected)?;
            rx.await.map_err(|_| TransportError::ConnectionClosed)?
        };

        timeout(self.shared.config.send_timeout, send)
            .await
            .map_err(|_| TransportError::Timeout)?
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Watch connection state changes.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    #[must_use]
    pub fn config(&self) -> &ManagerConfig {
        &self.shared.config
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Ok(mut running) = self.running.lock() {
            if let Some(running) = running.take() {
                running.task.abort();
            }
        }
    }
}

/// Answer a command while no connection is live. Returns `false` on shutdown.
fn reject_offline(command: Option<Command>) -> bool {
    match command {
        Some(Command::Publish { reply, .. }) => {
            let _ = reply.send(Err(TransportError::NotConnected));
            true
        }
        Some(Command::Shutdown) | None => false,
    }
}

async fn run(shared: Arc<Shared>, mut commands: mpsc::Receiver<Command>) {
    let mut attempt: u32 = 0;

    loop {
        shared.set_state(ConnectionState::Connecting);

        let connect = timeout(shared.config.connect_timeout, shared.connector.connect());
        tokio::pin!(connect);
        let outcome = loop {
            tokio::select! {
                result = &mut connect => break result,
                command = commands.recv() => {
                    if !reject_offline(command) {
                        shared.set_state(ConnectionState::Disconnected);
                        return;
                    }
                }
            }
        };

        match outcome {
            Ok(Ok(mut conn)) => {
                attempt = 0;
                shared.set_state(ConnectionState::Connected);
                info!(transport = shared.connector.name(), "Connected");

                match session(&shared, conn.as_mut(), &mut commands).await {
                    SessionEnd::Shutdown => {
                        let _ = conn.close().await;
                        shared.set_state(ConnectionState::Disconnected);
                        return;
                    }
                    SessionEnd::Lost => {
                        let _ = conn.close().await;
                        warn!("Connection lost");
                    }
                }
            }
            Ok(Err(e)) => warn!(attempt, error = %e, "Connect failed"),
            Err(_) => warn!(
                attempt,
                timeout_ms = shared.config.connect_timeout.as_millis() as u64,
                "Connect timed out"
            ),
        }

        attempt = attempt.saturating_add(1);
        let delay = shared.config.reconnect.delay_for(attempt);
        shared.set_state(ConnectionState::Reconnecting { attempt, delay });
        info!(attempt, delay_ms = delay.as_millis() as u64, "Scheduling reconnect");

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                () = &mut sleep => break,
                command = commands.recv() => {
                    if !reject_offline(command) {
                        shared.set_state(ConnectionState::Disconnected);
                        return;
                    }
                }
            }
        }
    }
}

enum Step {
    Command(Option<Command>),
    Inbound(Result<Option<Frame>, TransportError>),
}

async fn session(
    shared: &Shared,
    conn: &mut dyn Connection,
    commands: &mut mpsc::Receiver<Command>,
) -> SessionEnd {
    loop {
        let step = tokio::select! {
            command = commands.recv() => Step::Command(command),
            inbound = conn.recv() => Step::Inbound(inbound),
        };

        match step {
            Step::Command(Some(Command::Publish { frame, reply })) => {
                let result = conn.send(&frame).await;
                let lost = matches!(
                    result,
                    Err(TransportError::ConnectionClosed | TransportError::SendFailed(_))
                );
                let _ = reply.send(result);
                if lost {
                    return SessionEnd::Lost;
                }
            }
            Step::Command(Some(Command::Shutdown) | None) => return SessionEnd::Shutdown,
            Step::Inbound(Ok(Some(frame))) => shared.sink.on_frame(frame),
            Step::Inbound(Ok(None)) => {
                debug!("Connection closed by peer");
                return SessionEnd::Lost;
            }
            Step::Inbound(Err(e)) if e.is_malformed_frame() => {
                warn!(error = %e, "Dropping malformed frame");
                shared.sink.on_malformed(&e);
            }
            Step::Inbound(Err(e)) => {
                warn!(error = %e, "Receive failed");
                return SessionEnd::Lost;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryConnector;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingSink {
        frames: Mutex<Vec<Frame>>,
        malformed: AtomicUsize,
    }

    impl FrameSink for RecordingSink {
        fn on_frame(&self, frame: Frame) {
            self.frames.lock().unwrap().push(frame);
        }

        fn on_malformed(&self, _error: &TransportError) {
            self.malformed.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct HangingConnector;

    #[async_trait]
    impl Connector for HangingConnector {
        async fn connect(&self) -> Result<Box<dyn Connection>, TransportError> {
            std::future::pending().await
        }

        fn name(&self) -> &'static str {
            "hanging"
        }
    }

    fn manager(connector: Arc<dyn Connector>, sink: Arc<RecordingSink>) -> ConnectionManager {
        ConnectionManager::new(connector, sink, ManagerConfig::default())
    }

    async fn wait_for(manager: &ConnectionManager, f: impl FnMut(&ConnectionState) -> bool) {
        let mut rx = manager.watch_state();
        rx.wait_for(f).await.unwrap();
    }

    #[test]
    fn test_fixed_policy() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(3));
        assert_eq!(policy.delay_for(10), Duration::from_secs(3));
    }

    #[test]
    fn test_exponential_policy_is_capped() {
        let policy = ReconnectPolicy::exponential(Duration::from_secs(1), Duration::from_secs(5));
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(4), Duration::from_secs(5));
        assert_eq!(policy.delay_for(40), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_is_idempotent() {
        let connector = Arc::new(MemoryConnector::new());
        let _peer = connector.accept();
        let sink = Arc::new(RecordingSink::default());
        let manager = manager(connector.clone(), sink);

        assert!(manager.connect());
        wait_for(&manager, ConnectionState::is_connected).await;
        assert!(!manager.connect());
        assert_eq!(connector.attempts(), 1);

        manager.disconnect().await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_frames_reach_sink_and_malformed_are_dropped() {
        let connector = Arc::new(MemoryConnector::new());
        let peer = connector.accept();
        let sink = Arc::new(RecordingSink::default());
        let manager = manager(connector.clone(), sink.clone());

        manager.connect();
        wait_for(&manager, ConnectionState::is_connected).await;

        peer.deliver_raw("{not json");
        peer.deliver(&Frame::typing("chat-1", true));
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(*sink.frames.lock().unwrap(), [Frame::typing("chat-1", true)]);
        assert_eq!(sink.malformed.load(Ordering::SeqCst), 1);
        assert!(manager.state().is_connected());
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_after_close_with_fixed_delay() {
        let connector = Arc::new(MemoryConnector::new());
        let mut first = connector.accept();
        let sink = Arc::new(RecordingSink::default());
        let manager = manager(connector.clone(), sink);

        manager.connect();
        wait_for(&manager, ConnectionState::is_connected).await;

        first.close();
        wait_for(&manager, |s| {
            *s == ConnectionState::Reconnecting {
                attempt: 1,
                delay: Duration::from_secs(3),
            }
        })
        .await;

        let _second = connector.accept();
        tokio::time::sleep(Duration::from_millis(2_900)).await;
        assert_eq!(connector.attempts(), 1);

        wait_for(&manager, ConnectionState::is_connected).await;
        assert_eq!(connector.attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_endpoint_accepts() {
        let connector = Arc::new(MemoryConnector::new());
        let sink = Arc::new(RecordingSink::default());
        let manager = manager(connector.clone(), sink);

        manager.connect();
        wait_for(&manager, |s| matches!(s, ConnectionState::Reconnecting { attempt: 3, .. })).await;
        assert_eq!(connector.attempts(), 3);

        let _peer = connector.accept();
        wait_for(&manager, ConnectionState::is_connected).await;
        assert_eq!(connector.attempts(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_pending_reconnect() {
        let connector = Arc::new(MemoryConnector::new());
        let sink = Arc::new(RecordingSink::default());
        let manager = manager(connector.clone(), sink);

        manager.connect();
        wait_for(&manager, |s| matches!(s, ConnectionState::Reconnecting { .. })).await;
        manager.disconnect().await;

        let _peer = connector.accept();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(connector.attempts(), 1);
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        // Explicit connect reopens.
        assert!(manager.connect());
        wait_for(&manager, ConnectionState::is_connected).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_schedules_reconnect() {
        let sink = Arc::new(RecordingSink::default());
        let manager = manager(Arc::new(HangingConnector), sink);

        manager.connect();
        wait_for(&manager, |s| matches!(s, ConnectionState::Reconnecting { attempt: 1, .. })).await;
        manager.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish() {
        let connector = Arc::new(MemoryConnector::new());
        let mut peer = connector.accept();
        let sink = Arc::new(RecordingSink::default());
        let manager = manager(connector.clone(), sink);

        assert!(matches!(
            manager.publish(Frame::typing("chat-1", true)).await,
            Err(TransportError::NotConnected)
        ));

        manager.connect();
        wait_for(&manager, ConnectionState::is_connected).await;
        manager.publish(Frame::typing("chat-1", true)).await.unwrap();
        assert_eq!(peer.next_sent().await.unwrap(), Some(Frame::typing("chat-1", true)));
    }
}
