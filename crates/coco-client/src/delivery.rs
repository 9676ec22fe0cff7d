//! Delivery API.
//!
//! [`Realtime`] is the context handle the application builds once at start
//! and clones into every consumer. It is the only way to produce events:
//! sends are applied to the local cache right away as `Pending`, persisted
//! through the durable store, reconciled to the server id and then relayed
//! over the live connection on a best-effort basis.

use cocoschool_core::{
    Change, ChannelId, DeliveryState, Event, EventBody, EventId, Hub, LogNotifier, Notifier,
    Payload, Subscription, Update,
};
use cocoschool_protocol::{ChatSummary, Frame, NewMessageRequest, TypingStatus};
use cocoschool_transport::{
    Connector, ConnectionManager, ConnectionState, FrameSink, TransportError, WebSocketConnector,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::Config;
use crate::error::DeliveryError;
use crate::metrics;
use crate::notifications::NotificationCenter;
use crate::store::{with_timeout, HttpStore, MessageStore, NotificationStore};
use crate::typing::{TypingDebouncer, TypingPublisher};
use crate::view::ChannelView;

/// Interval of the housekeeping task (typing expiry, stats export).
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(1);

/// Builds a [`Realtime`] context.
///
/// Every collaborator not set explicitly is created from the config.
pub struct RealtimeBuilder {
    config: Config,
    messages: Option<Arc<dyn MessageStore>>,
    notifications: Option<Arc<dyn NotificationStore>>,
    connector: Option<Arc<dyn Connector>>,
    notifier: Option<Arc<dyn Notifier>>,
}

impl RealtimeBuilder {
    /// Use one store for messages and notifications.
    #[must_use]
    pub fn store<S>(mut self, store: Arc<S>) -> Self
    where
        S: MessageStore + NotificationStore + 'static,
    {
        self.messages = Some(store.clone());
        self.notifications = Some(store);
        self
    }

    #[must_use]
    pub fn message_store(mut self, store: Arc<dyn MessageStore>) -> Self {
        self.messages = Some(store);
        self
    }

    #[must_use]
    pub fn notification_store(mut self, store: Arc<dyn NotificationStore>) -> Self {
        self.notifications = Some(store);
        self
    }

    #[must_use]
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    #[must_use]
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Build the context. Nothing is connected until [`Realtime::start`].
    ///
    /// # Errors
    ///
    /// Returns an error if the default HTTP store cannot be created.
    pub fn build(self) -> Result<Realtime, DeliveryError> {
        let config = self.config;

        let (messages, notifications) = match (self.messages, self.notifications) {
            (Some(m), Some(n)) => (m, n),
            (m, n) => {
                let http = Arc::new(HttpStore::new(
                    &config.endpoint.api_url,
                    config.endpoint.token.clone(),
                    config.request_timeout(),
                )?);
                (
                    m.unwrap_or_else(|| http.clone()),
                    n.unwrap_or_else(|| http.clone()),
                )
            }
        };
        let connector = self.connector.unwrap_or_else(|| {
            Arc::new(WebSocketConnector::new(
                config.endpoint.ws_url.clone(),
                config.endpoint.token.clone(),
            ))
        });
        let notifier = self
            .notifier
            .unwrap_or_else(|| Arc::new(LogNotifier::new(config.notifications.app_name.clone())));

        let hub = Arc::new(Hub::with_config(config.hub_config()));
        let center = Arc::new(NotificationCenter::new(
            Arc::clone(&hub),
            notifications,
            notifier,
            config.notifications.enabled,
            config.request_timeout(),
        ));
        let sink = Arc::new(InboundSink {
            hub: Arc::clone(&hub),
            center: Arc::clone(&center),
            user_id: config.endpoint.user_id.clone(),
        });
        let manager = ConnectionManager::new(connector, sink, config.manager_config());

        Ok(Realtime {
            inner: Arc::new(Inner {
                hub,
                manager,
                messages,
                center,
                housekeeping: Mutex::new(None),
                config,
            }),
        })
    }
}

struct Inner {
    hub: Arc<Hub>,
    manager: ConnectionManager,
    messages: Arc<dyn MessageStore>,
    center: Arc<NotificationCenter>,
    housekeeping: Mutex<Option<JoinHandle<()>>>,
    config: Config,
}

/// The realtime context. Cheap to clone.
#[derive(Clone)]
pub struct Realtime {
    inner: Arc<Inner>,
}

impl Realtime {
    #[must_use]
    pub fn builder(config: Config) -> RealtimeBuilder {
        RealtimeBuilder {
            config,
            messages: None,
            notifications: None,
            connector: None,
            notifier: None,
        }
    }

    /// Open the live connection and start housekeeping. Idempotent.
    ///
    /// Must be called within a tokio runtime.
    pub fn start(&self) {
        self.inner.manager.connect();

        let Ok(mut housekeeping) = self.inner.housekeeping.lock() else {
            return;
        };
        if housekeeping.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        let hub = Arc::clone(&self.inner.hub);
        *housekeeping = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HOUSEKEEPING_INTERVAL);
            loop {
                ticker.tick().await;
                hub.prune_typing();
                metrics::record_hub_stats(&hub.stats());
            }
        }));
        info!("Realtime context started");
    }

    /// Close the live connection and stop housekeeping. Cached state is kept.
    pub async fn shutdown(&self) {
        let housekeeping = self.inner.housekeeping.lock().ok().and_then(|mut h| h.take());
        if let Some(task) = housekeeping {
            task.abort();
        }
        self.inner.manager.disconnect().await;
        info!("Realtime context stopped");
    }

    /// Send a message.
    ///
    /// The message is visible as `Pending` before this returns control to
    /// the runtime. On success the returned event carries the server id and
    /// is `Sent` (or further); on failure the cached event is `Failed` and
    /// stays visible for [`retry`](Self::retry) or [`discard`](Self::discard).
    ///
    /// # Errors
    ///
    /// Returns an error if the durable request fails or times out.
    pub async fn send(&self, channel: &ChannelId, payload: Payload) -> Result<Event, DeliveryError> {
        let event = Event::local_message(channel.clone(), self.inner.config.endpoint.user_id.clone(), payload);
        let local = event.id.clone();
        self.inner.hub.apply(event.clone())?;
        debug!(channel = %channel, id = %local, "Message pending");

        self.deliver(channel, &local, &event).await
    }

    /// Send a text message.
    ///
    /// # Errors
    ///
    /// Same as [`send`](Self::send).
    pub async fn send_text(&self, channel: &ChannelId, text: impl Into<String>) -> Result<Event, DeliveryError> {
        self.send(channel, Payload::Text(text.into())).await
    }

    /// Send a failed message again, reusing its cache entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the event is unknown or not failed, or if the
    /// durable request fails again.
    pub async fn retry(&self, channel: &ChannelId, id: &EventId) -> Result<Event, DeliveryError> {
        let event = self
            .inner
            .hub
            .get(channel, id)
            .ok_or_else(|| DeliveryError::NotFound(id.clone()))?;
        if event.state != DeliveryState::Failed {
            return Err(DeliveryError::InvalidState {
                id: id.clone(),
                state: event.state,
            });
        }

        self.inner.hub.mark_pending(channel, id)?;
        info!(channel = %channel, id = %id, "Retrying message");
        self.deliver(channel, id, &event).await
    }

    /// Remove a local message that was never confirmed.
    ///
    /// # Errors
    ///
    /// Returns an error if the event is unknown or already confirmed.
    pub fn discard(&self, channel: &ChannelId, id: &EventId) -> Result<(), DeliveryError> {
        let event = self
            .inner
            .hub
            .get(channel, id)
            .ok_or_else(|| DeliveryError::NotFound(id.clone()))?;
        if id.is_confirmed() || !matches!(event.state, DeliveryState::Failed | DeliveryState::Pending) {
            return Err(DeliveryError::InvalidState {
                id: id.clone(),
                state: event.state,
            });
        }
        self.inner.hub.remove(channel, id)?;
        Ok(())
    }

    async fn deliver(&self, channel: &ChannelId, local: &EventId, event: &Event) -> Result<Event, DeliveryError> {
        let EventBody::Message(payload) = &event.body else {
            return Err(DeliveryError::InvalidState {
                id: local.clone(),
                state: event.state,
            });
        };
        let request = NewMessageRequest {
            chat_id: channel.as_str().to_string(),
            content: payload.content().to_string(),
            kind: payload.kind(),
            timestamp: event.created_at,
        };

        let persisted = with_timeout(self.request_timeout(), self.inner.messages.post_message(&request))
            .await
            .map_err(DeliveryError::from)
            .and_then(|wire| Event::from_wire_message(wire).map_err(DeliveryError::from));

        let mut confirmed = match persisted {
            Ok(confirmed) => confirmed,
            Err(e) => {
                warn!(channel = %channel, id = %local, error = %e, "Send failed");
                metrics::record_send("failed");
                if let Err(hub_err) = self.inner.hub.mark_failed(channel, local) {
                    debug!(id = %local, error = %hub_err, "Could not mark message failed");
                }
                return Err(e);
            }
        };
        confirmed.channel = channel.clone();
        if confirmed.sender.is_none() {
            confirmed.sender = event.sender.clone();
        }

        self.inner.hub.reconcile(channel, local, confirmed.clone())?;
        metrics::record_send("sent");
        debug!(channel = %channel, local = %local, id = %confirmed.id, "Message confirmed");

        if let Some(wire) = confirmed.to_wire_message() {
            self.publish(Frame::NewMessage(wire)).await;
        }

        Ok(self.inner.hub.get(channel, &confirmed.id).unwrap_or(confirmed))
    }

    /// Tell the other participants whether we are typing.
    ///
    /// Fire-and-forget: nothing is retried and failures are only logged.
    pub async fn set_typing_status(&self, channel: &ChannelId, is_typing: bool) {
        if channel.is_notifications() {
            return;
        }
        let frame = Frame::TypingStatus(TypingStatus {
            chat_id: channel.as_str().to_string(),
            is_typing,
            user_id: self.inner.config.endpoint.user_id.clone(),
        });
        self.publish(frame).await;
    }

    /// Mark messages as read, on the server first.
    ///
    /// Ids not cached locally are ignored by the local update. Returns the
    /// ids whose local state changed.
    ///
    /// # Errors
    ///
    /// Returns an error if the durable request fails; the cache is unchanged.
    pub async fn mark_as_read(&self, channel: &ChannelId, ids: &[String]) -> Result<Vec<EventId>, DeliveryError> {
        if channel.is_notifications() {
            return self.inner.center.mark_read(ids).await;
        }
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        with_timeout(
            self.request_timeout(),
            self.inner.messages.mark_read(channel.as_str(), ids),
        )
        .await?;

        Ok(match self.inner.hub.mark_read(channel, ids)? {
            Some(Update {
                change: Change::Read { ids },
                ..
            }) => ids,
            _ => Vec::new(),
        })
    }

    /// Fetch the page of messages older than the oldest cached one and
    /// merge it. Returns how many messages were new.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    pub async fn load_history(&self, channel: &ChannelId) -> Result<usize, DeliveryError> {
        let before = self.inner.hub.oldest_confirmed_id(channel);
        let fetched = with_timeout(
            self.request_timeout(),
            self.inner.messages.fetch_messages(
                channel.as_str(),
                self.inner.config.requests.history_page,
                before.as_deref(),
            ),
        )
        .await?;

        let mut events = Vec::with_capacity(fetched.len());
        for wire in fetched {
            match Event::from_wire_message(wire) {
                Ok(mut event) => {
                    event.channel = channel.clone();
                    events.push(event);
                }
                Err(e) => warn!(channel = %channel, error = %e, "Skipping invalid history entry"),
            }
        }

        let inserted = match self.inner.hub.merge(channel, events)? {
            Some(Update {
                change: Change::Merged { inserted },
                ..
            }) => inserted,
            _ => 0,
        };
        debug!(channel = %channel, before = ?before, inserted, "History loaded");
        Ok(inserted)
    }

    /// Create a conversation.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server returns an
    /// unusable id.
    pub async fn create_chat(&self, participants: &[String], name: &str) -> Result<(ChannelId, ChatSummary), DeliveryError> {
        let summary = with_timeout(
            self.request_timeout(),
            self.inner.messages.create_chat(participants, name),
        )
        .await?;
        let channel = ChannelId::new(summary.id.clone())?;
        info!(channel = %channel, participants = participants.len(), "Chat created");
        Ok((channel, summary))
    }

    /// Subscribe to changes of a channel.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel limit is reached.
    pub fn subscribe<F>(&self, channel: &ChannelId, callback: F) -> Result<Subscription, DeliveryError>
    where
        F: Fn(&Update) + Send + Sync + 'static,
    {
        Ok(self.inner.hub.subscribe(channel, callback)?)
    }

    /// Cached events of a channel, oldest first.
    #[must_use]
    pub fn events(&self, channel: &ChannelId) -> Vec<Event> {
        self.inner.hub.events(channel)
    }

    /// Participants currently typing on a channel.
    #[must_use]
    pub fn typing_users(&self, channel: &ChannelId) -> Vec<String> {
        self.inner.hub.typing_users(channel)
    }

    /// Open a view on a channel and load its first page in the background.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel limit is reached.
    pub fn open(&self, channel: ChannelId) -> Result<ChannelView, DeliveryError> {
        ChannelView::open(self.clone(), channel)
    }

    /// A typing debouncer publishing on `channel`.
    #[must_use]
    pub fn typing_debouncer(&self, channel: ChannelId) -> TypingDebouncer {
        let publisher = Arc::new(ChannelTyping {
            realtime: self.clone(),
            channel,
        });
        TypingDebouncer::new(
            publisher,
            self.inner.config.typing_idle(),
            self.inner.config.typing_refresh(),
        )
    }

    /// The notification center.
    #[must_use]
    pub fn notifications(&self) -> &Arc<NotificationCenter> {
        &self.inner.center
    }

    /// Current live connection state.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.inner.manager.state()
    }

    /// Watch live connection state changes.
    #[must_use]
    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.inner.manager.watch_state()
    }

    /// The underlying hub, for read access and statistics.
    #[must_use]
    pub fn hub(&self) -> &Arc<Hub> {
        &self.inner.hub
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    fn request_timeout(&self) -> Duration {
        self.inner.config.request_timeout()
    }

    /// Best-effort publish on the live connection.
    async fn publish(&self, frame: Frame) {
        let frame_type = frame.frame_type();
        match self.inner.manager.publish(frame).await {
            Ok(()) => {
                metrics::record_frame("out");
                trace!(frame = %frame_type, "Published");
            }
            Err(TransportError::NotConnected) => {
                debug!(frame = %frame_type, "Not connected, frame not published");
            }
            Err(e) => debug!(frame = %frame_type, error = %e, "Publish failed"),
        }
    }
}

struct ChannelTyping {
    realtime: Realtime,
    channel: ChannelId,
}

#[async_trait::async_trait]
impl TypingPublisher for ChannelTyping {
    async fn publish_typing(&self, is_typing: bool) {
        self.realtime.set_typing_status(&self.channel, is_typing).await;
    }
}

/// Applies inbound frames to the hub.
struct InboundSink {
    hub: Arc<Hub>,
    center: Arc<NotificationCenter>,
    user_id: Option<String>,
}

impl FrameSink for InboundSink {
    fn on_frame(&self, frame: Frame) {
        metrics::record_frame("in");

        let event = match Event::from_frame(frame) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Dropping frame for invalid channel");
                metrics::record_malformed();
                return;
            }
        };

        if matches!(event.body, EventBody::Typing { .. })
            && event.sender.is_some()
            && event.sender == self.user_id
        {
            trace!(channel = %event.channel, "Ignoring own typing echo");
            return;
        }

        // Chat traffic only lands in channels that are open or awaiting a
        // confirmation. The notification stream always applies so alerts
        // can surface.
        let result = if event.channel.is_notifications() {
            self.hub.apply(event)
        } else {
            self.hub.apply_existing(event)
        };
        match result {
            Ok(Some(Update {
                change: Change::Appended(event),
                ..
            })) if event.channel.is_notifications() => {
                self.center.surface(&event);
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Failed to apply inbound event"),
        }
    }

    fn on_malformed(&self, _error: &TransportError) {
        metrics::record_malformed();
    }

    fn on_state(&self, state: ConnectionState) {
        metrics::record_connection_state(state);
    }
}
