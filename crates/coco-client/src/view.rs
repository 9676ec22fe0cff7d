//! Per-channel view for UI consumers.

use cocoschool_core::{ChannelId, Event, EventId, Payload, Subscription};
use cocoschool_protocol::NotificationQuery;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::delivery::Realtime;
use crate::error::DeliveryError;

#[derive(Debug, Default)]
struct Status {
    loading: bool,
    error: Option<String>,
}

/// Shared between the view, its subscription callback and loader task.
struct ViewState {
    status: Mutex<Status>,
    version: watch::Sender<u64>,
}

impl ViewState {
    fn bump(&self) {
        self.version.send_modify(|v| *v = v.wrapping_add(1));
    }

    fn set_loading(&self, loading: bool) {
        if let Ok(mut status) = self.status.lock() {
            status.loading = loading;
            if loading {
                status.error = None;
            }
        }
        self.bump();
    }

    fn set_error(&self, error: Option<String>) {
        if let Ok(mut status) = self.status.lock() {
            status.error = error;
        }
        self.bump();
    }
}

/// A live view of one channel.
///
/// Opening a view subscribes to the channel and fetches its most recent
/// page in the background. Dropping the view unsubscribes.
pub struct ChannelView {
    realtime: Realtime,
    channel: ChannelId,
    subscription: Subscription,
    state: Arc<ViewState>,
    changes: watch::Receiver<u64>,
    loader: Option<JoinHandle<()>>,
}

impl ChannelView {
    pub(crate) fn open(realtime: Realtime, channel: ChannelId) -> Result<Self, DeliveryError> {
        let (version, changes) = watch::channel(0);
        let state = Arc::new(ViewState {
            status: Mutex::new(Status {
                loading: true,
                error: None,
            }),
            version,
        });

        let callback_state = Arc::clone(&state);
        let subscription = realtime.subscribe(&channel, move |_| callback_state.bump())?;

        let loader = {
            let realtime = realtime.clone();
            let channel = channel.clone();
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                let result = load_page(&realtime, &channel).await;
                if let Err(e) = &result {
                    warn!(channel = %channel, error = %e, "Initial load failed");
                }
                state.set_error(result.err().map(|e| e.to_string()));
                state.set_loading(false);
            })
        };

        Ok(Self {
            realtime,
            channel,
            subscription,
            state,
            changes,
            loader: Some(loader),
        })
    }

    #[must_use]
    pub fn channel(&self) -> &ChannelId {
        &self.channel
    }

    /// Cached events, oldest first.
    #[must_use]
    pub fn events(&self) -> Vec<Event> {
        self.realtime.events(&self.channel)
    }

    /// Users currently typing.
    #[must_use]
    pub fn typing(&self) -> Vec<String> {
        self.realtime.typing_users(&self.channel)
    }

    /// Whether a page is being fetched.
    #[must_use]
    pub fn loading(&self) -> bool {
        self.state.status.lock().map(|s| s.loading).unwrap_or(false)
    }

    /// The last load error, if the last load failed.
    #[must_use]
    pub fn error(&self) -> Option<String> {
        self.state.status.lock().ok().and_then(|s| s.error.clone())
    }

    /// Wait until something about the view changed.
    ///
    /// Returns `false` once the view can no longer change.
    pub async fn changed(&mut self) -> bool {
        self.changes.changed().await.is_ok()
    }

    /// Send a message on this channel.
    ///
    /// # Errors
    ///
    /// See [`Realtime::send`].
    pub async fn send(&self, payload: Payload) -> Result<Event, DeliveryError> {
        self.realtime.send(&self.channel, payload).await
    }

    /// Send a text message on this channel.
    ///
    /// # Errors
    ///
    /// See [`Realtime::send`].
    pub async fn send_text(&self, text: impl Into<String>) -> Result<Event, DeliveryError> {
        self.send(Payload::Text(text.into())).await
    }

    /// Retry a failed message.
    ///
    /// # Errors
    ///
    /// See [`Realtime::retry`].
    pub async fn retry(&self, id: &EventId) -> Result<Event, DeliveryError> {
        self.realtime.retry(&self.channel, id).await
    }

    /// Mark events as read.
    ///
    /// # Errors
    ///
    /// See [`Realtime::mark_as_read`].
    pub async fn mark_read(&self, ids: &[String]) -> Result<Vec<EventId>, DeliveryError> {
        self.realtime.mark_as_read(&self.channel, ids).await
    }

    pub async fn set_typing_status(&self, is_typing: bool) {
        self.realtime.set_typing_status(&self.channel, is_typing).await;
    }

    /// Fetch the next older page. Returns how many events were new.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails; it is also kept in
    /// [`error`](Self::error).
    pub async fn load_more(&self) -> Result<usize, DeliveryError> {
        self.state.set_loading(true);
        let result = load_page(&self.realtime, &self.channel).await;
        self.state
            .set_error(result.as_ref().err().map(ToString::to_string));
        self.state.set_loading(false);
        result
    }
}

impl Drop for ChannelView {
    fn drop(&mut self) {
        if let Some(loader) = self.loader.take() {
            loader.abort();
        }
        self.subscription.unsubscribe();
    }
}

async fn load_page(realtime: &Realtime, channel: &ChannelId) -> Result<usize, DeliveryError> {
    if channel.is_notifications() {
        let query = NotificationQuery {
            before: realtime.hub().oldest_confirmed_id(channel),
            limit: Some(realtime.config().requests.history_page),
            ..NotificationQuery::default()
        };
        realtime.notifications().refresh(&query).await
    } else {
        realtime.load_history(channel).await
    }
}
