//! Notification center.
//!
//! Owns the current user's `$notifications` channel: durable operations on
//! notifications and surfacing of system alerts for incoming ones.

use cocoschool_core::{
    Change, ChannelId, DeliveryState, Event, EventId, Hub, Notifier, NotifyError, Permission, Subscription,
    SystemAlert, Update,
};
use cocoschool_protocol::{NotificationPreferences, NotificationQuery};
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::DeliveryError;
use crate::metrics;
use crate::store::{with_timeout, NotificationStore};

/// How many surfaced ids are remembered for deduplication.
const SURFACED_MEMORY: usize = 512;

#[derive(Default)]
struct Surfaced {
    ids: HashSet<String>,
    order: VecDeque<String>,
}

impl Surfaced {
    /// Remember a tag. Returns `false` if it was already known.
    fn insert(&mut self, tag: &str) -> bool {
        if !self.ids.insert(tag.to_string()) {
            return false;
        }
        self.order.push_back(tag.to_string());
        while self.order.len() > SURFACED_MEMORY {
            if let Some(old) = self.order.pop_front() {
                self.ids.remove(&old);
            }
        }
        true
    }
}

/// Notifications of the current user.
pub struct NotificationCenter {
    hub: Arc<Hub>,
    store: Arc<dyn NotificationStore>,
    notifier: Arc<dyn Notifier>,
    enabled: bool,
    request_timeout: Duration,
    surfaced: Mutex<Surfaced>,
}

impl NotificationCenter {
    #[must_use]
    pub fn new(
        hub: Arc<Hub>,
        store: Arc<dyn NotificationStore>,
        notifier: Arc<dyn Notifier>,
        enabled: bool,
        request_timeout: Duration,
    ) -> Self {
        Self {
            hub,
            store,
            notifier,
            enabled,
            request_timeout,
            surfaced: Mutex::new(Surfaced::default()),
        }
    }

    fn channel() -> ChannelId {
        ChannelId::notifications()
    }

    /// Show a system alert for a newly received notification.
    ///
    /// Each notification is surfaced at most once. Already read
    /// notifications are not surfaced. Without permission nothing is shown
    /// and no error is reported. Returns `true` if an alert was shown.
    pub fn surface(&self, event: &Event) -> bool {
        if !self.enabled || event.state == DeliveryState::Read {
            return false;
        }
        let Some(alert) = SystemAlert::for_event(event) else {
            return false;
        };

        let first = self
            .surfaced
            .lock()
            .map(|mut s| s.insert(&alert.tag))
            .unwrap_or(false);
        if !first {
            debug!(tag = %alert.tag, "Notification already surfaced");
            return false;
        }

        if !self.ensure_permission() {
            debug!(tag = %alert.tag, "No notification permission, staying silent");
            metrics::record_alert("silenced");
            return false;
        }

        match self.notifier.show(&alert) {
            Ok(()) => {
                metrics::record_alert("shown");
                true
            }
            Err(NotifyError::PermissionDenied) => {
                debug!(tag = %alert.tag, "Notification permission revoked");
                metrics::record_alert("silenced");
                false
            }
            Err(e) => {
                warn!(tag = %alert.tag, error = %e, "Failed to show notification");
                metrics::record_alert("failed");
                false
            }
        }
    }

    fn ensure_permission(&self) -> bool {
        match self.notifier.permission() {
            Permission::Granted => true,
            Permission::Denied => false,
            Permission::Default => {
                let granted = self.notifier.request_permission() == Permission::Granted;
                info!(granted, "Requested notification permission");
                granted
            }
        }
    }

    /// Fetch notifications and merge them into the local stream.
    ///
    /// Returns how many were not cached yet. Fetched notifications are not
    /// surfaced as alerts.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    pub async fn refresh(&self, query: &NotificationQuery) -> Result<usize, DeliveryError> {
        let fetched = with_timeout(self.request_timeout, self.store.fetch_notifications(query)).await?;
        let events: Vec<Event> = fetched.into_iter().map(Event::from_wire_notification).collect();
        let count = events.len();

        let inserted = match self.hub.merge(&Self::channel(), events)? {
            Some(Update {
                change: Change::Merged { inserted },
                ..
            }) => inserted,
            _ => 0,
        };
        debug!(fetched = count, inserted, "Notifications refreshed");
        Ok(inserted)
    }

    /// Mark notifications as read, on the server first.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails; the local state is unchanged.
    pub async fn mark_read(&self, ids: &[String]) -> Result<Vec<EventId>, DeliveryError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        with_timeout(self.request_timeout, self.store.mark_notifications_read(ids)).await?;

        Ok(match self.hub.mark_read(&Self::channel(), ids)? {
            Some(Update {
                change: Change::Read { ids },
                ..
            }) => ids,
            _ => Vec::new(),
        })
    }

    /// Delete notifications, on the server first. Returns how many were
    /// removed locally.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails; the local state is unchanged.
    pub async fn delete(&self, ids: &[String]) -> Result<usize, DeliveryError> {
        if ids.is_empty() {
            return Ok(0);
        }
        with_timeout(self.request_timeout, self.store.delete_notifications(ids)).await?;

        let channel = Self::channel();
        let mut removed = 0;
        for id in ids {
            if self.hub.remove(&channel, &EventId::confirmed(id.as_str()))?.is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Replace the notification preferences.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    pub async fn update_preferences(
        &self,
        preferences: &NotificationPreferences,
    ) -> Result<NotificationPreferences, DeliveryError> {
        Ok(with_timeout(self.request_timeout, self.store.update_preferences(preferences)).await?)
    }

    /// Cached notifications, oldest first.
    #[must_use]
    pub fn events(&self) -> Vec<Event> {
        self.hub.events(&Self::channel())
    }

    /// Number of cached notifications not read yet.
    #[must_use]
    pub fn unread_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| e.state != DeliveryState::Read)
            .count()
    }

    /// Subscribe to changes of the notification stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel limit is reached.
    pub fn subscribe<F>(&self, callback: F) -> Result<Subscription, DeliveryError>
    where
        F: Fn(&Update) + Send + Sync + 'static,
    {
        Ok(self.hub.subscribe(&Self::channel(), callback)?)
    }
}
