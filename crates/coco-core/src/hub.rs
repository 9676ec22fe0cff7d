//! The channel hub.
//!
//! The hub owns, per channel, the event cache, the subscriber list and the
//! typing tracker. Every mutation goes through it: the entry lock is held
//! only while the state changes and the subscriber snapshot is queued, and
//! callbacks run after the lock is released so they can read the hub or
//! (un)subscribe freely.
//!
//! Each channel has one dispatch queue. Updates enter it under the entry
//! lock, so in revision order, and a single thread at a time drains it.
//! Concurrent writers on the same channel therefore never deliver out of
//! order; a writer that finds the queue busy leaves its update to the
//! thread already draining.
//!
//! A channel lives while it has subscribers or optimistic events waiting
//! for the server. When the channel limit is hit, the least recently
//! touched detached channel is evicted to make room.

use dashmap::mapref::one::RefMut;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::cache::{EventBuffer, DEFAULT_CAPACITY};
use crate::channel::ChannelId;
use crate::event::{DeliveryState, Event, EventBody, EventId, EventKind, TransitionError};
use crate::registry::{self, Callback, SubscriberId, SubscriberList};
use crate::typing::{TypingTracker, DEFAULT_TYPING_TTL};

/// Hub errors.
#[derive(Debug, Error)]
pub enum HubError {
    /// Maximum number of channels reached.
    #[error("Maximum channels reached")]
    MaxChannelsReached,

    /// The operation needs a cacheable event (message or notification).
    #[error("Event kind {0:?} is not cached")]
    NotCacheable(EventKind),

    /// Event and target channel disagree.
    #[error("Event belongs to channel {found}, expected {expected}")]
    ChannelMismatch { expected: ChannelId, found: ChannelId },

    /// Invalid delivery state change.
    #[error(transparent)]
    Transition(#[from] TransitionError),
}

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Events kept per channel.
    pub capacity: usize,
    /// Maximum number of channels.
    pub max_channels: usize,
    /// Expiry of remote typing indicators.
    pub typing_ttl: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            max_channels: 1_000,
            typing_ttl: DEFAULT_TYPING_TTL,
        }
    }
}

/// What changed on a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    /// A new event was cached.
    Appended(Event),
    /// A cached event was replaced by a newer observation of itself.
    Replaced(Event),
    /// An optimistic event was confirmed by the server.
    Reconciled { local: EventId, event: Event },
    /// Delivery state of an event changed.
    StateChanged { id: EventId, state: DeliveryState },
    /// Events were marked as read.
    Read { ids: Vec<EventId> },
    /// An event was removed.
    Removed(EventId),
    /// Older events were merged in.
    Merged { inserted: usize },
    /// A participant started or stopped typing.
    Typing { user: String, is_typing: bool },
}

/// Notification sent to subscribers of a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Update {
    pub channel: ChannelId,
    /// Per-channel counter, incremented on every change.
    pub revision: u64,
    pub change: Change,
}

type Snapshot = Vec<(SubscriberId, Callback<Update>)>;

/// Updates of one channel waiting for delivery, oldest first.
#[derive(Default)]
struct DispatchQueue {
    pending: VecDeque<(Update, Snapshot)>,
    draining: bool,
}

/// Channel state.
struct ChannelEntry {
    buffer: EventBuffer,
    subscribers: SubscriberList<Update>,
    typing: TypingTracker,
    revision: u64,
    queue: Arc<Mutex<DispatchQueue>>,
    /// Hub clock value of the last subscribe or change.
    touched: u64,
}

impl ChannelEntry {
    fn new(config: &HubConfig, touched: u64) -> Self {
        Self {
            buffer: EventBuffer::new(config.capacity),
            subscribers: SubscriberList::new(),
            typing: TypingTracker::new(config.typing_ttl),
            revision: 0,
            queue: Arc::new(Mutex::new(DispatchQueue::default())),
            touched,
        }
    }

    /// No subscriber and nothing waiting to reconcile.
    fn is_detached(&self) -> bool {
        self.subscribers.is_empty() && !self.buffer.has_pending()
    }
}

fn lock(queue: &Mutex<DispatchQueue>) -> MutexGuard<'_, DispatchQueue> {
    // Callbacks never run under this lock, so a poisoned queue is still consistent.
    queue.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A subscription to a channel.
///
/// Dropping the handle keeps the subscription alive; call
/// [`Subscription::unsubscribe`] to stop receiving updates.
pub struct Subscription {
    hub: Weak<Hub>,
    channel: ChannelId,
    id: SubscriberId,
    active: AtomicBool,
}

impl Subscription {
    /// Stop receiving updates. Safe to call more than once.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(hub) = self.hub.upgrade() {
            hub.remove_subscriber(&self.channel, self.id);
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn channel(&self) -> &ChannelId {
        &self.channel
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Hub statistics.
#[derive(Debug, Clone, Default)]
pub struct HubStats {
    /// Number of live channels.
    pub channel_count: usize,
    /// Total subscribers across channels.
    pub subscriber_count: usize,
    /// Total cached events.
    pub cached_events: usize,
    /// Events evicted since start.
    pub evicted_total: u64,
    /// Subscriber panics caught since start.
    pub subscriber_panics: u64,
}

/// Per-channel cache and fan-out.
pub struct Hub {
    channels: DashMap<ChannelId, ChannelEntry>,
    config: HubConfig,
    evicted_total: AtomicU64,
    subscriber_panics: AtomicU64,
    clock: AtomicU64,
}

impl Hub {
    /// Create a hub with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(HubConfig::default())
    }

    /// Create a hub with custom configuration.
    #[must_use]
    pub fn with_config(config: HubConfig) -> Self {
        info!("Creating hub with config: {:?}", config);
        Self {
            channels: DashMap::new(),
            config,
            evicted_total: AtomicU64::new(0),
            subscriber_panics: AtomicU64::new(0),
            clock: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Register a callback for a channel, creating the channel if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel limit is reached.
    pub fn subscribe<F>(self: &Arc<Self>, channel: &ChannelId, callback: F) -> Result<Subscription, HubError>
    where
        F: Fn(&Update) + Send + Sync + 'static,
    {
        let callback: Callback<Update> = Arc::new(callback);
        let mut entry = self.entry_mut(channel)?;
        let id = entry.subscribers.add(callback);
        entry.touched = self.tick();

        debug!(
            channel = %channel,
            subscriber = id,
            subscribers = entry.subscribers.len(),
            "Subscribed"
        );

        Ok(Subscription {
            hub: Arc::downgrade(self),
            channel: channel.clone(),
            id,
            active: AtomicBool::new(true),
        })
    }

    fn remove_subscriber(&self, channel: &ChannelId, id: SubscriberId) {
        let last = match self.channels.get_mut(channel) {
            Some(mut entry) => {
                entry.subscribers.remove(id);
                debug!(
                    channel = %channel,
                    subscriber = id,
                    subscribers = entry.subscribers.len(),
                    "Unsubscribed"
                );
                if entry.subscribers.is_empty() {
                    entry.typing.clear();
                }
                entry.subscribers.is_empty()
            }
            None => return,
        };

        // Pending sends keep the channel until they reconcile.
        if last {
            if self.channels.remove_if(channel, |_, entry| entry.is_detached()).is_some() {
                debug!(channel = %channel, "Channel torn down");
            } else {
                debug!(channel = %channel, "Channel detached with pending events");
            }
        }
    }

    /// Apply an event to its channel.
    ///
    /// Messages and notifications go to the cache (replacing an entry with
    /// the same id), typing indicators to the typing tracker, and read
    /// receipts mark cached events as read. Returns the update dispatched to
    /// subscribers, or `None` when nothing visible changed.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel limit is reached.
    pub fn apply(&self, event: Event) -> Result<Option<Update>, HubError> {
        self.apply_event(event, true)
    }

    /// Like [`apply`](Self::apply), but only for a channel that already
    /// exists. Events for unknown channels are dropped and `None` returned.
    ///
    /// # Errors
    ///
    /// Never fails for a missing channel; see [`apply`](Self::apply).
    pub fn apply_existing(&self, event: Event) -> Result<Option<Update>, HubError> {
        self.apply_event(event, false)
    }

    fn apply_event(&self, event: Event, create: bool) -> Result<Option<Update>, HubError> {
        let channel = event.channel.clone();
        self.commit(&channel, create, |entry| {
            let change = match event.body {
                EventBody::Message(_) | EventBody::Notification(_) => {
                    let id = event.id.clone();
                    let appended = entry.buffer.append(event);
                    self.record_evictions(&channel, appended.evicted);
                    match entry.buffer.get(&id).cloned() {
                        Some(stored) if appended.replaced => Some(Change::Replaced(stored)),
                        Some(stored) => Some(Change::Appended(stored)),
                        // Older than everything in a full cache.
                        None => None,
                    }
                }
                EventBody::Typing { is_typing } => {
                    let user = event.sender.clone().unwrap_or_default();
                    entry
                        .typing
                        .update(&user, is_typing)
                        .then(|| Change::Typing { user, is_typing })
                }
                EventBody::ReadReceipt { event_ids } => {
                    let ids = entry.buffer.mark_read(&event_ids);
                    (!ids.is_empty()).then_some(Change::Read { ids })
                }
            };
            Ok(change)
        })
    }

    /// Replace the optimistic event `local` with its confirmed form.
    ///
    /// # Errors
    ///
    /// Returns an error if the confirmed event is not a message or
    /// notification, or belongs to another channel.
    pub fn reconcile(
        &self,
        channel: &ChannelId,
        local: &EventId,
        confirmed: Event,
    ) -> Result<Option<Update>, HubError> {
        if !confirmed.is_cacheable() {
            return Err(HubError::NotCacheable(confirmed.kind()));
        }
        if &confirmed.channel != channel {
            return Err(HubError::ChannelMismatch {
                expected: channel.clone(),
                found: confirmed.channel,
            });
        }

        self.commit(channel, true, |entry| {
            let id = confirmed.id.clone();
            let appended = entry.buffer.reconcile(local, confirmed);
            self.record_evictions(channel, appended.evicted);
            Ok(entry.buffer.get(&id).cloned().map(|event| Change::Reconciled {
                local: local.clone(),
                event,
            }))
        })
    }

    /// Move a cached event to another delivery state.
    ///
    /// # Errors
    ///
    /// Returns an error if the event is unknown or the transition illegal.
    pub fn transition(
        &self,
        channel: &ChannelId,
        id: &EventId,
        state: DeliveryState,
    ) -> Result<Option<Update>, HubError> {
        self.commit(channel, true, |entry| {
            entry.buffer.transition(id, state)?;
            Ok(Some(Change::StateChanged {
                id: id.clone(),
                state,
            }))
        })
    }

    /// Mark a pending event as failed.
    ///
    /// # Errors
    ///
    /// Returns an error if the event is unknown or not pending.
    pub fn mark_failed(&self, channel: &ChannelId, id: &EventId) -> Result<Option<Update>, HubError> {
        self.transition(channel, id, DeliveryState::Failed)
    }

    /// Put a failed event back to pending for a manual retry.
    ///
    /// # Errors
    ///
    /// Returns an error if the event is unknown or not failed.
    pub fn mark_pending(&self, channel: &ChannelId, id: &EventId) -> Result<Option<Update>, HubError> {
        self.transition(channel, id, DeliveryState::Pending)
    }

    /// Mark cached events as read. Ids not cached locally are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel limit is reached.
    pub fn mark_read(&self, channel: &ChannelId, ids: &[String]) -> Result<Option<Update>, HubError> {
        self.commit(channel, true, |entry| {
            let ids = entry.buffer.mark_read(ids);
            Ok((!ids.is_empty()).then_some(Change::Read { ids }))
        })
    }

    /// Remove a cached event.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel limit is reached.
    pub fn remove(&self, channel: &ChannelId, id: &EventId) -> Result<Option<Update>, HubError> {
        self.commit(channel, true, |entry| {
            Ok(entry
                .buffer
                .remove(id)
                .map(|event| Change::Removed(event.id)))
        })
    }

    /// Merge a batch of (typically older) events into the cache.
    ///
    /// # Errors
    ///
    /// Returns an error if any event is not cacheable or targets another channel.
    pub fn merge(&self, channel: &ChannelId, events: Vec<Event>) -> Result<Option<Update>, HubError> {
        if let Some(bad) = events.iter().find(|e| !e.is_cacheable()) {
            return Err(HubError::NotCacheable(bad.kind()));
        }
        if let Some(bad) = events.iter().find(|e| &e.channel != channel) {
            return Err(HubError::ChannelMismatch {
                expected: channel.clone(),
                found: bad.channel.clone(),
            });
        }

        self.commit(channel, true, |entry| {
            let mut added = Vec::new();
            let mut evicted = 0;
            for event in events {
                let id = event.id.clone();
                let appended = entry.buffer.append(event);
                if !appended.replaced {
                    added.push(id);
                }
                evicted += appended.evicted;
            }
            self.record_evictions(channel, evicted);

            // Events older than a full cache are evicted as soon as they land.
            let inserted = added
                .iter()
                .filter(|id| entry.buffer.contains(id))
                .count();
            Ok((inserted > 0).then_some(Change::Merged { inserted }))
        })
    }

    /// Ordered snapshot of a channel's cache. Empty if the channel is unknown.
    #[must_use]
    pub fn events(&self, channel: &ChannelId) -> Vec<Event> {
        self.channels
            .get(channel)
            .map(|e| e.buffer.snapshot())
            .unwrap_or_default()
    }

    /// Get one cached event.
    #[must_use]
    pub fn get(&self, channel: &ChannelId, id: &EventId) -> Option<Event> {
        self.channels
            .get(channel)
            .and_then(|e| e.buffer.get(id).cloned())
    }

    /// Participants currently typing on a channel.
    #[must_use]
    pub fn typing_users(&self, channel: &ChannelId) -> Vec<String> {
        self.channels
            .get(channel)
            .map(|e| e.typing.typing_users())
            .unwrap_or_default()
    }

    /// Server id of the oldest confirmed event cached for a channel.
    #[must_use]
    pub fn oldest_confirmed_id(&self, channel: &ChannelId) -> Option<String> {
        self.channels
            .get(channel)
            .and_then(|e| e.buffer.oldest_confirmed_id().map(str::to_string))
    }

    /// Remove expired typing indicators on every channel, notifying subscribers.
    pub fn prune_typing(&self) {
        let channels: Vec<ChannelId> = self.channels.iter().map(|e| e.key().clone()).collect();
        for channel in channels {
            let stale = match self.channels.get_mut(&channel) {
                Some(mut entry) => entry.typing.prune_stale(),
                None => continue,
            };
            for user in stale {
                let result = self.commit(&channel, false, |_| {
                    Ok(Some(Change::Typing {
                        user,
                        is_typing: false,
                    }))
                });
                if let Err(e) = result {
                    warn!(channel = %channel, error = %e, "Failed to publish typing expiry");
                }
            }
        }
    }

    /// Check if a channel exists.
    #[must_use]
    pub fn channel_exists(&self, channel: &ChannelId) -> bool {
        self.channels.contains_key(channel)
    }

    /// Get the subscriber count for a channel.
    #[must_use]
    pub fn subscriber_count(&self, channel: &ChannelId) -> usize {
        self.channels
            .get(channel)
            .map(|e| e.subscribers.len())
            .unwrap_or(0)
    }

    /// Get hub statistics.
    #[must_use]
    pub fn stats(&self) -> HubStats {
        let mut stats = HubStats {
            channel_count: self.channels.len(),
            evicted_total: self.evicted_total.load(Ordering::Relaxed),
            subscriber_panics: self.subscriber_panics.load(Ordering::Relaxed),
            ..HubStats::default()
        };
        for entry in self.channels.iter() {
            stats.subscriber_count += entry.subscribers.len();
            stats.cached_events += entry.buffer.len();
        }
        stats
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// Get or create a channel entry.
    fn entry_mut(&self, channel: &ChannelId) -> Result<RefMut<'_, ChannelId, ChannelEntry>, HubError> {
        if let Some(entry) = self.channels.get_mut(channel) {
            return Ok(entry);
        }

        // No shard lock may be held here: `len` locks every shard.
        if self.channels.len() >= self.config.max_channels && !self.evict_detached() {
            warn!(channel = %channel, "Channel limit reached");
            return Err(HubError::MaxChannelsReached);
        }

        Ok(self.channels.entry(channel.clone()).or_insert_with(|| {
            debug!(channel = %channel, "Creating new channel");
            ChannelEntry::new(&self.config, self.tick())
        }))
    }

    /// Drop the least recently touched detached channel.
    ///
    /// Returns `false` if every channel is in use.
    fn evict_detached(&self) -> bool {
        let oldest = self
            .channels
            .iter()
            .filter(|entry| entry.is_detached())
            .min_by_key(|entry| entry.touched)
            .map(|entry| entry.key().clone());

        let Some(channel) = oldest else {
            return false;
        };
        let evicted = self
            .channels
            .remove_if(&channel, |_, entry| entry.is_detached())
            .is_some();
        if evicted {
            debug!(channel = %channel, "Evicted detached channel");
        }
        evicted
    }

    /// Run a mutation under the channel lock and queue its change for the
    /// subscribers registered at that moment.
    ///
    /// With `create` unset, a missing channel is left alone and `None`
    /// returned.
    fn commit<F>(&self, channel: &ChannelId, create: bool, mutate: F) -> Result<Option<Update>, HubError>
    where
        F: FnOnce(&mut ChannelEntry) -> Result<Option<Change>, HubError>,
    {
        let (update, drain) = {
            let mut entry = if create {
                self.entry_mut(channel)?
            } else {
                match self.channels.get_mut(channel) {
                    Some(entry) => entry,
                    None => {
                        trace!(channel = %channel, "Dropping update for unknown channel");
                        return Ok(None);
                    }
                }
            };
            let Some(change) = mutate(&mut *entry)? else {
                return Ok(None);
            };
            entry.revision += 1;
            entry.touched = self.tick();
            let update = Update {
                channel: channel.clone(),
                revision: entry.revision,
                change,
            };

            let queue = Arc::clone(&entry.queue);
            let first = {
                let mut pending = lock(&queue);
                pending
                    .pending
                    .push_back((update.clone(), entry.subscribers.snapshot()));
                !std::mem::replace(&mut pending.draining, true)
            };
            (update, first.then_some(queue))
        };

        if let Some(queue) = drain {
            self.drain(&queue);
        }
        Ok(Some(update))
    }

    /// Deliver queued updates until the queue is empty. No lock is held
    /// while callbacks run.
    fn drain(&self, queue: &Mutex<DispatchQueue>) {
        loop {
            let (update, subscribers) = {
                let mut pending = lock(queue);
                match pending.pending.pop_front() {
                    Some(next) => next,
                    None => {
                        pending.draining = false;
                        return;
                    }
                }
            };

            trace!(channel = %update.channel, revision = update.revision, "Dispatching update");
            let report = registry::dispatch(&subscribers, &update);
            if report.panicked > 0 {
                self.subscriber_panics
                    .fetch_add(report.panicked as u64, Ordering::Relaxed);
            }
        }
    }

    fn record_evictions(&self, channel: &ChannelId, evicted: usize) {
        if evicted > 0 {
            debug!(channel = %channel, evicted, "Evicted oldest events");
            self.evicted_total
                .fetch_add(evicted as u64, Ordering::Relaxed);
        }
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}
