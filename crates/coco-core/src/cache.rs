//! Bounded per-channel event cache.
//!
//! Events are kept ordered by creation time. Appending an event whose id is
//! already present replaces the existing entry instead of adding a second one,
//! which is how optimistic messages turn into confirmed ones without being
//! displayed twice.

use std::collections::{HashSet, VecDeque};
use tracing::trace;

use crate::event::{DeliveryState, Event, EventId, TransitionError};

/// Default number of events kept per channel.
pub const DEFAULT_CAPACITY: usize = 50;

/// Result of an append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Appended {
    /// An entry with the same id existed and was replaced.
    pub replaced: bool,
    /// Number of oldest entries evicted to get back under capacity.
    pub evicted: usize,
}

/// Ordered, bounded buffer of events for one channel.
#[derive(Debug, Clone)]
pub struct EventBuffer {
    events: VecDeque<Event>,
    capacity: usize,
}

impl EventBuffer {
    /// Create a buffer holding at most `capacity` events.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity.min(DEFAULT_CAPACITY)),
            capacity: capacity.max(1),
        }
    }

    /// Insert an event in chronological order, or replace the entry with the
    /// same id. Replacing merges delivery states so a late echo never moves a
    /// message backwards (e.g. `Read` back to `Sent`).
    pub fn append(&mut self, event: Event) -> Appended {
        if let Some(pos) = self.position(&event.id) {
            let existing = &mut self.events[pos];
            let state = existing.state.merge(event.state);
            *existing = Event { state, ..event };
            self.reposition(pos);
            return Appended {
                replaced: true,
                evicted: 0,
            };
        }

        // Equal timestamps keep arrival order.
        let at = self
            .events
            .partition_point(|e| e.created_at <= event.created_at);
        trace!(id = %event.id, position = at, "Inserting event");
        self.events.insert(at, event);

        Appended {
            replaced: false,
            evicted: self.evict_overflow(),
        }
    }

    /// Replace the optimistic entry `local` with its confirmed form.
    ///
    /// If the confirmed event already arrived through another path (a socket
    /// echo racing the HTTP response), the local entry is dropped and the
    /// confirmed entry updated, so only one copy remains.
    pub fn reconcile(&mut self, local: &EventId, confirmed: Event) -> Appended {
        let local_pos = self.position(local);

        if self.position(&confirmed.id).is_some() {
            if let Some(pos) = local_pos {
                self.events.remove(pos);
            }
            return self.append(confirmed);
        }

        match local_pos {
            Some(pos) => {
                let existing = &mut self.events[pos];
                let state = existing.state.merge(confirmed.state);
                *existing = Event { state, ..confirmed };
                self.reposition(pos);
                Appended {
                    replaced: true,
                    evicted: 0,
                }
            }
            // Local entry was evicted or discarded in the meantime.
            None => self.append(confirmed),
        }
    }

    /// Drop the oldest events until the buffer is back at capacity.
    ///
    /// Returns the number of evicted events.
    pub fn evict_overflow(&mut self) -> usize {
        let mut evicted = 0;
        while self.events.len() > self.capacity {
            if let Some(old) = self.events.pop_front() {
                trace!(id = %old.id, "Evicting event");
            }
            evicted += 1;
        }
        evicted
    }

    /// Move every event whose server id is in `ids` to `Read`.
    ///
    /// Unknown ids are ignored. Returns the ids that changed.
    pub fn mark_read(&mut self, ids: &[String]) -> Vec<EventId> {
        let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
        let mut changed = Vec::new();

        for event in &mut self.events {
            let Some(id) = event.id.as_confirmed() else {
                continue;
            };
            if wanted.contains(id) && event.state.can_transition_to(DeliveryState::Read) {
                event.state = DeliveryState::Read;
                changed.push(event.id.clone());
            }
        }

        changed
    }

    /// Apply a delivery state transition to one event.
    ///
    /// # Errors
    ///
    /// Returns an error if the event is unknown or the transition is illegal.
    pub fn transition(&mut self, id: &EventId, next: DeliveryState) -> Result<(), TransitionError> {
        let event = self
            .events
            .iter_mut()
            .find(|e| &e.id == id)
            .ok_or_else(|| TransitionError::NotFound(id.clone()))?;

        if !event.state.can_transition_to(next) {
            return Err(TransitionError::Invalid {
                from: event.state,
                to: next,
            });
        }
        event.state = next;
        Ok(())
    }

    /// Remove an event.
    pub fn remove(&mut self, id: &EventId) -> Option<Event> {
        let pos = self.position(id)?;
        self.events.remove(pos)
    }

    /// Get an event by id.
    #[must_use]
    pub fn get(&self, id: &EventId) -> Option<&Event> {
        self.events.iter().find(|e| &e.id == id)
    }

    /// Whether an event with this id is cached.
    #[must_use]
    pub fn contains(&self, id: &EventId) -> bool {
        self.position(id).is_some()
    }

    /// Whether an optimistic event is still waiting for the server.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.events.iter().any(|e| e.state == DeliveryState::Pending)
    }

    /// Copy of the current ordered contents.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Event> {
        self.events.iter().cloned().collect()
    }

    /// Iterate over events, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        self.events.iter()
    }

    /// Server id of the oldest confirmed event, used as a history cursor.
    #[must_use]
    pub fn oldest_confirmed_id(&self) -> Option<&str> {
        self.events.iter().find_map(|e| e.id.as_confirmed())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn position(&self, id: &EventId) -> Option<usize> {
        self.events.iter().position(|e| &e.id == id)
    }

    /// Restore ordering after the entry at `pos` changed its timestamp.
    fn reposition(&mut self, pos: usize) {
        let ts = self.events[pos].created_at;
        let before_ok = pos == 0 || self.events[pos - 1].created_at <= ts;
        let after_ok = pos + 1 >= self.events.len() || self.events[pos + 1].created_at >= ts;
        if before_ok && after_ok {
            return;
        }

        if let Some(event) = self.events.remove(pos) {
            let at = self.events.partition_point(|e| e.created_at <= ts);
            self.events.insert(at, event);
        }
    }
}

impl Default for EventBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
