//! Typing indicators for a conversation.
//!
//! Remote participants announce `typing_status` frames. A participant who
//! stops sending refreshes is considered idle after the configured TTL, so a
//! lost `false` frame does not leave a stale indicator behind.

use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Default time after which a typing participant without refresh is dropped.
pub const DEFAULT_TYPING_TTL: Duration = Duration::from_secs(6);

/// Typing state for a single participant.
#[derive(Debug, Clone)]
pub struct TypingState {
    /// Participant id.
    pub user_id: String,
    /// When the participant started typing.
    pub started_at: Instant,
    /// Last `true` refresh.
    pub last_seen: Instant,
}

impl TypingState {
    fn new(user_id: impl Into<String>) -> Self {
        let now = Instant::now();
        Self {
            user_id: user_id.into(),
            started_at: now,
            last_seen: now,
        }
    }

    /// Check if this indicator expired.
    #[must_use]
    pub fn is_stale(&self, ttl: Duration) -> bool {
        self.last_seen.elapsed() > ttl
    }
}

/// Typing tracker for a channel.
#[derive(Debug)]
pub struct TypingTracker {
    members: HashMap<String, TypingState>,
    ttl: Duration,
}

impl TypingTracker {
    /// Create a tracker with the given expiry.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            members: HashMap::new(),
            ttl,
        }
    }

    /// Record a typing status.
    ///
    /// Returns `true` if the visible state changed (someone started or
    /// stopped typing). Refreshes of an ongoing indicator return `false`.
    pub fn update(&mut self, user_id: &str, is_typing: bool) -> bool {
        if !is_typing {
            let removed = self.members.remove(user_id).is_some();
            if removed {
                debug!(user = %user_id, "Typing stopped");
            }
            return removed;
        }

        match self.members.get_mut(user_id) {
            Some(state) if !state.is_stale(self.ttl) => {
                state.last_seen = Instant::now();
                false
            }
            _ => {
                self.members
                    .insert(user_id.to_string(), TypingState::new(user_id));
                debug!(user = %user_id, "Typing started");
                true
            }
        }
    }

    /// Check if a participant is currently typing.
    #[must_use]
    pub fn is_typing(&self, user_id: &str) -> bool {
        self.members
            .get(user_id)
            .is_some_and(|s| !s.is_stale(self.ttl))
    }

    /// Participants currently typing, sorted by id. Expired entries are skipped
    /// but not removed.
    #[must_use]
    pub fn typing_users(&self) -> Vec<String> {
        let mut users: Vec<String> = self
            .members
            .values()
            .filter(|s| !s.is_stale(self.ttl))
            .map(|s| s.user_id.clone())
            .collect();
        users.sort();
        users
    }

    /// Remove expired indicators.
    ///
    /// Returns the removed participant ids.
    pub fn prune_stale(&mut self) -> Vec<String> {
        let stale: Vec<String> = self
            .members
            .iter()
            .filter(|(_, state)| state.is_stale(self.ttl))
            .map(|(id, _)| id.clone())
            .collect();

        for id in &stale {
            self.members.remove(id);
            debug!(user = %id, "Typing indicator expired");
        }

        stale
    }

    /// Forget everyone.
    pub fn clear(&mut self) {
        self.members.clear();
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

impl Default for TypingTracker {
    fn default() -> Self {
        Self::new(DEFAULT_TYPING_TTL)
    }
}
