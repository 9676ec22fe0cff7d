//! Channel identifiers.
//!
//! A channel is a chat conversation or the implicit notification stream of
//! the current user.

use std::fmt;
use thiserror::Error;

/// Maximum channel name length.
pub const MAX_CHANNEL_NAME_LENGTH: usize = 256;

/// Name of the reserved notification stream.
pub const NOTIFICATIONS_CHANNEL: &str = "$notifications";

/// Channel validation error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid channel name: {0}")]
pub struct ChannelError(pub &'static str);

/// Validate a channel name.
///
/// # Errors
///
/// Returns an error if the channel name is invalid.
pub fn validate_channel_name(name: &str) -> Result<(), ChannelError> {
    if name.is_empty() {
        return Err(ChannelError("Channel name cannot be empty"));
    }
    if name.len() > MAX_CHANNEL_NAME_LENGTH {
        return Err(ChannelError("Channel name too long"));
    }
    if name.starts_with('$') {
        return Err(ChannelError("Channel names starting with '$' are reserved"));
    }
    if !name.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err(ChannelError("Channel name contains invalid characters"));
    }
    Ok(())
}

/// A validated channel identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(String);

impl ChannelId {
    /// Create a channel id for a conversation.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is empty, too long, reserved or not
    /// printable ASCII.
    pub fn new(name: impl Into<String>) -> Result<Self, ChannelError> {
        let name = name.into();
        validate_channel_name(&name)?;
        Ok(Self(name))
    }

    /// The current user's notification stream.
    #[must_use]
    pub fn notifications() -> Self {
        Self(NOTIFICATIONS_CHANNEL.to_string())
    }

    /// Whether this is the notification stream.
    #[must_use]
    pub fn is_notifications(&self) -> bool {
        self.0 == NOTIFICATIONS_CHANNEL
    }

    /// Get the name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<&str> for ChannelId {
    type Error = ChannelError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}
