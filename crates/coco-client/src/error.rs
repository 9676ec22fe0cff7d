//! Errors returned by the delivery API.

use cocoschool_core::{ChannelError, DeliveryState, EventError, EventId, HubError};
use thiserror::Error;

use crate::store::RequestError;

/// A data-mutating operation failed.
///
/// Connection problems never show up here: the live connection is
/// best-effort and retried in the background.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The durable request was rejected or could not be completed.
    #[error(transparent)]
    RequestFailed(RequestError),

    /// The durable request did not complete in time.
    #[error("Request timed out")]
    Timeout,

    /// The local cache refused the change.
    #[error(transparent)]
    Hub(#[from] HubError),

    /// The event is not in the local cache.
    #[error("Event not found: {0}")]
    NotFound(EventId),

    /// The event is in a state that does not allow the operation.
    #[error("Event {id} is {state:?}")]
    InvalidState { id: EventId, state: DeliveryState },

    /// The channel name is invalid.
    #[error(transparent)]
    InvalidChannel(#[from] ChannelError),

    /// The server answered with something that is not a valid event.
    #[error("Invalid event from server: {0}")]
    InvalidResponse(#[from] EventError),
}

impl From<RequestError> for DeliveryError {
    fn from(e: RequestError) -> Self {
        match e {
            RequestError::Timeout => DeliveryError::Timeout,
            other => DeliveryError::RequestFailed(other),
        }
    }
}

impl DeliveryError {
    /// Whether retrying the same operation later may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            DeliveryError::Timeout => true,
            DeliveryError::RequestFailed(RequestError::Status { status, .. }) => *status >= 500,
            DeliveryError::RequestFailed(RequestError::Transport(_)) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_is_lifted() {
        assert!(matches!(
            DeliveryError::from(RequestError::Timeout),
            DeliveryError::Timeout
        ));
    }

    #[test]
    fn test_retryable() {
        let server = DeliveryError::from(RequestError::Status {
            status: 503,
            body: String::new(),
        });
        let client = DeliveryError::from(RequestError::Status {
            status: 403,
            body: String::new(),
        });
        assert!(server.is_retryable());
        assert!(!client.is_retryable());
        assert!(!DeliveryError::NotFound(EventId::local()).is_retryable());
    }
}
