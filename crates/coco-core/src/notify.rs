//! System notifications.
//!
//! Platform notifications are surfaced through the [`Notifier`] seam. The
//! alert text is derived from the notification type; the tag is the event id
//! so the platform collapses repeated surfacing of the same event.

use thiserror::Error;
use tracing::info;

use crate::event::{Event, EventBody, Notice};

/// Icon used when a notification type has no dedicated one.
pub const DEFAULT_ICON: &str = "/icons/default.png";

/// A platform-level alert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemAlert {
    pub title: String,
    pub body: String,
    pub icon: String,
    /// Deduplication tag, equal to the event id.
    pub tag: String,
}

impl SystemAlert {
    /// Format an alert for a notification.
    #[must_use]
    pub fn for_notice(tag: impl Into<String>, notice: &Notice) -> Self {
        let message = notice.message.clone().unwrap_or_default();
        let (title, body, icon) = match notice.kind.as_str() {
            "ride_request" => (
                "New ride request".to_string(),
                format!(
                    "{} would like to join your ride",
                    notice.sender_name.as_deref().unwrap_or("Someone")
                ),
                "/icons/ride.png",
            ),
            "ride_accepted" => (
                "Ride accepted".to_string(),
                "Your ride request was accepted".to_string(),
                "/icons/accepted.png",
            ),
            "ride_cancelled" => ("Ride cancelled".to_string(), message, "/icons/cancelled.png"),
            "emergency" => ("⚠️ Alert".to_string(), message, "/icons/emergency.png"),
            "admin" => ("Message from the administrator".to_string(), message, "/icons/admin.png"),
            _ => ("Notification".to_string(), message, DEFAULT_ICON),
        };

        Self {
            title,
            body,
            icon: icon.to_string(),
            tag: tag.into(),
        }
    }

    /// Format an alert for a notification event. Returns `None` for other kinds.
    #[must_use]
    pub fn for_event(event: &Event) -> Option<Self> {
        match &event.body {
            EventBody::Notification(notice) => Some(Self::for_notice(event.id.to_string(), notice)),
            _ => None,
        }
    }
}

/// Notification permission as granted by the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    /// Not asked yet.
    Default,
    Granted,
    Denied,
}

/// Errors surfacing an alert.
#[derive(Debug, Error)]
pub enum NotifyError {
    /// The user refused notifications.
    #[error("Notification permission denied")]
    PermissionDenied,

    /// The platform has no notification support.
    #[error("System notifications are not supported")]
    Unsupported,

    /// Platform failure.
    #[error("Notification failed: {0}")]
    Platform(String),
}

/// A platform notification surface.
pub trait Notifier: Send + Sync {
    /// Current permission.
    fn permission(&self) -> Permission;

    /// Ask the user for permission. Returns the resulting permission.
    fn request_permission(&self) -> Permission;

    /// Show an alert.
    ///
    /// # Errors
    ///
    /// Returns an error if the alert could not be shown.
    fn show(&self, alert: &SystemAlert) -> Result<(), NotifyError>;
}

/// Notifier that writes alerts to the log. Used where no desktop surface exists.
#[derive(Debug, Clone)]
pub struct LogNotifier {
    app_name: String,
}

impl LogNotifier {
    #[must_use]
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
        }
    }
}

impl Notifier for LogNotifier {
    fn permission(&self) -> Permission {
        Permission::Granted
    }

    fn request_permission(&self) -> Permission {
        Permission::Granted
    }

    fn show(&self, alert: &SystemAlert) -> Result<(), NotifyError> {
        info!(
            app = %self.app_name,
            title = %alert.title,
            body = %alert.body,
            tag = %alert.tag,
            "System notification"
        );
        Ok(())
    }
}
