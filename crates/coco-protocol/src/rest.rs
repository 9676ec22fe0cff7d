//! Request and response bodies of the durable HTTP API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::frames::ContentKind;

/// `POST /messages`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessageRequest {
    pub chat_id: String,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: ContentKind,
    pub timestamp: DateTime<Utc>,
}

/// `POST /channel/{id}/read`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadRequest {
    pub message_ids: Vec<String>,
}

/// `POST /chat`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateChatRequest {
    pub participants: Vec<String>,
    #[serde(default)]
    pub name: String,
}

/// A conversation as returned by `POST /chat`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSummary {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub participants: Vec<String>,
}

/// `POST /notifications` filter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unread_only: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<String>,
}

/// `POST /notifications/mark-read` and `POST /notifications/delete`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationIdsRequest {
    pub notification_ids: Vec<String>,
}

/// `PUT /notifications/preferences`
///
/// The preference document is owned by the server; the client passes it through.
pub type NotificationPreferences = serde_json::Value;
