//! Durable request collaborator.
//!
//! The REST API is the source of truth: a message exists once `POST
//! /messages` succeeded, whatever happened on the live connection.

use async_trait::async_trait;
use cocoschool_protocol::{
    ChatSummary, CreateChatRequest, NewMessageRequest, NotificationIdsRequest,
    NotificationPreferences, NotificationQuery, ReadRequest, WireMessage, WireNotification,
};
use reqwest::{Client, RequestBuilder, Response, Url};
use serde::de::DeserializeOwned;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// A durable request failed.
#[derive(Debug, Error)]
pub enum RequestError {
    /// The server answered with a non-success status.
    #[error("Server rejected request with status {status}: {body}")]
    Status { status: u16, body: String },

    /// The request did not complete in time.
    #[error("Request timed out")]
    Timeout,

    /// The request could not be sent or the response not read.
    #[error("Request failed: {0}")]
    Transport(String),

    /// The response body was not what we expected.
    #[error("Invalid response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for RequestError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            RequestError::Timeout
        } else if e.is_decode() {
            RequestError::Decode(e.to_string())
        } else if let Some(status) = e.status() {
            RequestError::Status {
                status: status.as_u16(),
                body: e.to_string(),
            }
        } else {
            RequestError::Transport(e.to_string())
        }
    }
}

/// Bound a durable request by `limit`.
///
/// # Errors
///
/// Returns [`RequestError::Timeout`] if the request does not finish in time,
/// or the request's own error.
pub async fn with_timeout<T, F>(limit: Duration, request: F) -> Result<T, RequestError>
where
    F: Future<Output = Result<T, RequestError>>,
{
    tokio::time::timeout(limit, request)
        .await
        .map_err(|_| RequestError::Timeout)?
}

/// Chat persistence.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a message. Returns it with its server id.
    async fn post_message(&self, request: &NewMessageRequest) -> Result<WireMessage, RequestError>;

    /// Fetch up to `limit` messages of a conversation older than `before`.
    async fn fetch_messages(
        &self,
        chat_id: &str,
        limit: u32,
        before: Option<&str>,
    ) -> Result<Vec<WireMessage>, RequestError>;

    /// Mark messages as read.
    async fn mark_read(&self, chat_id: &str, message_ids: &[String]) -> Result<(), RequestError>;

    /// Create a conversation.
    async fn create_chat(&self, participants: &[String], name: &str) -> Result<ChatSummary, RequestError>;
}

/// Notification persistence.
#[async_trait]
pub trait NotificationStore: Send + Sync {
    async fn fetch_notifications(
        &self,
        query: &NotificationQuery,
    ) -> Result<Vec<WireNotification>, RequestError>;

    async fn mark_notifications_read(&self, ids: &[String]) -> Result<(), RequestError>;

    async fn delete_notifications(&self, ids: &[String]) -> Result<(), RequestError>;

    /// Replace the user's notification preferences. Returns the stored document.
    async fn update_preferences(
        &self,
        preferences: &NotificationPreferences,
    ) -> Result<NotificationPreferences, RequestError>;
}

/// REST implementation of both stores.
#[derive(Debug, Clone)]
pub struct HttpStore {
    client: Client,
    base_url: Url,
    token: Option<String>,
}

impl HttpStore {
    /// Create a store rooted at `base_url` (e.g. `http://host/api`).
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the HTTP client cannot be built.
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self, RequestError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| RequestError::Transport(format!("Invalid API URL {base_url}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(RequestError::Transport(format!("Invalid API URL {base_url}")));
        }

        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url,
            token,
        })
    }

    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        // Checked in `new`.
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn execute(&self, request: RequestBuilder) -> Result<Response, RequestError> {
        let response = self.authorized(request).send().await?;
        let status = response.status();

        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            debug!(status = status.as_u16(), body = %body, "Request rejected");
            return Err(RequestError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response)
    }

    async fn json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, RequestError> {
        self.execute(request)
            .await?
            .json::<T>()
            .await
            .map_err(|e| RequestError::Decode(e.to_string()))
    }
}

#[async_trait]
impl MessageStore for HttpStore {
    async fn post_message(&self, request: &NewMessageRequest) -> Result<WireMessage, RequestError> {
        let url = self.url(&["messages"]);
        self.json(self.client.post(url).json(request)).await
    }

    async fn fetch_messages(
        &self,
        chat_id: &str,
        limit: u32,
        before: Option<&str>,
    ) -> Result<Vec<WireMessage>, RequestError> {
        let mut url = self.url(&["channel", chat_id, "messages"]);
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("limit", &limit.to_string());
            if let Some(before) = before {
                query.append_pair("before", before);
            }
        }
        self.json(self.client.get(url)).await
    }

    async fn mark_read(&self, chat_id: &str, message_ids: &[String]) -> Result<(), RequestError> {
        let url = self.url(&["channel", chat_id, "read"]);
        let body = ReadRequest {
            message_ids: message_ids.to_vec(),
        };
        self.execute(self.client.post(url).json(&body)).await?;
        Ok(())
    }

    async fn create_chat(&self, participants: &[String], name: &str) -> Result<ChatSummary, RequestError> {
        let url = self.url(&["chat"]);
        let body = CreateChatRequest {
            participants: participants.to_vec(),
            name: name.to_string(),
        };
        self.json(self.client.post(url).json(&body)).await
    }
}

#[async_trait]
impl NotificationStore for HttpStore {
    async fn fetch_notifications(
        &self,
        query: &NotificationQuery,
    ) -> Result<Vec<WireNotification>, RequestError> {
        let url = self.url(&["notifications"]);
        self.json(self.client.post(url).json(query)).await
    }

    async fn mark_notifications_read(&self, ids: &[String]) -> Result<(), RequestError> {
        let url = self.url(&["notifications", "mark-read"]);
        let body = NotificationIdsRequest {
            notification_ids: ids.to_vec(),
        };
        self.execute(self.client.post(url).json(&body)).await?;
        Ok(())
    }

    async fn delete_notifications(&self, ids: &[String]) -> Result<(), RequestError> {
        let url = self.url(&["notifications", "delete"]);
        let body = NotificationIdsRequest {
            notification_ids: ids.to_vec(),
        };
        self.execute(self.client.post(url).json(&body)).await?;
        Ok(())
    }

    async fn update_preferences(
        &self,
        preferences: &NotificationPreferences,
    ) -> Result<NotificationPreferences, RequestError> {
        let url = self.url(&["notifications", "preferences"]);
        self.json(self.client.put(url).json(preferences)).await
    }
}
