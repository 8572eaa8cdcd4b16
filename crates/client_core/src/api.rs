use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use shared::{
    domain::{ChannelId, ChannelKind, MessageId, UserId},
    error::{ApiError, ErrorCode},
    protocol::{
        ChannelPayload, EditMessageRequest, HistoryPage, MessageEnvelope, MessagePayload,
        ProfilePayload, SendMessageRequest,
    },
};
use tracing::debug;

use crate::error::SyncError;

/// REST operations the engine depends on.
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// One page of history, ascending by time. Page 1 is the newest.
    async fn history(
        &self,
        channel_id: &ChannelId,
        kind: ChannelKind,
        page: u32,
        limit: u32,
    ) -> Result<Vec<MessagePayload>, SyncError>;

    async fn send(
        &self,
        kind: ChannelKind,
        request: SendMessageRequest,
    ) -> Result<MessagePayload, SyncError>;

    async fn edit(&self, message_id: &MessageId, content: &str)
        -> Result<MessagePayload, SyncError>;

    async fn delete(&self, message_id: &MessageId) -> Result<(), SyncError>;

    async fn channel(&self, channel_id: &ChannelId) -> Result<ChannelPayload, SyncError>;

    async fn profile(&self, user_id: &UserId) -> Result<ProfilePayload, SyncError>;
}

#[derive(Debug, Clone)]
pub struct HttpChatApi {
    http: Client,
    base_url: String,
    token: String,
}

impl HttpChatApi {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url, token)
    }

    pub fn with_client(http: Client, base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn history(
        &self,
        channel_id: &ChannelId,
        kind: ChannelKind,
        page: u32,
        limit: u32,
    ) -> Result<Vec<MessagePayload>, SyncError> {
        let scope = if kind.is_group() { "group" } else { "conversation" };
        debug!(channel_id = %channel_id, page, limit, "api: fetching history page");
        let response = self
            .http
            .get(format!("{}/messages/{scope}/{channel_id}", self.base_url))
            .bearer_auth(&self.token)
            .query(&[("page", page), ("limit", limit)])
            .send()
            .await
            .map_err(|e| SyncError::request("history", e))?;
        let page: HistoryPage = decode("history", response).await?;
        Ok(page.messages)
    }

    async fn send(
        &self,
        kind: ChannelKind,
        request: SendMessageRequest,
    ) -> Result<MessagePayload, SyncError> {
        let route = if kind.is_group() { "group" } else { "send" };
        let response = self
            .http
            .post(format!("{}/messages/{route}", self.base_url))
            .bearer_auth(&self.token)
            .json(&request)
            .send()
            .await
            .map_err(|e| SyncError::request("send", e))?;
        let envelope: MessageEnvelope = decode("send", response).await?;
        Ok(envelope.message)
    }

    async fn edit(
        &self,
        message_id: &MessageId,
        content: &str,
    ) -> Result<MessagePayload, SyncError> {
        let response = self
            .http
            .put(format!("{}/messages/edit/{message_id}", self.base_url))
            .bearer_auth(&self.token)
            .json(&EditMessageRequest {
                content: content.to_string(),
            })
            .send()
            .await
            .map_err(|e| SyncError::request("edit", e))?;
        let envelope: MessageEnvelope = decode("edit", response).await?;
        Ok(envelope.message)
    }

    async fn delete(&self, message_id: &MessageId) -> Result<(), SyncError> {
        let response = self
            .http
            .delete(format!("{}/messages/delete/{message_id}", self.base_url))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| SyncError::request("delete", e))?;
        check("delete", response).await.map(|_| ())
    }

    async fn channel(&self, channel_id: &ChannelId) -> Result<ChannelPayload, SyncError> {
        let response = self
            .http
            .get(format!("{}/conversation/{channel_id}", self.base_url))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| SyncError::request("channel", e))?;
        decode("channel", response).await
    }

    async fn profile(&self, user_id: &UserId) -> Result<ProfilePayload, SyncError> {
        let response = self
            .http
            .get(format!("{}/user/profile/{user_id}", self.base_url))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| SyncError::request("profile", e))?;
        decode("profile", response).await
    }
}

/// Turns a non-2xx response into `RequestFailed`, using the server's JSON
/// error body when it has one.
async fn check(operation: &'static str, response: Response) -> Result<Response, SyncError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let raw = response.text().await.unwrap_or_default();
    let body = serde_json::from_str::<ApiError>(&raw)
        .unwrap_or_else(|_| ApiError::new(ErrorCode::from_status(status.as_u16()), raw.trim()));
    Err(SyncError::from_api(operation, status.as_u16(), body))
}

async fn decode<T: DeserializeOwned>(
    operation: &'static str,
    response: Response,
) -> Result<T, SyncError> {
    check(operation, response)
        .await?
        .json::<T>()
        .await
        .map_err(|e| SyncError::request(operation, e))
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
