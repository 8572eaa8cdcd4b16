use shared::{
    domain::{ChannelId, LocalId},
    error::ApiError,
};
use thiserror::Error;

/// Errors surfaced by the synchronization engine.
///
/// Values are cheap to clone so a single failed page fetch can be handed to
/// every caller that was coalesced onto it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("{operation} request failed (status {status:?}): {message}")]
    RequestFailed {
        operation: &'static str,
        status: Option<u16>,
        message: String,
    },
    #[error("malformed event: {0}")]
    MalformedEvent(String),
    #[error("send {local_id} was not confirmed in time")]
    SendTimeout { local_id: LocalId },
    #[error("not connected: call connect before opening channels")]
    NotConnected,
    #[error("socket connection closed after exhausting reconnect attempts")]
    ConnectionClosed,
    #[error("channel session {0} is closed")]
    SessionClosed(ChannelId),
    #[error("no tracked message for {0}")]
    UnknownMessage(String),
    #[error("draft has neither content nor attachment")]
    EmptyDraft,
    #[error("configuration error: {0}")]
    Config(String),
}

impl SyncError {
    pub fn request(operation: &'static str, err: reqwest::Error) -> Self {
        SyncError::RequestFailed {
            operation,
            status: err.status().map(|status| status.as_u16()),
            message: err.to_string(),
        }
    }

    pub fn from_api(operation: &'static str, status: u16, body: ApiError) -> Self {
        SyncError::RequestFailed {
            operation,
            status: Some(status),
            message: body.message,
        }
    }

    /// Whether re-invoking the failed operation can succeed without any
    /// other intervention.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::RequestFailed { status, .. } => {
                !matches!(status, Some(400 | 401 | 403 | 404 | 422))
            }
            SyncError::Transport(_) | SyncError::SendTimeout { .. } | SyncError::NotConnected => {
                true
            }
            _ => false,
        }
    }
}
