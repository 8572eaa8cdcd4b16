#[cfg(test)]
#[macro_use]
#[path = "tests/support.rs"]
mod test_support;

pub mod api;
pub mod config;
pub mod connection;
pub mod directory;
pub mod error;
pub mod model;
pub mod optimistic;
pub mod pagination;
pub mod router;
pub mod session;
pub mod store;
pub mod transport;

use std::sync::Arc;

use shared::domain::{ChannelId, ChannelKind};
use tracing::info;

pub use crate::{
    api::{ChatApi, HttpChatApi},
    config::{ReconnectPolicy, SyncConfig},
    connection::{ConnectionHandle, ConnectionManager, ConnectionState, SessionState},
    directory::UserDirectoryCache,
    error::SyncError,
    model::{Channel, DeliveryStatus, Draft, Message, TimelineEntry, UserProfile},
    session::{ChannelSession, SessionContext, SessionUpdate},
    transport::{Credentials, Transport, WsTransport},
};

/// Entry point for embedding the engine: owns the REST client, the profile
/// cache and the socket, and opens channel sessions on top of them.
pub struct ChatClient {
    config: SyncConfig,
    api: Arc<dyn ChatApi>,
    directory: Arc<UserDirectoryCache>,
    connections: ConnectionManager,
}

impl ChatClient {
    pub fn new(config: SyncConfig, api: Arc<dyn ChatApi>, transport: Arc<dyn Transport>) -> Self {
        let directory = Arc::new(UserDirectoryCache::new(
            Arc::clone(&api),
            config.server_url.clone(),
        ));
        let connections = ConnectionManager::new(transport, config.reconnect_policy());
        Self {
            config,
            api,
            directory,
            connections,
        }
    }

    /// Client wired to the real HTTP API and websocket described by `config`.
    pub fn with_http(config: SyncConfig, token: &str) -> Result<Self, SyncError> {
        config
            .validate()
            .map_err(|err| SyncError::Config(err.to_string()))?;
        let transport = WsTransport::from_server_url(&config.server_url, &config.socket_path)
            .map_err(|err| SyncError::Config(format!("{err:#}")))?;
        let api = HttpChatApi::new(config.server_url.clone(), token);
        Ok(Self::new(config, Arc::new(api), Arc::new(transport)))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn directory(&self) -> &Arc<UserDirectoryCache> {
        &self.directory
    }

    /// Starts (or reuses) the socket for `credentials`. Returns immediately;
    /// use [`ConnectionHandle::wait_until_open`] to wait for the handshake.
    pub fn connect(&self, credentials: Credentials) -> ConnectionHandle {
        info!(user_id = %credentials.user_id, server_url = %self.config.server_url, "client: connecting");
        self.connections.connect(credentials)
    }

    pub fn connection(&self) -> Option<ConnectionHandle> {
        self.connections.current()
    }

    pub fn open_channel(
        &self,
        channel_id: ChannelId,
        kind: ChannelKind,
    ) -> Result<ChannelSession, SyncError> {
        let connection = self.connections.current().ok_or(SyncError::NotConnected)?;
        ChannelSession::open(
            SessionContext {
                api: Arc::clone(&self.api),
                connection,
                directory: Arc::clone(&self.directory),
                page_size: self.config.page_size,
                send_timeout: self.config.send_timeout(),
            },
            channel_id,
            kind,
        )
    }

    pub fn disconnect(&self) {
        self.connections.disconnect();
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
