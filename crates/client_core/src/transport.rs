//! The physical socket: one connection, decoded inbound frames, outbound
//! control requests.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use shared::{
    domain::UserId,
    protocol::{ClientRequest, ServerEvent},
};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{header::AUTHORIZATION, HeaderValue},
        Message,
    },
};
use tracing::{debug, warn};
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user_id: UserId,
    pub token: String,
}

impl Credentials {
    pub fn new(user_id: impl Into<UserId>, token: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            token: token.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportFrame {
    Event(ServerEvent),
    Malformed { raw: String, reason: String },
    Closed { reason: Option<String> },
}

/// Both directions of one open socket. Dropping the link closes it.
#[derive(Debug)]
pub struct TransportLink {
    pub outbound: mpsc::UnboundedSender<ClientRequest>,
    pub inbound: mpsc::UnboundedReceiver<TransportFrame>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, credentials: &Credentials) -> Result<TransportLink>;
}

#[derive(Debug, Clone)]
pub struct WsTransport {
    socket_url: Url,
}

impl WsTransport {
    /// Derives the socket URL from the REST base URL (`http` → `ws`,
    /// `https` → `wss`) and the configured socket path.
    pub fn from_server_url(server_url: &str, socket_path: &str) -> Result<Self> {
        let mut socket_url =
            Url::parse(server_url).with_context(|| format!("invalid server url: {server_url}"))?;
        let scheme = match socket_url.scheme() {
            "http" => "ws",
            "https" => "wss",
            other => return Err(anyhow!("server_url must be http or https, got {other}")),
        };
        socket_url
            .set_scheme(scheme)
            .map_err(|_| anyhow!("cannot switch {server_url} to {scheme}"))?;
        socket_url.set_path(socket_path);
        Ok(Self { socket_url })
    }

    pub fn socket_url(&self) -> &Url {
        &self.socket_url
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn open(&self, credentials: &Credentials) -> Result<TransportLink> {
        let mut url = self.socket_url.clone();
        url.query_pairs_mut()
            .append_pair("userId", credentials.user_id.as_str());

        let mut request = url
            .as_str()
            .into_client_request()
            .context("failed to build websocket request")?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", credentials.token))
            .context("token is not a valid header value")?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (ws_stream, _) = connect_async(request)
            .await
            .with_context(|| format!("failed to connect websocket: {}", self.socket_url))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ClientRequest>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(request) = outbound_rx.recv().await {
                let text = match serde_json::to_string(&request) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(error = %err, "socket: failed to encode control request");
                        continue;
                    }
                };
                if let Err(err) = ws_writer.send(Message::Text(text)).await {
                    debug!(error = %err, "socket: writer stopped");
                    return;
                }
            }
            let _ = ws_writer.send(Message::Close(None)).await;
        });

        tokio::spawn(async move {
            let reason = loop {
                let frame = match ws_reader.next().await {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerEvent>(&text) {
                        Ok(event) => TransportFrame::Event(event),
                        Err(err) => TransportFrame::Malformed {
                            raw: text,
                            reason: err.to_string(),
                        },
                    },
                    Some(Ok(Message::Close(close))) => {
                        break close.map(|frame| frame.reason.to_string());
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => break Some(err.to_string()),
                    None => break None,
                };
                if inbound_tx.send(frame).is_err() {
                    return;
                }
            };
            let _ = inbound_tx.send(TransportFrame::Closed { reason });
        });

        Ok(TransportLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
