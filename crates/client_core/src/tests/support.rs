//! In-memory fakes shared by the engine tests.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use shared::{
    domain::{ChannelId, ChannelKind, MessageId, UserId},
    protocol::{
        ChannelPayload, ClientRequest, MessagePayload, ProfilePayload, SendMessageRequest,
        ServerEvent,
    },
};
use tokio::sync::mpsc;

use crate::{
    api::ChatApi,
    error::SyncError,
    model::Message,
    transport::{Credentials, Transport, TransportFrame, TransportLink},
};

macro_rules! eventually {
    ($cond:expr) => {{
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(2);
        loop {
            if $cond {
                break;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("condition never held: {}", stringify!($cond));
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    }};
}

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0)
        .single()
        .expect("valid timestamp")
}

pub fn payload(id: &str, channel: &str, secs: i64, content: &str) -> MessagePayload {
    MessagePayload {
        message_id: MessageId::from(id),
        channel_id: ChannelId::from(channel),
        sender_id: UserId::from("u2"),
        content: content.to_string(),
        attachment: None,
        created_at: at(secs),
        edited_at: None,
        is_edited: false,
        client_ref: None,
    }
}

pub fn message(id: &str, secs: i64, content: &str) -> Message {
    Message::from(payload(id, "c1", secs, content))
}

pub fn failure(operation: &'static str, status: u16) -> SyncError {
    SyncError::RequestFailed {
        operation,
        status: Some(status),
        message: "boom".into(),
    }
}

/// Server half of a fake socket.
pub struct ServerEnd {
    pub credentials: Credentials,
    requests: mpsc::UnboundedReceiver<ClientRequest>,
    frames: mpsc::UnboundedSender<TransportFrame>,
}

impl ServerEnd {
    pub async fn expect_request(&mut self) -> ClientRequest {
        tokio::time::timeout(Duration::from_secs(2), self.requests.recv())
            .await
            .expect("timed out waiting for control request")
            .expect("client closed the socket")
    }

    pub fn try_request(&mut self) -> Option<ClientRequest> {
        self.requests.try_recv().ok()
    }

    pub fn push(&self, event: ServerEvent) {
        let _ = self.frames.send(TransportFrame::Event(event));
    }

    pub fn push_raw(&self, raw: &str) {
        let _ = self.frames.send(TransportFrame::Malformed {
            raw: raw.to_string(),
            reason: "test".into(),
        });
    }

    pub fn close(&self) {
        let _ = self.frames.send(TransportFrame::Closed {
            reason: Some("server restart".into()),
        });
    }
}

pub struct FakeTransport {
    ends: mpsc::UnboundedSender<ServerEnd>,
    refuse: AtomicU32,
    opens: AtomicU32,
}

impl FakeTransport {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerEnd>) {
        let (ends, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                ends,
                refuse: AtomicU32::new(0),
                opens: AtomicU32::new(0),
            }),
            rx,
        )
    }

    pub fn refuse_next(&self, count: u32) {
        self.refuse.store(count, Ordering::SeqCst);
    }

    pub fn opens(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn open(&self, credentials: &Credentials) -> anyhow::Result<TransportLink> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .refuse
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(anyhow!("connection refused"));
        }
        let (outbound, requests) = mpsc::unbounded_channel();
        let (frames, inbound) = mpsc::unbounded_channel();
        self.ends
            .send(ServerEnd {
                credentials: credentials.clone(),
                requests,
                frames,
            })
            .map_err(|_| anyhow!("test dropped the server side"))?;
        Ok(TransportLink { outbound, inbound })
    }
}

pub async fn next_end(ends: &mut mpsc::UnboundedReceiver<ServerEnd>) -> ServerEnd {
    tokio::time::timeout(Duration::from_secs(5), ends.recv())
        .await
        .expect("timed out waiting for socket")
        .expect("transport dropped")
}

#[derive(Default)]
pub struct FakeApi {
    pub pages: Mutex<HashMap<u32, Result<Vec<MessagePayload>, SyncError>>>,
    pub page_requests: Mutex<Vec<u32>>,
    pub history_delay: Mutex<Duration>,
    pub send_delay: Mutex<Duration>,
    pub send_failure: Mutex<Option<SyncError>>,
    pub sent: Mutex<Vec<SendMessageRequest>>,
    pub edits: Mutex<Vec<(MessageId, String)>>,
    pub deletes: Mutex<Vec<MessageId>>,
    pub channels: Mutex<HashMap<ChannelId, ChannelPayload>>,
    pub profiles: Mutex<HashMap<UserId, ProfilePayload>>,
    pub failing_profiles: Mutex<HashSet<UserId>>,
    pub profile_calls: Mutex<Vec<UserId>>,
    pub profile_delay: Mutex<Duration>,
    pub channel_calls: AtomicUsize,
    next_id: AtomicU64,
}

impl FakeApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_page(&self, page: u32, result: Result<Vec<MessagePayload>, SyncError>) {
        self.pages.lock().expect("lock").insert(page, result);
    }

    pub fn page_requests(&self) -> Vec<u32> {
        self.page_requests.lock().expect("lock").clone()
    }

    pub fn set_channel(&self, channel: ChannelPayload) {
        self.channels
            .lock()
            .expect("lock")
            .insert(channel.channel_id.clone(), channel);
    }

    pub fn set_profile(&self, id: &str, username: &str, avatar: Option<&str>) {
        self.profiles.lock().expect("lock").insert(
            UserId::from(id),
            ProfilePayload {
                id: UserId::from(id),
                username: username.to_string(),
                avatar_url: avatar.map(str::to_string),
            },
        );
    }

    pub fn fail_profile(&self, id: &str) {
        self.failing_profiles
            .lock()
            .expect("lock")
            .insert(UserId::from(id));
    }

    pub fn profile_calls(&self) -> Vec<UserId> {
        self.profile_calls.lock().expect("lock").clone()
    }

    pub fn sent(&self) -> Vec<SendMessageRequest> {
        self.sent.lock().expect("lock").clone()
    }
}

#[async_trait]
impl ChatApi for FakeApi {
    async fn history(
        &self,
        _channel_id: &ChannelId,
        _kind: ChannelKind,
        page: u32,
        _limit: u32,
    ) -> Result<Vec<MessagePayload>, SyncError> {
        self.page_requests.lock().expect("lock").push(page);
        let delay = *self.history_delay.lock().expect("lock");
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.pages
            .lock()
            .expect("lock")
            .get(&page)
            .cloned()
            .unwrap_or(Ok(Vec::new()))
    }

    async fn send(
        &self,
        _kind: ChannelKind,
        request: SendMessageRequest,
    ) -> Result<MessagePayload, SyncError> {
        self.sent.lock().expect("lock").push(request.clone());
        let delay = *self.send_delay.lock().expect("lock");
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.send_failure.lock().expect("lock").clone() {
            return Err(err);
        }
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(MessagePayload {
            message_id: MessageId::new(format!("srv-{n}")),
            channel_id: request.channel_id,
            sender_id: UserId::from("me"),
            content: request.content,
            attachment: request.attachment,
            created_at: Utc::now(),
            edited_at: None,
            is_edited: false,
            client_ref: request.client_ref,
        })
    }

    async fn edit(
        &self,
        message_id: &MessageId,
        content: &str,
    ) -> Result<MessagePayload, SyncError> {
        self.edits
            .lock()
            .expect("lock")
            .push((message_id.clone(), content.to_string()));
        let mut edited = payload(message_id.as_str(), "c1", 0, content);
        edited.edited_at = Some(Utc::now());
        edited.is_edited = true;
        Ok(edited)
    }

    async fn delete(&self, message_id: &MessageId) -> Result<(), SyncError> {
        self.deletes.lock().expect("lock").push(message_id.clone());
        Ok(())
    }

    async fn channel(&self, channel_id: &ChannelId) -> Result<ChannelPayload, SyncError> {
        self.channel_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .channels
            .lock()
            .expect("lock")
            .get(channel_id)
            .cloned()
            .unwrap_or_else(|| ChannelPayload {
                channel_id: channel_id.clone(),
                kind: ChannelKind::Direct,
                participants: vec![UserId::from("me"), UserId::from("u2")],
                display_name: None,
            }))
    }

    async fn profile(&self, user_id: &UserId) -> Result<ProfilePayload, SyncError> {
        self.profile_calls.lock().expect("lock").push(user_id.clone());
        let delay = *self.profile_delay.lock().expect("lock");
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.failing_profiles.lock().expect("lock").contains(user_id) {
            return Err(failure("profile", 500));
        }
        Ok(self
            .profiles
            .lock()
            .expect("lock")
            .get(user_id)
            .cloned()
            .unwrap_or_else(|| ProfilePayload {
                id: user_id.clone(),
                username: format!("user-{user_id}"),
                avatar_url: None,
            }))
    }
}
