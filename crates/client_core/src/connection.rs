//! The single authenticated socket connection and the channel membership
//! table that rides on it.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use shared::{
    domain::{ChannelId, ChannelKind, UserId},
    protocol::{ClientRequest, ServerEvent},
};
use tokio::{
    sync::{broadcast, mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::{
    config::ReconnectPolicy,
    error::SyncError,
    router::{EventRouter, Subscription},
    transport::{Credentials, Transport, TransportFrame},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Reconnecting { attempt: u32 },
    Closed,
}

/// Join/leave lifecycle of one channel on the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Joining,
    Joined,
    Leaving,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipChange {
    pub channel_id: ChannelId,
    pub state: SessionState,
}

#[derive(Debug)]
struct Membership {
    kind: ChannelKind,
    state: SessionState,
    holders: usize,
    leave_queued: bool,
}

#[derive(Debug, Default)]
struct Links {
    outbound: Option<mpsc::UnboundedSender<ClientRequest>>,
    memberships: HashMap<ChannelId, Membership>,
}

impl Links {
    fn send(&self, request: ClientRequest) -> bool {
        match &self.outbound {
            Some(tx) => tx.send(request).is_ok(),
            None => false,
        }
    }
}

struct HandleInner {
    credentials: Credentials,
    router: Arc<EventRouter>,
    state_tx: watch::Sender<ConnectionState>,
    membership_tx: broadcast::Sender<MembershipChange>,
    links: Mutex<Links>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

/// Shared handle to the live connection. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<HandleInner>,
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("user_id", &self.inner.credentials.user_id)
            .field("state", &self.state())
            .finish()
    }
}

impl HandleInner {
    fn links(&self) -> MutexGuard<'_, Links> {
        self.links.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }

    fn announce(&self, channel_id: &ChannelId, state: SessionState) {
        let _ = self.membership_tx.send(MembershipChange {
            channel_id: channel_id.clone(),
            state,
        });
    }

    /// Installs a fresh outbound sender and re-joins every held channel.
    fn on_open(&self, outbound: mpsc::UnboundedSender<ClientRequest>) {
        let mut changed = Vec::new();
        {
            let mut links = self.links();
            links.outbound = Some(outbound);
            let Links {
                outbound,
                memberships,
            } = &mut *links;
            memberships.retain(|_, m| m.holders > 0);
            for (channel_id, membership) in memberships.iter_mut() {
                membership.state = SessionState::Joining;
                membership.leave_queued = false;
                if let Some(tx) = outbound.as_ref() {
                    let _ = tx.send(ClientRequest::Join {
                        channel_id: channel_id.clone(),
                        kind: membership.kind,
                    });
                }
                changed.push(channel_id.clone());
            }
        }
        self.set_state(ConnectionState::Open);
        if !changed.is_empty() {
            info!(channels = changed.len(), "socket: re-joining active channels");
        }
        for channel_id in changed {
            self.announce(&channel_id, SessionState::Joining);
        }
    }

    /// Forgets the outbound sender. Channels nobody holds any more are
    /// dropped; the rest fall back to `Idle` until the next open.
    fn on_lost(&self) {
        let mut changed = Vec::new();
        {
            let mut links = self.links();
            links.outbound = None;
            links.memberships.retain(|_, m| m.holders > 0);
            for (channel_id, membership) in links.memberships.iter_mut() {
                if membership.state != SessionState::Idle {
                    membership.state = SessionState::Idle;
                    changed.push(channel_id.clone());
                }
            }
        }
        for channel_id in changed {
            self.announce(&channel_id, SessionState::Idle);
        }
    }

    fn on_joined(&self, channel_id: &ChannelId) {
        let next = {
            let mut links = self.links();
            let leave = match links.memberships.get_mut(channel_id) {
                Some(m) if m.leave_queued => {
                    m.leave_queued = false;
                    m.state = SessionState::Leaving;
                    Some(m.kind)
                }
                Some(m) => {
                    m.state = SessionState::Joined;
                    None
                }
                None => return,
            };
            match leave {
                Some(kind) => {
                    debug!(channel_id = %channel_id, "session: sending queued leave");
                    if !links.send(ClientRequest::Leave {
                        channel_id: channel_id.clone(),
                        kind,
                    }) {
                        links.memberships.remove(channel_id);
                        SessionState::Idle
                    } else {
                        SessionState::Leaving
                    }
                }
                None => SessionState::Joined,
            }
        };
        self.announce(channel_id, next);
    }

    fn on_left(&self, channel_id: &ChannelId) {
        {
            let mut links = self.links();
            let finished = links
                .memberships
                .get(channel_id)
                .is_some_and(|m| m.state == SessionState::Leaving && m.holders == 0);
            if !finished {
                return;
            }
            links.memberships.remove(channel_id);
        }
        self.announce(channel_id, SessionState::Idle);
    }

    fn handle_frame(&self, frame: TransportFrame) -> Option<Option<String>> {
        match frame {
            TransportFrame::Event(event) => {
                match &event {
                    ServerEvent::Joined { channel_id } => self.on_joined(channel_id),
                    ServerEvent::Left { channel_id } => self.on_left(channel_id),
                    ServerEvent::Error(err) => {
                        warn!(code = ?err.code, message = %err.message, "socket: server reported error");
                    }
                    _ => {
                        if let Some(channel_id) = event.channel_id() {
                            self.router.dispatch(channel_id, &event);
                        }
                    }
                }
                None
            }
            TransportFrame::Malformed { raw, reason } => {
                let error = SyncError::MalformedEvent(reason);
                warn!(error = %error, raw_len = raw.len(), "socket: dropping malformed frame");
                None
            }
            TransportFrame::Closed { reason } => Some(reason),
        }
    }
}

async fn run_connection(
    inner: Arc<HandleInner>,
    transport: Arc<dyn Transport>,
    policy: ReconnectPolicy,
) {
    let mut attempt = 0u32;
    loop {
        if attempt == 0 {
            inner.set_state(ConnectionState::Connecting);
        } else {
            inner.set_state(ConnectionState::Reconnecting { attempt });
            tokio::time::sleep(policy.delay_for(attempt)).await;
        }

        match transport.open(&inner.credentials).await {
            Ok(link) => {
                attempt = 0;
                info!(user_id = %inner.credentials.user_id, "socket: connected");
                inner.on_open(link.outbound);
                let mut inbound = link.inbound;
                let reason = loop {
                    match inbound.recv().await {
                        Some(frame) => {
                            if let Some(reason) = inner.handle_frame(frame) {
                                break reason;
                            }
                        }
                        None => break None,
                    }
                };
                inner.on_lost();
                warn!(reason = reason.as_deref().unwrap_or("eof"), "socket: connection lost");
            }
            Err(err) => {
                let error = SyncError::Transport(format!("{err:#}"));
                warn!(attempt, error = %error, "socket: connect failed");
            }
        }

        attempt += 1;
        if attempt > policy.max_attempts {
            error!(
                attempts = policy.max_attempts,
                "socket: giving up after exhausting reconnect attempts"
            );
            inner.set_state(ConnectionState::Closed);
            return;
        }
    }
}

impl ConnectionHandle {
    fn spawn(
        credentials: Credentials,
        transport: Arc<dyn Transport>,
        policy: ReconnectPolicy,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        let (membership_tx, _) = broadcast::channel(64);
        let inner = Arc::new(HandleInner {
            credentials,
            router: EventRouter::new(),
            state_tx,
            membership_tx,
            links: Mutex::new(Links::default()),
            driver: Mutex::new(None),
        });
        let task = tokio::spawn(run_connection(Arc::clone(&inner), transport, policy));
        *inner.driver.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
        Self { inner }
    }

    pub fn user_id(&self) -> &UserId {
        &self.inner.credentials.user_id
    }

    pub fn credentials(&self) -> &Credentials {
        &self.inner.credentials
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn watch_membership(&self) -> broadcast::Receiver<MembershipChange> {
        self.inner.membership_tx.subscribe()
    }

    /// Resolves once the socket is open, or fails if it reached `Closed`.
    pub async fn wait_until_open(&self) -> Result<(), SyncError> {
        let mut rx = self.watch_state();
        let state = rx
            .wait_for(|s| matches!(s, ConnectionState::Open | ConnectionState::Closed))
            .await
            .map_err(|_| SyncError::ConnectionClosed)?;
        match *state {
            ConnectionState::Open => Ok(()),
            _ => Err(SyncError::ConnectionClosed),
        }
    }

    pub fn subscribe(&self, channel_id: ChannelId) -> Subscription {
        self.inner.router.subscribe(channel_id)
    }

    pub fn router(&self) -> &Arc<EventRouter> {
        &self.inner.router
    }

    /// Registers interest in a channel, emitting `join` when this is the
    /// first holder and the socket is up.
    pub fn acquire(&self, channel_id: &ChannelId, kind: ChannelKind) -> SessionState {
        let state = {
            let mut links = self.inner.links();
            let connected = links.outbound.is_some();
            let membership = links
                .memberships
                .entry(channel_id.clone())
                .or_insert(Membership {
                    kind,
                    state: SessionState::Idle,
                    holders: 0,
                    leave_queued: false,
                });
            membership.holders += 1;
            membership.leave_queued = false;
            let needs_join = connected
                && matches!(membership.state, SessionState::Idle | SessionState::Leaving);
            if needs_join {
                membership.state = SessionState::Joining;
            }
            let (state, kind) = (membership.state, membership.kind);
            if needs_join {
                info!(channel_id = %channel_id, ?kind, "session: joining channel");
                links.send(ClientRequest::Join {
                    channel_id: channel_id.clone(),
                    kind,
                });
            }
            state
        };
        self.inner.announce(channel_id, state);
        state
    }

    /// Drops one holder. The last holder emits `leave`, or queues it behind
    /// an outstanding join. Nothing is sent while the socket is down.
    pub fn release(&self, channel_id: &ChannelId) -> SessionState {
        let state = {
            let mut links = self.inner.links();
            let connected = links.outbound.is_some();
            let Some(membership) = links.memberships.get_mut(channel_id) else {
                return SessionState::Idle;
            };
            membership.holders = membership.holders.saturating_sub(1);
            if membership.holders > 0 {
                return membership.state;
            }
            let kind = membership.kind;
            match (membership.state, connected) {
                (SessionState::Joining, true) => {
                    debug!(channel_id = %channel_id, "session: leave queued behind pending join");
                    membership.leave_queued = true;
                    SessionState::Joining
                }
                (SessionState::Joined, true) => {
                    membership.state = SessionState::Leaving;
                    info!(channel_id = %channel_id, "session: leaving channel");
                    links.send(ClientRequest::Leave {
                        channel_id: channel_id.clone(),
                        kind,
                    });
                    SessionState::Leaving
                }
                (SessionState::Leaving, true) => SessionState::Leaving,
                _ => {
                    links.memberships.remove(channel_id);
                    SessionState::Idle
                }
            }
        };
        self.inner.announce(channel_id, state);
        state
    }

    pub fn membership_state(&self, channel_id: &ChannelId) -> SessionState {
        self.inner
            .links()
            .memberships
            .get(channel_id)
            .map_or(SessionState::Idle, |m| m.state)
    }

    pub fn is_live(&self) -> bool {
        self.state() != ConnectionState::Closed
    }

    /// Stops the driver task and closes the socket.
    pub fn shutdown(&self) {
        let task = self
            .inner
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
            info!(user_id = %self.inner.credentials.user_id, "socket: disconnected");
        }
        self.inner.links().outbound = None;
        self.inner.set_state(ConnectionState::Closed);
    }
}

/// Owns at most one physical connection per authenticated identity.
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    policy: ReconnectPolicy,
    current: Mutex<Option<ConnectionHandle>>,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>, policy: ReconnectPolicy) -> Self {
        Self {
            transport,
            policy,
            current: Mutex::new(None),
        }
    }

    fn current_slot(&self) -> MutexGuard<'_, Option<ConnectionHandle>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the live handle for `credentials.user_id`, or replaces any
    /// other connection with a new one. Must run inside a tokio runtime.
    pub fn connect(&self, credentials: Credentials) -> ConnectionHandle {
        let mut slot = self.current_slot();
        if let Some(existing) = slot.as_ref() {
            if existing.user_id() == &credentials.user_id && existing.is_live() {
                debug!(user_id = %credentials.user_id, "socket: reusing live connection");
                return existing.clone();
            }
            existing.shutdown();
        }
        let handle = ConnectionHandle::spawn(credentials, Arc::clone(&self.transport), self.policy);
        *slot = Some(handle.clone());
        handle
    }

    pub fn current(&self) -> Option<ConnectionHandle> {
        self.current_slot().clone()
    }

    pub fn disconnect(&self) {
        if let Some(handle) = self.current_slot().take() {
            handle.shutdown();
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
