//! One open channel: its store, its subscription and its join/leave
//! lifecycle.

use std::{
    collections::BTreeSet,
    future::Future,
    sync::{Arc, Mutex as StdMutex, PoisonError},
    time::Duration,
};

use shared::{
    domain::{ChannelId, ChannelKind, LocalId, MessageId, UserId},
    protocol::{MessagePayload, SendMessageRequest, ServerEvent},
};
use tokio::{
    sync::{broadcast, watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, trace, warn};

use crate::{
    api::ChatApi,
    connection::{ConnectionHandle, ConnectionState, SessionState},
    directory::UserDirectoryCache,
    error::SyncError,
    model::{Channel, Draft, Message, OptimisticMessage, TimelineEntry, UserProfile},
    optimistic::{OptimisticSendTracker, TrackingToken},
    pagination::{PageResult, PageState, PaginationCursor},
    router::Subscription,
    store::{ApplyOutcome, MessageStore},
};

const UPDATE_BUFFER: usize = 256;

/// Notifications for whoever renders a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionUpdate {
    TimelineChanged,
    ChannelChanged,
    ProfilesResolved,
    Connection(ConnectionState),
    Membership(SessionState),
    SendFailed { local_id: LocalId, error: SyncError },
    Error(SyncError),
}

/// Everything a session borrows from the client that opened it.
#[derive(Clone)]
pub struct SessionContext {
    pub api: Arc<dyn ChatApi>,
    pub connection: ConnectionHandle,
    pub directory: Arc<UserDirectoryCache>,
    pub page_size: u32,
    pub send_timeout: Duration,
}

struct SessionCore {
    store: MessageStore,
    channel: Channel,
    tracker: OptimisticSendTracker,
    applied_pages: BTreeSet<u32>,
}

struct SessionShared {
    channel_id: ChannelId,
    kind: ChannelKind,
    me: UserId,
    api: Arc<dyn ChatApi>,
    connection: ConnectionHandle,
    directory: Arc<UserDirectoryCache>,
    cursor: PaginationCursor,
    core: Mutex<SessionCore>,
    updates: broadcast::Sender<SessionUpdate>,
    closed: watch::Sender<bool>,
}

pub struct ChannelSession {
    shared: Arc<SessionShared>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl ChannelSession {
    /// Subscribes to the channel's events, joins it and starts the initial
    /// load (metadata, newest page, profiles) in the background.
    pub fn open(
        ctx: SessionContext,
        channel_id: ChannelId,
        kind: ChannelKind,
    ) -> Result<Self, SyncError> {
        if ctx.connection.state() == ConnectionState::Closed {
            return Err(SyncError::ConnectionClosed);
        }

        let (updates, _) = broadcast::channel(UPDATE_BUFFER);
        let (closed, _) = watch::channel(false);
        let shared = Arc::new(SessionShared {
            me: ctx.connection.user_id().clone(),
            cursor: PaginationCursor::new(
                Arc::clone(&ctx.api),
                channel_id.clone(),
                kind,
                ctx.page_size,
            ),
            core: Mutex::new(SessionCore {
                store: MessageStore::new(channel_id.clone()),
                channel: Channel::new(channel_id.clone(), kind),
                tracker: OptimisticSendTracker::new(ctx.send_timeout),
                applied_pages: BTreeSet::new(),
            }),
            channel_id: channel_id.clone(),
            kind,
            api: ctx.api,
            connection: ctx.connection,
            directory: ctx.directory,
            updates,
            closed,
        });

        // Subscribe before joining so no event between the join ack and the
        // first page is lost; the store buffers them.
        let subscription = shared.connection.subscribe(channel_id.clone());
        let membership = shared.connection.acquire(&channel_id, kind);
        info!(channel_id = %channel_id, ?kind, ?membership, "session: opened");

        let tasks = vec![
            tokio::spawn(Arc::clone(&shared).pump(subscription)),
            tokio::spawn(Arc::clone(&shared).watch_connection()),
            tokio::spawn(Arc::clone(&shared).initial_load()),
        ];

        Ok(Self {
            shared,
            tasks: StdMutex::new(tasks),
        })
    }

    pub fn channel_id(&self) -> &ChannelId {
        &self.shared.channel_id
    }

    pub fn kind(&self) -> ChannelKind {
        self.shared.kind
    }

    pub fn is_closed(&self) -> bool {
        *self.shared.closed.borrow()
    }

    pub fn subscribe_updates(&self) -> broadcast::Receiver<SessionUpdate> {
        self.shared.updates.subscribe()
    }

    pub async fn snapshot(&self) -> Vec<TimelineEntry> {
        self.shared.core.lock().await.store.snapshot()
    }

    pub async fn confirmed(&self) -> Vec<Message> {
        self.shared.core.lock().await.store.confirmed()
    }

    pub async fn channel(&self) -> Channel {
        self.shared.core.lock().await.channel.clone()
    }

    pub fn page_state(&self) -> PageState {
        self.shared.cursor.state()
    }

    pub fn membership_state(&self) -> SessionState {
        self.shared.connection.membership_state(&self.shared.channel_id)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.shared.connection.state()
    }

    /// Display metadata for a sender, without I/O.
    pub fn display(&self, user_id: &UserId) -> UserProfile {
        self.shared.directory.display(user_id)
    }

    /// Loads the next older page. Returns how many messages were added.
    pub async fn load_older(&self) -> Result<usize, SyncError> {
        self.shared.ensure_open()?;
        let page = self
            .shared
            .until_closed(self.shared.cursor.load_next())
            .await?;
        Ok(self.shared.apply_page(page).await)
    }

    /// Inserts `draft` optimistically and sends it. Resolves with the
    /// confirmed message, or with the error the entry was marked failed with.
    pub async fn send(&self, draft: Draft) -> Result<Message, SyncError> {
        self.shared.ensure_open()?;
        if draft.is_empty() {
            return Err(SyncError::EmptyDraft);
        }
        let local_id = LocalId::generate();
        let token = {
            let mut core = self.shared.core.lock().await;
            core.store.insert_optimistic(OptimisticMessage::pending(
                local_id,
                self.shared.channel_id.clone(),
                self.shared.me.clone(),
                draft.clone(),
            ));
            core.tracker.begin_send(local_id, draft.clone())
        };
        self.shared.emit(SessionUpdate::TimelineChanged);
        debug!(channel_id = %self.shared.channel_id, local_id = %local_id, "session: sending");
        self.dispatch(token, draft).await
    }

    /// Re-sends a failed entry under the same local id.
    pub async fn retry(&self, local_id: LocalId) -> Result<Message, SyncError> {
        self.shared.ensure_open()?;
        let (token, draft) = {
            let mut core = self.shared.core.lock().await;
            let draft = match core.store.optimistic(local_id) {
                Some(entry) if entry.is_failed() => entry.draft.clone(),
                _ => return Err(SyncError::UnknownMessage(local_id.to_string())),
            };
            core.store.mark_pending(local_id);
            let token = core.tracker.begin_send(local_id, draft.clone());
            debug!(
                channel_id = %self.shared.channel_id,
                local_id = %local_id,
                attempt = core.tracker.attempts(token),
                "session: retrying send"
            );
            (token, draft)
        };
        self.shared.emit(SessionUpdate::TimelineChanged);
        self.dispatch(token, draft).await
    }

    /// Drops an unconfirmed entry from the timeline.
    pub async fn discard(&self, local_id: LocalId) -> Result<(), SyncError> {
        {
            let mut core = self.shared.core.lock().await;
            if core.store.discard_optimistic(local_id).is_none() {
                return Err(SyncError::UnknownMessage(local_id.to_string()));
            }
            if let Some(token) = core.tracker.token_for_client_ref(&local_id) {
                core.tracker.forget(token);
            }
        }
        self.shared.emit(SessionUpdate::TimelineChanged);
        Ok(())
    }

    pub async fn edit(&self, message_id: &MessageId, content: &str) -> Result<(), SyncError> {
        self.shared.ensure_open()?;
        if content.trim().is_empty() {
            return Err(SyncError::EmptyDraft);
        }
        self.shared.ensure_known(message_id).await?;
        let payload = self
            .shared
            .until_closed(self.shared.api.edit(message_id, content))
            .await?;
        let mut edited = Message::from(payload);
        edited.id = message_id.clone();
        let outcome = self.shared.core.lock().await.store.apply_edited(edited);
        if outcome.changed() {
            self.shared.emit(SessionUpdate::TimelineChanged);
        }
        Ok(())
    }

    pub async fn delete(&self, message_id: &MessageId) -> Result<(), SyncError> {
        self.shared.ensure_open()?;
        self.shared.ensure_known(message_id).await?;
        self.shared
            .until_closed(self.shared.api.delete(message_id))
            .await?;
        let outcome = self
            .shared
            .core
            .lock()
            .await
            .store
            .apply_deleted(message_id.clone());
        if outcome.changed() {
            self.shared.emit(SessionUpdate::TimelineChanged);
        }
        Ok(())
    }

    /// Unsubscribes, cancels in-flight work and leaves the channel. Safe to
    /// call more than once.
    pub fn close(&self) {
        let already = self.shared.closed.send_replace(true);
        if already {
            return;
        }
        let tasks = std::mem::take(
            &mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for task in tasks {
            task.abort();
        }
        let membership = self.shared.connection.release(&self.shared.channel_id);
        info!(channel_id = %self.shared.channel_id, ?membership, "session: closed");
    }

    async fn dispatch(&self, token: TrackingToken, draft: Draft) -> Result<Message, SyncError> {
        // Runs on its own task so a dropped caller cannot leave the entry
        // pending forever.
        let task = tokio::spawn(Arc::clone(&self.shared).deliver(token, draft));
        match task.await {
            Ok(result) => result,
            Err(_) => Err(SyncError::SessionClosed(self.shared.channel_id.clone())),
        }
    }
}

impl Drop for ChannelSession {
    fn drop(&mut self) {
        self.close();
    }
}

impl SessionShared {
    fn emit(&self, update: SessionUpdate) {
        let _ = self.updates.send(update);
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn ensure_open(&self) -> Result<(), SyncError> {
        if self.is_closed() {
            return Err(SyncError::SessionClosed(self.channel_id.clone()));
        }
        Ok(())
    }

    async fn ensure_known(&self, message_id: &MessageId) -> Result<(), SyncError> {
        if self.core.lock().await.store.contains(message_id) {
            Ok(())
        } else {
            Err(SyncError::UnknownMessage(message_id.to_string()))
        }
    }

    async fn wait_closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Runs `fut` unless the session closes first.
    async fn until_closed<T>(
        &self,
        fut: impl Future<Output = Result<T, SyncError>>,
    ) -> Result<T, SyncError> {
        tokio::select! {
            biased;
            _ = self.wait_closed() => Err(SyncError::SessionClosed(self.channel_id.clone())),
            result = fut => result,
        }
    }

    async fn apply_page(&self, page: PageResult) -> usize {
        let (inserted, senders) = {
            let mut core = self.core.lock().await;
            if self.is_closed() || !core.applied_pages.insert(page.page) {
                return 0;
            }
            let senders: Vec<UserId> = page.messages.iter().map(|m| m.sender_id.clone()).collect();
            let inserted = if core.store.is_initialized() {
                core.store.prepend_older_page(page.messages)
            } else {
                core.store.load_initial(page.messages)
            };
            (inserted, senders)
        };
        self.emit(SessionUpdate::TimelineChanged);
        self.resolve_profiles(&senders).await;
        inserted
    }

    async fn resolve_profiles(&self, ids: &[UserId]) {
        let unknown: Vec<UserId> = ids
            .iter()
            .filter(|id| self.directory.cached(id).is_none())
            .cloned()
            .collect();
        if unknown.is_empty() {
            return;
        }
        self.directory.resolve(&unknown).await;
        self.emit(SessionUpdate::ProfilesResolved);
    }

    async fn initial_load(self: Arc<Self>) {
        match self.until_closed(self.api.channel(&self.channel_id)).await {
            Ok(payload) => {
                let participants = {
                    let mut core = self.core.lock().await;
                    if payload.kind != self.kind {
                        warn!(
                            channel_id = %self.channel_id,
                            expected = ?self.kind,
                            actual = ?payload.kind,
                            "session: server reports a different channel kind"
                        );
                    }
                    core.channel.apply_payload(&payload);
                    core.channel.participant_ids.iter().cloned().collect::<Vec<_>>()
                };
                self.emit(SessionUpdate::ChannelChanged);
                self.resolve_profiles(&participants).await;
            }
            Err(SyncError::SessionClosed(_)) => return,
            Err(err) => {
                warn!(channel_id = %self.channel_id, error = %err, "session: channel metadata unavailable");
                self.emit(SessionUpdate::Error(err));
            }
        }

        match self.until_closed(self.cursor.load_next()).await {
            Ok(page) => {
                let count = self.apply_page(page).await;
                debug!(channel_id = %self.channel_id, count, "session: initial page applied");
            }
            Err(SyncError::SessionClosed(_)) => {}
            Err(err) => {
                warn!(channel_id = %self.channel_id, error = %err, "session: initial page failed");
                self.emit(SessionUpdate::Error(err));
            }
        }
    }

    async fn pump(self: Arc<Self>, mut subscription: Subscription) {
        loop {
            let event = tokio::select! {
                biased;
                _ = self.wait_closed() => None,
                event = subscription.recv() => event,
            };
            let Some(event) = event else {
                break;
            };
            self.apply_event(event).await;
        }
        trace!(channel_id = %self.channel_id, "session: event pump stopped");
    }

    async fn apply_event(&self, event: ServerEvent) {
        let mut new_senders = Vec::new();
        let mut updates = Vec::new();
        {
            let mut core = self.core.lock().await;
            if self.is_closed() {
                return;
            }
            let core = &mut *core;
            match event {
                ServerEvent::MessageCreated {
                    channel_id,
                    message,
                } => {
                    let Some(message) = self.accept_message(&channel_id, message) else {
                        return;
                    };
                    let sender = message.sender_id.clone();
                    let client_ref = message.client_ref;
                    let outcome = match client_ref {
                        Some(client_ref) => match core.tracker.token_for_client_ref(&client_ref) {
                            Some(token) => {
                                let confirmed = Message::from(message);
                                core.tracker.reconcile(token, &confirmed.id);
                                core.store.reconcile_optimistic(client_ref, confirmed)
                            }
                            None => core.store.apply_created(Message::from(message)),
                        },
                        None => core.store.apply_created(Message::from(message)),
                    };
                    if outcome == ApplyOutcome::Duplicate {
                        trace!(channel_id = %self.channel_id, "session: duplicate create ignored");
                    }
                    if outcome.changed() {
                        updates.push(SessionUpdate::TimelineChanged);
                    }
                    new_senders.push(sender);
                }
                ServerEvent::MessageEdited {
                    channel_id,
                    message,
                } => {
                    let Some(message) = self.accept_message(&channel_id, message) else {
                        return;
                    };
                    if core.store.apply_edited(Message::from(message)).changed() {
                        updates.push(SessionUpdate::TimelineChanged);
                    }
                }
                ServerEvent::MessageDeleted {
                    channel_id,
                    message_id,
                } => {
                    if channel_id != self.channel_id {
                        return;
                    }
                    if core.store.apply_deleted(message_id).changed() {
                        updates.push(SessionUpdate::TimelineChanged);
                    }
                }
                ServerEvent::MemberLeft {
                    channel_id,
                    member_id,
                } => {
                    if !self.kind.is_group() || channel_id != self.channel_id {
                        return;
                    }
                    if core.channel.remove_member(&member_id) {
                        info!(channel_id = %self.channel_id, member_id = %member_id, "session: member left");
                        updates.push(SessionUpdate::ChannelChanged);
                    }
                }
                ServerEvent::ChannelUpdated { channel } => {
                    if !self.kind.is_group() {
                        return;
                    }
                    if core.channel.apply_payload(&channel) {
                        new_senders.extend(core.channel.participant_ids.iter().cloned());
                        updates.push(SessionUpdate::ChannelChanged);
                    }
                }
                ServerEvent::Joined { .. } | ServerEvent::Left { .. } | ServerEvent::Error(_) => {}
            }
        }
        for update in updates {
            self.emit(update);
        }
        if !new_senders.is_empty() {
            let unknown: Vec<UserId> = new_senders
                .into_iter()
                .filter(|id| self.directory.cached(id).is_none())
                .collect();
            if !unknown.is_empty() {
                let directory = Arc::clone(&self.directory);
                let updates = self.updates.clone();
                tokio::spawn(async move {
                    directory.resolve(&unknown).await;
                    let _ = updates.send(SessionUpdate::ProfilesResolved);
                });
            }
        }
    }

    /// Filters out messages for other channels and payloads missing required
    /// fields.
    fn accept_message(
        &self,
        channel_id: &ChannelId,
        message: MessagePayload,
    ) -> Option<MessagePayload> {
        if channel_id != &self.channel_id || message.channel_id != self.channel_id {
            debug!(
                channel_id = %self.channel_id,
                other = %message.channel_id,
                "session: dropping event for another channel"
            );
            return None;
        }
        if !message.is_well_formed() {
            let error = SyncError::MalformedEvent(format!(
                "message {} is missing required fields",
                message.message_id
            ));
            warn!(channel_id = %self.channel_id, error = %error, "session: dropping event");
            return None;
        }
        Some(message)
    }

    async fn watch_connection(self: Arc<Self>) {
        let mut states = self.connection.watch_state();
        let mut memberships = self.connection.watch_membership();
        loop {
            tokio::select! {
                biased;
                _ = self.wait_closed() => break,
                changed = states.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = *states.borrow_and_update();
                    self.emit(SessionUpdate::Connection(state));
                }
                change = memberships.recv() => match change {
                    Ok(change) if change.channel_id == self.channel_id => {
                        self.emit(SessionUpdate::Membership(change.state));
                    }
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    }

    async fn deliver(self: Arc<Self>, token: TrackingToken, draft: Draft) -> Result<Message, SyncError> {
        let local_id = token.local_id();
        let Some(deadline) = self.core.lock().await.tracker.deadline(token) else {
            return Err(SyncError::UnknownMessage(local_id.to_string()));
        };
        let request = SendMessageRequest {
            channel_id: self.channel_id.clone(),
            content: draft.content,
            attachment: draft.attachment,
            client_ref: Some(local_id),
        };
        let response = tokio::select! {
            biased;
            _ = self.wait_closed() => {
                return Err(SyncError::SessionClosed(self.channel_id.clone()));
            }
            response = tokio::time::timeout_at(deadline, self.api.send(self.kind, request)) => response,
        };

        match response {
            Ok(Ok(payload)) => self.confirm(token, payload).await,
            Ok(Err(err)) => {
                self.fail(token, err.clone()).await;
                Err(err)
            }
            Err(_) => {
                let err = SyncError::SendTimeout { local_id };
                self.fail(token, err.clone()).await;
                Err(err)
            }
        }
    }

    async fn confirm(&self, token: TrackingToken, payload: MessagePayload) -> Result<Message, SyncError> {
        if !payload.is_well_formed() {
            let err = SyncError::MalformedEvent(format!(
                "send response for {} is missing required fields",
                token.local_id()
            ));
            self.fail(token, err.clone()).await;
            return Err(err);
        }
        let message = Message::from(payload);
        {
            let mut core = self.core.lock().await;
            if self.is_closed() {
                return Err(SyncError::SessionClosed(self.channel_id.clone()));
            }
            core.tracker.reconcile(token, &message.id);
            core.store
                .reconcile_optimistic(token.local_id(), message.clone());
        }
        debug!(channel_id = %self.channel_id, message_id = %message.id, "session: send confirmed");
        self.emit(SessionUpdate::TimelineChanged);
        Ok(message)
    }

    async fn fail(&self, token: TrackingToken, error: SyncError) {
        let local_id = token.local_id();
        {
            let mut core = self.core.lock().await;
            if self.is_closed() {
                return;
            }
            core.tracker.expire(token);
            core.store.mark_failed(local_id, error.to_string());
        }
        warn!(channel_id = %self.channel_id, local_id = %local_id, error = %error, "session: send failed");
        self.emit(SessionUpdate::SendFailed { local_id, error });
        self.emit(SessionUpdate::TimelineChanged);
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
