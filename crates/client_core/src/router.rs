//! Fan-out of decoded push events to per-channel subscribers.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use chrono::{DateTime, Utc};
use shared::{domain::ChannelId, protocol::ServerEvent};
use tokio::sync::mpsc;
use tracing::trace;

type Subscribers = HashMap<ChannelId, Vec<(u64, mpsc::UnboundedSender<ServerEvent>)>>;

#[derive(Debug, Default)]
pub struct EventRouter {
    subscribers: Mutex<Subscribers>,
    next_id: Mutex<u64>,
}

/// A live registration for one channel's events. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    channel_id: ChannelId,
    id: u64,
    joined_at: DateTime<Utc>,
    receiver: mpsc::UnboundedReceiver<ServerEvent>,
    router: Weak<EventRouter>,
}

impl EventRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn subscribers(&self) -> MutexGuard<'_, Subscribers> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(self: &Arc<Self>, channel_id: ChannelId) -> Subscription {
        let id = {
            let mut next = self.next_id.lock().unwrap_or_else(PoisonError::into_inner);
            *next += 1;
            *next
        };
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers()
            .entry(channel_id.clone())
            .or_default()
            .push((id, tx));
        Subscription {
            channel_id,
            id,
            joined_at: Utc::now(),
            receiver: rx,
            router: Arc::downgrade(self),
        }
    }

    /// Delivers `event` to every subscriber of `channel_id`. Returns how many
    /// received it.
    pub fn dispatch(&self, channel_id: &ChannelId, event: &ServerEvent) -> usize {
        let mut subscribers = self.subscribers();
        let Some(list) = subscribers.get_mut(channel_id) else {
            trace!(channel_id = %channel_id, kind = event.kind_name(), "router: no subscribers");
            return 0;
        };
        list.retain(|(_, tx)| tx.send(event.clone()).is_ok());
        let delivered = list.len();
        if list.is_empty() {
            subscribers.remove(channel_id);
        }
        delivered
    }

    pub fn subscriber_count(&self, channel_id: &ChannelId) -> usize {
        self.subscribers().get(channel_id).map_or(0, Vec::len)
    }

    fn unsubscribe(&self, channel_id: &ChannelId, id: u64) {
        let mut subscribers = self.subscribers();
        if let Some(list) = subscribers.get_mut(channel_id) {
            list.retain(|(sub_id, _)| *sub_id != id);
            if list.is_empty() {
                subscribers.remove(channel_id);
            }
        }
    }
}

impl Subscription {
    pub fn channel_id(&self) -> &ChannelId {
        &self.channel_id
    }

    pub fn joined_at(&self) -> DateTime<Utc> {
        self.joined_at
    }

    pub async fn recv(&mut self) -> Option<ServerEvent> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ServerEvent> {
        self.receiver.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(router) = self.router.upgrade() {
            router.unsubscribe(&self.channel_id, self.id);
        }
    }
}

#[cfg(test)]
#[path = "tests/router_tests.rs"]
mod tests;
