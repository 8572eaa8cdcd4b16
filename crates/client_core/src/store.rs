//! Ordered, deduplicated message collection for one open channel.
//!
//! Every input source (history pages, push events, local sends) is merged
//! through [`MessageStore`]. The store itself is synchronous; the owning
//! session serializes access to it.

use std::{
    cmp::Ordering,
    collections::{HashSet, VecDeque},
};

use shared::domain::{ChannelId, LocalId, MessageId};
use tracing::debug;

use crate::model::{DeliveryStatus, Message, OptimisticMessage, TimelineEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Inserted,
    Updated,
    Removed,
    /// Id already present; nothing changed.
    Duplicate,
    /// Older edit or a re-delivered create for a deleted id.
    Stale,
    /// Target id is not in the store.
    Missing,
    /// Held until the initial page has been loaded.
    Buffered,
    /// An optimistic entry was replaced by its confirmed copy.
    Reconciled,
}

impl ApplyOutcome {
    pub fn changed(self) -> bool {
        matches!(
            self,
            ApplyOutcome::Inserted
                | ApplyOutcome::Updated
                | ApplyOutcome::Removed
                | ApplyOutcome::Reconciled
        )
    }
}

#[derive(Debug, Clone)]
enum PendingEvent {
    Created(Message),
    Edited(Message),
    Deleted(MessageId),
}

#[derive(Debug)]
pub struct MessageStore {
    channel_id: ChannelId,
    messages: Vec<Message>,
    ids: HashSet<MessageId>,
    tombstones: HashSet<MessageId>,
    optimistic: Vec<OptimisticMessage>,
    initialized: bool,
    pending: VecDeque<PendingEvent>,
}

fn timeline_order(a: &Message, b: &Message) -> Ordering {
    a.created_at
        .cmp(&b.created_at)
        .then_with(|| a.id.timeline_cmp(&b.id))
}

impl MessageStore {
    pub fn new(channel_id: ChannelId) -> Self {
        Self {
            channel_id,
            messages: Vec::new(),
            ids: HashSet::new(),
            tombstones: HashSet::new(),
            optimistic: Vec::new(),
            initialized: false,
            pending: VecDeque::new(),
        }
    }

    pub fn channel_id(&self) -> &ChannelId {
        &self.channel_id
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Seeds the store with the newest history page, then replays any push
    /// events that arrived before it, in arrival order.
    pub fn load_initial(&mut self, messages: Vec<Message>) -> usize {
        let mut inserted = 0;
        for message in messages {
            if self.insert_confirmed(message) == ApplyOutcome::Inserted {
                inserted += 1;
            }
        }
        self.initialized = true;

        let buffered = std::mem::take(&mut self.pending);
        if !buffered.is_empty() {
            debug!(
                channel_id = %self.channel_id,
                count = buffered.len(),
                "store: replaying buffered events"
            );
        }
        for event in buffered {
            let outcome = match event {
                PendingEvent::Created(message) => self.insert_confirmed(message),
                PendingEvent::Edited(message) => self.edit_confirmed(message),
                PendingEvent::Deleted(id) => self.delete_confirmed(id),
            };
            if outcome == ApplyOutcome::Inserted {
                inserted += 1;
            }
        }
        inserted
    }

    pub fn apply_created(&mut self, message: Message) -> ApplyOutcome {
        if !self.initialized {
            self.pending.push_back(PendingEvent::Created(message));
            return ApplyOutcome::Buffered;
        }
        self.insert_confirmed(message)
    }

    pub fn apply_edited(&mut self, message: Message) -> ApplyOutcome {
        if !self.initialized {
            self.pending.push_back(PendingEvent::Edited(message));
            return ApplyOutcome::Buffered;
        }
        self.edit_confirmed(message)
    }

    pub fn apply_deleted(&mut self, id: MessageId) -> ApplyOutcome {
        if !self.initialized {
            self.pending.push_back(PendingEvent::Deleted(id));
            return ApplyOutcome::Buffered;
        }
        self.delete_confirmed(id)
    }

    /// Merges an older history page. Ids already present (page boundary
    /// overlap) and deleted ids are skipped.
    pub fn prepend_older_page(&mut self, messages: Vec<Message>) -> usize {
        let mut fresh: Vec<Message> = messages
            .into_iter()
            .filter(|m| !self.ids.contains(&m.id) && !self.tombstones.contains(&m.id))
            .collect();
        fresh.sort_by(timeline_order);
        fresh.dedup_by(|a, b| a.id == b.id);

        let count = fresh.len();
        let all_older = match (fresh.last(), self.messages.first()) {
            (Some(last), Some(first)) => timeline_order(last, first) == Ordering::Less,
            _ => true,
        };
        if all_older {
            self.ids.extend(fresh.iter().map(|m| m.id.clone()));
            fresh.append(&mut self.messages);
            self.messages = fresh;
        } else {
            for message in fresh {
                self.insert_confirmed(message);
            }
        }
        count
    }

    pub fn insert_optimistic(&mut self, message: OptimisticMessage) {
        self.optimistic.retain(|m| m.local_id != message.local_id);
        self.optimistic.push(message);
    }

    /// Replaces the optimistic entry `local_id` with the confirmed message.
    /// The confirmed copy is inserted even when the local entry is already
    /// gone; the duplicate-id rule keeps a later echo from doubling it.
    pub fn reconcile_optimistic(&mut self, local_id: LocalId, message: Message) -> ApplyOutcome {
        let before = self.optimistic.len();
        self.optimistic.retain(|m| m.local_id != local_id);
        let removed_local = self.optimistic.len() != before;

        let outcome = self.insert_confirmed(message);
        if removed_local {
            ApplyOutcome::Reconciled
        } else {
            outcome
        }
    }

    pub fn mark_failed(&mut self, local_id: LocalId, reason: impl Into<String>) -> bool {
        match self.optimistic.iter_mut().find(|m| m.local_id == local_id) {
            Some(entry) => {
                entry.status = DeliveryStatus::Failed {
                    reason: reason.into(),
                };
                true
            }
            None => false,
        }
    }

    pub fn mark_pending(&mut self, local_id: LocalId) -> bool {
        match self.optimistic.iter_mut().find(|m| m.local_id == local_id) {
            Some(entry) => {
                entry.status = DeliveryStatus::Pending;
                true
            }
            None => false,
        }
    }

    pub fn discard_optimistic(&mut self, local_id: LocalId) -> Option<OptimisticMessage> {
        let index = self.optimistic.iter().position(|m| m.local_id == local_id)?;
        Some(self.optimistic.remove(index))
    }

    pub fn optimistic(&self, local_id: LocalId) -> Option<&OptimisticMessage> {
        self.optimistic.iter().find(|m| m.local_id == local_id)
    }

    /// Confirmed and optimistic entries merged by time. Optimistic entries
    /// sort after confirmed ones sharing a timestamp.
    pub fn snapshot(&self) -> Vec<TimelineEntry> {
        let mut local: Vec<&OptimisticMessage> = self.optimistic.iter().collect();
        local.sort_by_key(|m| m.created_at);

        let mut out = Vec::with_capacity(self.messages.len() + local.len());
        let mut local = local.into_iter().peekable();
        for message in &self.messages {
            while let Some(next) = local.next_if(|m| m.created_at < message.created_at) {
                out.push(TimelineEntry::Optimistic(next.clone()));
            }
            out.push(TimelineEntry::Confirmed(message.clone()));
        }
        out.extend(local.map(|m| TimelineEntry::Optimistic(m.clone())));
        out
    }

    pub fn confirmed(&self) -> Vec<Message> {
        self.messages.clone()
    }

    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        if !self.ids.contains(id) {
            return None;
        }
        self.messages.iter().find(|m| &m.id == id)
    }

    pub fn earliest(&self) -> Option<&Message> {
        self.messages.first()
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn optimistic_len(&self) -> usize {
        self.optimistic.len()
    }

    fn insert_confirmed(&mut self, message: Message) -> ApplyOutcome {
        if self.tombstones.contains(&message.id) {
            return ApplyOutcome::Stale;
        }
        if self.ids.contains(&message.id) {
            return ApplyOutcome::Duplicate;
        }
        let index = self
            .messages
            .partition_point(|m| timeline_order(m, &message) != Ordering::Greater);
        self.ids.insert(message.id.clone());
        self.messages.insert(index, message);
        ApplyOutcome::Inserted
    }

    fn edit_confirmed(&mut self, edit: Message) -> ApplyOutcome {
        let Some(stored) = self.messages.iter_mut().find(|m| m.id == edit.id) else {
            debug!(channel_id = %self.channel_id, message_id = %edit.id, "store: edit for unknown message dropped");
            return ApplyOutcome::Missing;
        };
        if let (Some(current), Some(incoming)) = (stored.edited_at, edit.edited_at) {
            if incoming < current {
                return ApplyOutcome::Stale;
            }
        }
        stored.content = edit.content;
        stored.edited_at = edit.edited_at.or(stored.edited_at);
        stored.is_edited = true;
        ApplyOutcome::Updated
    }

    fn delete_confirmed(&mut self, id: MessageId) -> ApplyOutcome {
        let removed = self.ids.remove(&id);
        if removed {
            self.messages.retain(|m| m.id != id);
        }
        self.tombstones.insert(id);
        if removed {
            ApplyOutcome::Removed
        } else {
            ApplyOutcome::Missing
        }
    }
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
