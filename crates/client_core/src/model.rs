//! Engine-side view of messages, channels and profiles.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use shared::{
    domain::{ChannelId, ChannelKind, LocalId, MessageId, UserId},
    protocol::{AttachmentPayload, ChannelPayload, MessagePayload},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub channel_id: ChannelId,
    pub sender_id: UserId,
    pub content: String,
    pub attachment: Option<AttachmentPayload>,
    pub created_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
    pub is_edited: bool,
}

impl From<MessagePayload> for Message {
    fn from(payload: MessagePayload) -> Self {
        Self {
            id: payload.message_id,
            channel_id: payload.channel_id,
            sender_id: payload.sender_id,
            content: payload.content,
            attachment: payload.attachment,
            created_at: payload.created_at,
            edited_at: payload.edited_at,
            is_edited: payload.is_edited,
        }
    }
}

/// What the user typed, before the server has seen it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Draft {
    pub content: String,
    pub attachment: Option<AttachmentPayload>,
}

impl Draft {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            attachment: None,
        }
    }

    pub fn with_attachment(mut self, attachment: AttachmentPayload) -> Self {
        self.attachment = Some(attachment);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.content.trim().is_empty() && self.attachment.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryStatus {
    Pending,
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptimisticMessage {
    pub local_id: LocalId,
    pub channel_id: ChannelId,
    pub sender_id: UserId,
    pub draft: Draft,
    pub created_at: DateTime<Utc>,
    pub status: DeliveryStatus,
}

impl OptimisticMessage {
    pub fn pending(local_id: LocalId, channel_id: ChannelId, sender_id: UserId, draft: Draft) -> Self {
        Self {
            local_id,
            channel_id,
            sender_id,
            draft,
            created_at: Utc::now(),
            status: DeliveryStatus::Pending,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, DeliveryStatus::Failed { .. })
    }
}

/// One row of the rendered conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimelineEntry {
    Confirmed(Message),
    Optimistic(OptimisticMessage),
}

impl TimelineEntry {
    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            TimelineEntry::Confirmed(message) => message.created_at,
            TimelineEntry::Optimistic(message) => message.created_at,
        }
    }

    pub fn content(&self) -> &str {
        match self {
            TimelineEntry::Confirmed(message) => &message.content,
            TimelineEntry::Optimistic(message) => &message.draft.content,
        }
    }

    pub fn sender_id(&self) -> &UserId {
        match self {
            TimelineEntry::Confirmed(message) => &message.sender_id,
            TimelineEntry::Optimistic(message) => &message.sender_id,
        }
    }

    pub fn message_id(&self) -> Option<&MessageId> {
        match self {
            TimelineEntry::Confirmed(message) => Some(&message.id),
            TimelineEntry::Optimistic(_) => None,
        }
    }

    pub fn local_id(&self) -> Option<LocalId> {
        match self {
            TimelineEntry::Confirmed(_) => None,
            TimelineEntry::Optimistic(message) => Some(message.local_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    pub id: ChannelId,
    pub kind: ChannelKind,
    pub participant_ids: BTreeSet<UserId>,
    pub display_name: Option<String>,
}

impl Channel {
    pub fn new(id: ChannelId, kind: ChannelKind) -> Self {
        Self {
            id,
            kind,
            participant_ids: BTreeSet::new(),
            display_name: None,
        }
    }

    /// Replaces roster and name from a server description of this channel.
    /// Returns false when the payload describes some other channel.
    pub fn apply_payload(&mut self, payload: &ChannelPayload) -> bool {
        if payload.channel_id != self.id {
            return false;
        }
        self.kind = payload.kind;
        self.participant_ids = payload
            .participants
            .iter()
            .filter(|id| !id.is_empty())
            .cloned()
            .collect();
        if payload.display_name.is_some() {
            self.display_name = payload.display_name.clone();
        }
        true
    }

    pub fn remove_member(&mut self, member_id: &UserId) -> bool {
        self.participant_ids.remove(member_id)
    }

    /// The other side of a direct conversation.
    pub fn counterpart(&self, me: &UserId) -> Option<&UserId> {
        if self.kind.is_group() {
            return None;
        }
        self.participant_ids.iter().find(|id| *id != me)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserProfile {
    pub id: UserId,
    pub username: String,
    pub avatar_url: String,
}
