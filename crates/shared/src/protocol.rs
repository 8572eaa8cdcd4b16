use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{AttachmentKind, ChannelId, ChannelKind, LocalId, MessageId, UserId},
    error::ApiError,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentPayload {
    pub url: String,
    pub kind: AttachmentKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    #[serde(rename = "id", alias = "_id")]
    pub message_id: MessageId,
    #[serde(alias = "conversationId")]
    pub channel_id: ChannelId,
    pub sender_id: UserId,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<AttachmentPayload>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_edited: bool,
    /// Correlation token echoed back by the server for messages this client sent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ref: Option<LocalId>,
}

impl MessagePayload {
    pub fn is_well_formed(&self) -> bool {
        !self.message_id.is_empty() && !self.channel_id.is_empty() && !self.sender_id.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryPage {
    #[serde(default)]
    pub messages: Vec<MessagePayload>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    #[serde(alias = "conversationId")]
    pub channel_id: ChannelId,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<AttachmentPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ref: Option<LocalId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope {
    #[serde(alias = "updatedMessage")]
    pub message: MessagePayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditMessageRequest {
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelPayload {
    #[serde(rename = "id", alias = "_id")]
    pub channel_id: ChannelId,
    pub kind: ChannelKind,
    #[serde(default, alias = "members")]
    pub participants: Vec<UserId>,
    #[serde(default, alias = "name", skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfilePayload {
    #[serde(alias = "_id")]
    pub id: UserId,
    #[serde(default)]
    pub username: String,
    #[serde(default, alias = "profilePicture", skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

/// Control frames sent by the client over the socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum ClientRequest {
    #[serde(rename_all = "camelCase")]
    Join {
        channel_id: ChannelId,
        kind: ChannelKind,
    },
    #[serde(rename_all = "camelCase")]
    Leave {
        channel_id: ChannelId,
        kind: ChannelKind,
    },
}

impl ClientRequest {
    pub fn channel_id(&self) -> &ChannelId {
        match self {
            ClientRequest::Join { channel_id, .. } | ClientRequest::Leave { channel_id, .. } => {
                channel_id
            }
        }
    }
}

/// Push frames received from the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum ServerEvent {
    #[serde(rename_all = "camelCase")]
    MessageCreated {
        channel_id: ChannelId,
        message: MessagePayload,
    },
    #[serde(rename_all = "camelCase")]
    MessageEdited {
        channel_id: ChannelId,
        message: MessagePayload,
    },
    #[serde(rename_all = "camelCase")]
    MessageDeleted {
        channel_id: ChannelId,
        message_id: MessageId,
    },
    #[serde(rename_all = "camelCase")]
    MemberLeft {
        channel_id: ChannelId,
        member_id: UserId,
    },
    ChannelUpdated {
        channel: ChannelPayload,
    },
    #[serde(rename_all = "camelCase")]
    Joined {
        channel_id: ChannelId,
    },
    #[serde(rename_all = "camelCase")]
    Left {
        channel_id: ChannelId,
    },
    Error(ApiError),
}

impl ServerEvent {
    pub fn channel_id(&self) -> Option<&ChannelId> {
        match self {
            ServerEvent::MessageCreated { channel_id, .. }
            | ServerEvent::MessageEdited { channel_id, .. }
            | ServerEvent::MessageDeleted { channel_id, .. }
            | ServerEvent::MemberLeft { channel_id, .. }
            | ServerEvent::Joined { channel_id }
            | ServerEvent::Left { channel_id } => Some(channel_id),
            ServerEvent::ChannelUpdated { channel } => Some(&channel.channel_id),
            ServerEvent::Error(_) => None,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            ServerEvent::MessageCreated { .. } => "message-created",
            ServerEvent::MessageEdited { .. } => "message-edited",
            ServerEvent::MessageDeleted { .. } => "message-deleted",
            ServerEvent::MemberLeft { .. } => "member-left",
            ServerEvent::ChannelUpdated { .. } => "channel-updated",
            ServerEvent::Joined { .. } => "joined",
            ServerEvent::Left { .. } => "left",
            ServerEvent::Error(_) => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_message_created_frame_with_mongo_style_ids() {
        let raw = r#"{
            "type": "message-created",
            "payload": {
                "channelId": "c1",
                "message": {
                    "_id": "m9",
                    "conversationId": "c1",
                    "senderId": "u2",
                    "content": "hola",
                    "createdAt": "2024-05-01T10:00:00Z"
                }
            }
        }"#;
        let event: ServerEvent = serde_json::from_str(raw).expect("decode");
        let ServerEvent::MessageCreated { channel_id, message } = event else {
            panic!("unexpected event");
        };
        assert_eq!(channel_id, ChannelId::from("c1"));
        assert_eq!(message.message_id, MessageId::from("m9"));
        assert!(!message.is_edited);
        assert!(message.client_ref.is_none());
        assert!(message.is_well_formed());
    }

    #[test]
    fn rejects_message_frame_without_sender() {
        let raw = r#"{"type":"message-created","payload":{"channelId":"c1","message":{"id":"m1","channelId":"c1","createdAt":"2024-05-01T10:00:00Z"}}}"#;
        assert!(serde_json::from_str::<ServerEvent>(raw).is_err());
    }

    #[test]
    fn channel_payload_accepts_members_alias() {
        let raw = r#"{"_id":"g1","kind":"group","members":["u1","u2"],"name":"Climbing"}"#;
        let channel: ChannelPayload = serde_json::from_str(raw).expect("decode");
        assert_eq!(channel.kind, ChannelKind::Group);
        assert_eq!(channel.participants.len(), 2);
        assert_eq!(channel.display_name.as_deref(), Some("Climbing"));
    }

    #[test]
    fn join_request_uses_kebab_case_tag() {
        let encoded = serde_json::to_value(ClientRequest::Join {
            channel_id: ChannelId::from("c1"),
            kind: ChannelKind::Direct,
        })
        .expect("encode");
        assert_eq!(encoded["type"], "join");
        assert_eq!(encoded["payload"]["channelId"], "c1");
        assert_eq!(encoded["payload"]["kind"], "direct");
    }
}
