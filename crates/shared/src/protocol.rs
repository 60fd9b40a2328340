use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{Message, MessageId, Registrant, SenderId};

/// Body and grouping change for one message. Used both as the realtime
/// `update` frame payload and as the `/update-message` request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageUpdate {
    pub message_id: MessageId,
    #[serde(rename = "message")]
    pub body: String,
    #[serde(rename = "showAvatar")]
    pub show_avatar: bool,
    #[serde(rename = "showTimestamp")]
    pub show_timestamp: bool,
}

/// Every frame that travels over the realtime socket, in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RealtimeFrame {
    Register {
        user: Registrant,
    },
    Message {
        message: Message,
    },
    Delete {
        message_id: MessageId,
    },
    Update(MessageUpdate),
    Notification {
        #[serde(default)]
        welcome: bool,
        message: String,
    },
}

impl RealtimeFrame {
    pub fn welcome(text: impl Into<String>) -> Self {
        Self::Notification {
            welcome: true,
            message: text.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Register { .. } => "register",
            Self::Message { .. } => "message",
            Self::Delete { .. } => "delete",
            Self::Update(_) => "update",
            Self::Notification { .. } => "notification",
        }
    }
}

/// A client-originated frame after validation. Anything the hub cannot act
/// on lands in `Malformed` instead of failing the connection.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Register(Registrant),
    Create(Message),
    Delete(MessageId),
    Update(MessageUpdate),
    Malformed(String),
}

impl InboundEvent {
    pub fn parse(raw: &str) -> Self {
        match serde_json::from_str::<RealtimeFrame>(raw) {
            Ok(RealtimeFrame::Register { user }) => Self::Register(user),
            Ok(RealtimeFrame::Message { message }) => Self::Create(message),
            Ok(RealtimeFrame::Delete { message_id }) => Self::Delete(message_id),
            Ok(RealtimeFrame::Update(update)) => Self::Update(update),
            Ok(RealtimeFrame::Notification { .. }) => {
                Self::Malformed("notification frames are server-only".into())
            }
            Err(err) => Self::Malformed(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub sender_id: SenderId,
    pub display_name: String,
    #[serde(default)]
    pub avatar_ref: Option<String>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    pub body: String,
    #[serde(default)]
    pub show_avatar: bool,
    #[serde(default)]
    pub show_timestamp: bool,
}

impl From<&Message> for SendMessageRequest {
    fn from(message: &Message) -> Self {
        Self {
            sender_id: message.sender_id.clone(),
            display_name: message.display_name.clone(),
            avatar_ref: message.avatar_ref.clone(),
            timestamp: message.timestamp,
            body: message.body.clone(),
            show_avatar: message.show_avatar.unwrap_or(false),
            show_timestamp: message.show_timestamp.unwrap_or(false),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageResponse {
    pub message_id: MessageId,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessagesResponse {
    pub messages: Vec<Message>,
}

/// Raw `/get-messages` query. Bounds stay textual so that malformed values
/// are reported as an invalid range rather than a generic extractor error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WindowQuery {
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteMessageRequest {
    #[serde(default)]
    pub message_id: Option<MessageId>,
}
