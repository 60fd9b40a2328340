use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(MessageId);

/// Opaque author identifier issued by the external identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SenderId(pub String);

impl SenderId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SenderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A chat message in its canonical shape.
///
/// `id` is `None` while the message is an optimistic local entry. The two
/// grouping flags are derived by whoever materializes a sequence of messages
/// and are `None` when no grouping has been computed yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(rename = "message_id", default)]
    pub id: Option<MessageId>,
    pub sender_id: SenderId,
    pub display_name: String,
    #[serde(default)]
    pub avatar_ref: Option<String>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub show_avatar: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub show_timestamp: Option<bool>,
}

impl Message {
    pub fn is_confirmed(&self) -> bool {
        self.id.is_some()
    }

    pub fn is_run_starter(&self) -> bool {
        self.show_avatar == Some(true)
    }
}

/// Presentation snapshot supplied by the identity collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registrant {
    pub uid: SenderId,
    #[serde(rename = "displayName")]
    pub display_name: String,
    #[serde(rename = "avatarRef", default)]
    pub avatar_ref: Option<String>,
}
