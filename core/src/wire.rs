/// Backend payload shapes and their normalization into canonical types
///
/// The backend is loose about shapes: ids arrive as `_id` or `id`, a sender
/// may be a bare id or a populated user object, bodies are `message`, `body`
/// or `text`. Everything is normalized here so the engines only ever see the
/// types in `crate::types`.
use crate::error::{Result, SyncError};
use crate::identity::derive_conversation_id;
use crate::types::{
    Conversation, DeliveryStatus, Message, MessageSummary, Notification, NotificationKind,
    UserSummary,
};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::warn;

/// REST response envelope: `{success, data | count, unreadCount, message}`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(default)]
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub unread_count: Option<u64>,
    pub count: Option<u64>,
    pub message: Option<String>,
}

impl Envelope {
    pub fn from_slice(body: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(body)?)
    }

    /// Fail unless the backend reported success
    pub fn into_success(self) -> Result<Self> {
        if self.success {
            Ok(self)
        } else {
            Err(SyncError::Protocol(format!(
                "backend reported failure: {}",
                self.message.as_deref().unwrap_or("no message")
            )))
        }
    }

    /// `data` as a list; absent or null data is an empty list
    pub fn data_items(&mut self) -> Vec<serde_json::Value> {
        match self.data.take() {
            Some(serde_json::Value::Array(items)) => items,
            Some(serde_json::Value::Null) | None => Vec::new(),
            Some(other) => vec![other],
        }
    }
}

/// A user reference: bare id or populated object
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum UserRef {
    Id(String),
    Object(RawUser),
}

impl UserRef {
    pub fn id(&self) -> &str {
        match self {
            UserRef::Id(id) => id,
            UserRef::Object(user) => &user.id,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawUser {
    #[serde(alias = "_id")]
    pub id: String,
    #[serde(default, alias = "fullName", alias = "username")]
    pub name: Option<String>,
    #[serde(default, alias = "profileImage", alias = "profilePic")]
    pub avatar: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

impl From<RawUser> for UserSummary {
    fn from(raw: RawUser) -> Self {
        let name = raw
            .name
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| raw.id.clone());
        UserSummary {
            id: raw.id,
            name,
            avatar: raw.avatar,
            email: raw.email,
        }
    }
}

impl From<UserRef> for UserSummary {
    fn from(user: UserRef) -> Self {
        match user {
            UserRef::Id(id) => UserSummary::from_id(id),
            UserRef::Object(raw) => raw.into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawMessage {
    #[serde(alias = "_id")]
    pub id: String,
    pub conversation_id: Option<String>,
    pub sender_id: UserRef,
    pub receiver_id: Option<UserRef>,
    #[serde(alias = "body", alias = "text")]
    pub message: String,
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, alias = "isRead")]
    pub read: bool,
}

impl RawMessage {
    /// Normalize into a confirmed `Message`.
    ///
    /// A missing receiver is taken to be the local user when someone else
    /// sent the message; a missing conversation id is derived from the pair.
    pub fn into_message(self, local_user: &str, received_at: DateTime<Utc>) -> Result<Message> {
        let sender_id = self.sender_id.id().to_string();
        let receiver_id = match self.receiver_id {
            Some(r) => r.id().to_string(),
            None if sender_id != local_user => local_user.to_string(),
            None => String::new(),
        };

        let conversation_id = match self.conversation_id.filter(|c| !c.is_empty()) {
            Some(id) => id,
            None if !receiver_id.is_empty() => derive_conversation_id(&sender_id, &receiver_id),
            None => {
                return Err(SyncError::ReconciliationConflict(format!(
                    "message {} has neither a conversation nor a receiver",
                    self.id
                )))
            }
        };

        Ok(Message {
            id: self.id,
            conversation_id,
            sender_id,
            receiver_id,
            body: self.message,
            created_at: self.created_at.unwrap_or(received_at),
            time_estimated: self.created_at.is_none(),
            read: self.read,
            status: DeliveryStatus::Confirmed,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawLastMessage {
    Text(String),
    Object(RawLastMessageObject),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawLastMessageObject {
    #[serde(alias = "_id")]
    pub id: Option<String>,
    #[serde(default, alias = "body", alias = "text")]
    pub message: String,
    pub sender_id: Option<UserRef>,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawConversation {
    #[serde(alias = "_id", alias = "conversationId")]
    pub id: Option<String>,
    #[serde(alias = "user", alias = "participant", alias = "otherUser")]
    pub counterpart: RawUser,
    pub last_message: Option<RawLastMessage>,
    #[serde(default)]
    pub unread_count: u32,
    pub updated_at: Option<DateTime<Utc>>,
}

impl RawConversation {
    pub fn into_conversation(self, local_user: &str, received_at: DateTime<Utc>) -> Conversation {
        let counterpart: UserSummary = self.counterpart.into();
        let id = self
            .id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| derive_conversation_id(local_user, &counterpart.id));

        let last_message = self.last_message.map(|last| match last {
            RawLastMessage::Text(body) => MessageSummary {
                message_id: None,
                sender_id: String::new(),
                body,
                created_at: self.updated_at.unwrap_or(received_at),
            },
            RawLastMessage::Object(obj) => MessageSummary {
                message_id: obj.id,
                sender_id: obj
                    .sender_id
                    .map(|s| s.id().to_string())
                    .unwrap_or_default(),
                body: obj.message,
                created_at: obj
                    .created_at
                    .or(self.updated_at)
                    .unwrap_or(received_at),
            },
        });

        let updated_at = self
            .updated_at
            .or_else(|| last_message.as_ref().map(|m| m.created_at))
            .unwrap_or(received_at);

        Conversation {
            id,
            counterpart,
            last_message,
            unread_count: self.unread_count,
            updated_at,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawNotification {
    #[serde(alias = "_id")]
    pub id: String,
    #[serde(default, rename = "type")]
    pub kind: NotificationKind,
    #[serde(default)]
    pub title: String,
    #[serde(default, alias = "message")]
    pub body: String,
    #[serde(alias = "url")]
    pub link: Option<String>,
    #[serde(default, alias = "isRead")]
    pub read: bool,
    pub created_at: Option<DateTime<Utc>>,
}

impl RawNotification {
    pub fn into_notification(self, received_at: DateTime<Utc>) -> Notification {
        Notification {
            id: self.id,
            kind: self.kind,
            title: self.title,
            body: self.body,
            link: self.link.filter(|l| !l.is_empty()),
            read: self.read,
            created_at: self.created_at.unwrap_or(received_at),
            time_estimated: self.created_at.is_none(),
        }
    }
}

/// Parse each element on its own; malformed elements are logged and skipped
/// so one bad row does not blank the whole feed.
pub fn parse_items<T: DeserializeOwned>(items: Vec<serde_json::Value>, what: &str) -> Vec<T> {
    items
        .into_iter()
        .filter_map(|item| match serde_json::from_value::<T>(item) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                warn!("Skipping malformed {}: {}", what, e);
                None
            }
        })
        .collect()
}
