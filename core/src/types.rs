/// Canonical feed types shared by the loader, listener, engines and presenters
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Prefix marking a locally generated, not yet confirmed message id
pub const PROVISIONAL_PREFIX: &str = "temp-";

/// Which feed an item or event belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedKind {
    Chat,
    Notifications,
}

/// Counterpart user as shown in the conversation list
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSummary {
    pub id: String,
    pub name: String,
    pub avatar: Option<String>,
    pub email: Option<String>,
}

impl UserSummary {
    /// Summary known only by id (name falls back to the id)
    pub fn from_id(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            avatar: None,
            email: None,
        }
    }
}

/// Preview of the latest message in a conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSummary {
    pub message_id: Option<String>,
    pub sender_id: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

/// One 1:1 thread between the local user and a counterpart
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    /// Derived from the sorted participant pair (see `identity`)
    pub id: String,
    pub counterpart: UserSummary,
    pub last_message: Option<MessageSummary>,
    pub unread_count: u32,
    /// Server's last-update time, or local creation time for local-only threads
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    /// A thread started locally before any message exists
    pub fn new_local(local_user: &str, counterpart: UserSummary, now: DateTime<Utc>) -> Self {
        Self {
            id: crate::identity::derive_conversation_id(local_user, &counterpart.id),
            counterpart,
            last_message: None,
            unread_count: 0,
            updated_at: now,
        }
    }

    /// Time of the latest activity, used for most-recent-first ordering
    pub fn last_activity(&self) -> DateTime<Utc> {
        match &self.last_message {
            Some(last) if last.created_at > self.updated_at => last.created_at,
            _ => self.updated_at,
        }
    }
}

/// Where a message stands in the optimistic send lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Created locally, awaiting server confirmation
    Provisional,
    /// Outbound send failed; kept visible so it can be retried
    Failed,
    /// Known to the server
    Confirmed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
    /// `created_at` is our receive time because the server sent none
    #[serde(default)]
    pub time_estimated: bool,
    pub read: bool,
    pub status: DeliveryStatus,
}

impl Message {
    /// A locally originated message with a provisional id
    pub fn provisional(
        conversation_id: impl Into<String>,
        sender_id: impl Into<String>,
        receiver_id: impl Into<String>,
        body: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: format!("{}{}", PROVISIONAL_PREFIX, Uuid::new_v4()),
            conversation_id: conversation_id.into(),
            sender_id: sender_id.into(),
            receiver_id: receiver_id.into(),
            body: body.into(),
            created_at: now,
            time_estimated: false,
            read: true,
            status: DeliveryStatus::Provisional,
        }
    }

    pub fn is_provisional(&self) -> bool {
        self.id.starts_with(PROVISIONAL_PREFIX)
    }

    pub fn summary(&self) -> MessageSummary {
        MessageSummary {
            message_id: (!self.is_provisional()).then(|| self.id.clone()),
            sender_id: self.sender_id.clone(),
            body: self.body.clone(),
            created_at: self.created_at,
        }
    }
}

/// Notification type tag
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    #[serde(alias = "item-created", alias = "campaign_created", alias = "ad_created")]
    ItemCreated,
    #[serde(alias = "status-changed", alias = "status_update", alias = "campaign_status")]
    StatusChanged,
    #[serde(alias = "payment-result", alias = "payment", alias = "payment_success", alias = "payment_failed")]
    PaymentResult,
    #[serde(alias = "subscription-event", alias = "subscription")]
    SubscriptionEvent,
    Referral,
    #[default]
    #[serde(other)]
    General,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub kind: NotificationKind,
    pub title: String,
    pub body: String,
    /// Optional deep link into the console
    pub link: Option<String>,
    pub read: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub time_estimated: bool,
}
