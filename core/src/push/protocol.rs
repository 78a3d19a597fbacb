/// Push channel wire protocol
///
/// Frames are newline-delimited JSON objects `{"event": <name>, "data": <payload>}`
/// in both directions.
use serde::{Deserialize, Serialize};
use std::fmt;

/// Outbound: bind the connection to a user id
pub const EVENT_JOIN: &str = "join";
/// Outbound: send a chat message
pub const EVENT_SEND_MESSAGE: &str = "send_message";
/// Inbound: someone else's message
pub const EVENT_RECEIVE_MESSAGE: &str = "receive_message";
/// Inbound: server confirmation of our own message
pub const EVENT_MESSAGE_SENT: &str = "message_sent";
/// Inbound: a new notification
pub const EVENT_NEW_NOTIFICATION: &str = "new_notification";
/// Inbound: authoritative unread notification count
pub const EVENT_UNREAD_COUNT_UPDATE: &str = "unread_count_update";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub event: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Frame {
    pub fn new(event: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    pub fn join(user_id: &str) -> Self {
        Self::new(EVENT_JOIN, serde_json::Value::String(user_id.to_string()))
    }

    pub fn send_message(payload: &SendMessagePayload) -> Result<Self, serde_json::Error> {
        Ok(Self::new(EVENT_SEND_MESSAGE, serde_json::to_value(payload)?))
    }

    /// Serialize to one line, including the trailing newline
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim_end())
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frame({})", self.event)
    }
}

/// Body of an outbound `send_message`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessagePayload {
    pub sender_id: String,
    pub receiver_id: String,
    pub message: String,
    pub conversation_id: String,
}

/// Inbound envelope: `{success, data | count}`
#[derive(Debug, Deserialize)]
pub struct PushEnvelope {
    #[serde(default = "default_success")]
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub count: Option<u64>,
}

fn default_success() -> bool {
    true
}

impl PushEnvelope {
    /// Accept both enveloped payloads and bare ones
    pub fn from_value(value: serde_json::Value) -> Self {
        let enveloped = value
            .as_object()
            .map(|o| o.contains_key("success"))
            .unwrap_or(false);
        if enveloped {
            if let Ok(env) = serde_json::from_value::<PushEnvelope>(value.clone()) {
                return env;
            }
        }
        let count = value.as_u64();
        Self {
            success: true,
            data: if count.is_some() { None } else { Some(value) },
            count,
        }
    }
}
