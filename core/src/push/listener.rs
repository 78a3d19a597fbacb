/// Push listener: turns inbound frames into feed events
///
/// Payload shapes are normalized here (see `crate::wire`), so nothing past
/// this boundary branches on the backend's representation.
use super::protocol::{
    Frame, PushEnvelope, EVENT_MESSAGE_SENT, EVENT_NEW_NOTIFICATION, EVENT_RECEIVE_MESSAGE,
    EVENT_UNREAD_COUNT_UPDATE,
};
use crate::error::{Result, SyncError};
use crate::types::{FeedKind, Message, Notification};
use crate::wire::{RawMessage, RawNotification};
use chrono::{DateTime, Utc};
use tracing::debug;

/// An item delivered by the push channel
#[derive(Debug, Clone, PartialEq)]
pub enum FeedItem {
    Message(Message),
    Notification(Notification),
}

/// Events delivered to the reconciliation engines
#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
    /// Someone else's new message or a new notification
    ItemReceived(FeedItem),
    /// Server confirmation of a message the local user sent
    OwnItemConfirmed(Message),
    /// Authoritative unread notification count
    CounterUpdated(u64),
}

impl PushEvent {
    /// The feed this event is routed to
    pub fn feed(&self) -> FeedKind {
        match self {
            PushEvent::ItemReceived(FeedItem::Message(_)) | PushEvent::OwnItemConfirmed(_) => {
                FeedKind::Chat
            }
            PushEvent::ItemReceived(FeedItem::Notification(_)) | PushEvent::CounterUpdated(_) => {
                FeedKind::Notifications
            }
        }
    }
}

/// Normalize one inbound frame.
///
/// Returns `Ok(None)` for events this core does not consume and for frames
/// the server marked unsuccessful.
pub fn normalize_frame(
    frame: Frame,
    local_user: &str,
    received_at: DateTime<Utc>,
) -> Result<Option<PushEvent>> {
    let event = frame.event;
    let envelope = PushEnvelope::from_value(frame.data);
    if !envelope.success {
        debug!("Ignoring unsuccessful {} frame", event);
        return Ok(None);
    }

    match event.as_str() {
        EVENT_RECEIVE_MESSAGE | EVENT_MESSAGE_SENT => {
            let data = envelope
                .data
                .ok_or_else(|| SyncError::Protocol(format!("{} without data", event)))?;
            let raw: RawMessage = serde_json::from_value(data)?;
            let message = raw.into_message(local_user, received_at)?;
            // message_sent echoes our own send; anything we sent is a confirmation
            // even if it arrives as receive_message (e.g. from another session)
            if event == EVENT_MESSAGE_SENT || message.sender_id == local_user {
                Ok(Some(PushEvent::OwnItemConfirmed(message)))
            } else {
                Ok(Some(PushEvent::ItemReceived(FeedItem::Message(message))))
            }
        }
        EVENT_NEW_NOTIFICATION => {
            let data = envelope
                .data
                .ok_or_else(|| SyncError::Protocol(format!("{} without data", event)))?;
            let raw: RawNotification = serde_json::from_value(data)?;
            Ok(Some(PushEvent::ItemReceived(FeedItem::Notification(
                raw.into_notification(received_at),
            ))))
        }
        EVENT_UNREAD_COUNT_UPDATE => {
            let count = envelope
                .count
                .or_else(|| {
                    envelope
                        .data
                        .as_ref()
                        .and_then(|d| d.get("count").and_then(|c| c.as_u64()))
                })
                .ok_or_else(|| SyncError::Protocol(format!("{} without count", event)))?;
            Ok(Some(PushEvent::CounterUpdated(count)))
        }
        other => {
            debug!("Ignoring push event {}", other);
            Ok(None)
        }
    }
}
