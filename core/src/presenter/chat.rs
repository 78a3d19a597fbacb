/// Conversation feed presenter
use super::{spawn_pump, Feed};
use crate::config::Config;
use crate::engine::{ChatEngine, MergeOutcome};
use crate::error::{Result, SyncError};
use crate::history::HistoryApi;
use crate::push::{ChannelHandle, ChannelStatus, Frame, PushEvent, SendMessagePayload};
use crate::types::{Conversation, FeedKind, Message, UserSummary};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct ChatPresenter<A: HistoryApi> {
    api: Arc<A>,
    channel: ChannelHandle,
    engine: RwLock<ChatEngine>,
}

impl<A: HistoryApi> ChatPresenter<A> {
    /// The presenter acts as the identity its channel handle was joined with
    pub fn new(api: Arc<A>, channel: ChannelHandle, config: &Config) -> Self {
        let engine = ChatEngine::new(channel.identity(), config.confirm_window);
        Self {
            api,
            channel,
            engine: RwLock::new(engine),
        }
    }

    pub fn local_user(&self) -> &str {
        self.channel.identity()
    }

    /// Start forwarding chat events from the push channel
    pub fn spawn_event_pump(self: &Arc<Self>) -> JoinHandle<()> {
        spawn_pump(self)
    }

    /// Manual refresh of the conversation list
    pub async fn refresh_conversations(&self) -> Result<Vec<Conversation>> {
        match self.api.load_conversations().await {
            Ok(conversations) => {
                let mut engine = self.engine.write().await;
                engine.apply_conversations(conversations);
                Ok(engine.conversations())
            }
            Err(e) => {
                if e.is_auth() {
                    warn!("Conversation load rejected, clearing feed: {}", e);
                    self.engine.write().await.clear();
                }
                Err(e)
            }
        }
    }

    /// Select a conversation and load its history.
    ///
    /// The selection changes before the request goes out; a response that
    /// arrives after a newer load has been applied is dropped.
    pub async fn open_conversation(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let ticket = self.engine.write().await.open(conversation_id);
        let messages = match self.api.load_messages(conversation_id).await {
            Ok(messages) => messages,
            Err(e) => {
                if e.is_auth() {
                    warn!("Message load rejected, clearing feed: {}", e);
                    self.engine.write().await.clear();
                }
                return Err(e);
            }
        };
        let mut engine = self.engine.write().await;
        engine.apply_message_load(&ticket, messages);
        Ok(engine.messages(conversation_id))
    }

    pub async fn close_conversation(&self) {
        self.engine.write().await.close();
    }

    /// Conversation with `counterpart`, created locally if it has no history
    pub async fn start_conversation(&self, counterpart: UserSummary) -> Result<String> {
        if counterpart.id.is_empty() || counterpart.id == self.local_user() {
            return Err(SyncError::ReconciliationConflict(format!(
                "cannot start a conversation with '{}'",
                counterpart.id
            )));
        }
        Ok(self
            .engine
            .write()
            .await
            .ensure_conversation(counterpart, Utc::now()))
    }

    /// Show the message immediately, then hand it to the push channel.
    ///
    /// The provisional entry is only ever replaced by its confirmation; a failed
    /// send marks it `Failed` and returns the error.
    pub async fn send_message(&self, conversation_id: &str, body: &str) -> Result<Message> {
        if body.trim().is_empty() {
            return Err(SyncError::Protocol("message body is empty".to_string()));
        }
        let provisional = self
            .engine
            .write()
            .await
            .insert_provisional(conversation_id, body, Utc::now())?;
        self.deliver(provisional).await
    }

    /// Resend a failed message in place
    pub async fn retry_message(&self, message_id: &str) -> Result<Message> {
        let message = self
            .engine
            .write()
            .await
            .retry(message_id, Utc::now())
            .ok_or_else(|| {
                SyncError::ReconciliationConflict(format!(
                    "message {} is not a failed send",
                    message_id
                ))
            })?;
        self.deliver(message).await
    }

    async fn deliver(&self, message: Message) -> Result<Message> {
        let payload = SendMessagePayload {
            sender_id: message.sender_id.clone(),
            receiver_id: message.receiver_id.clone(),
            message: message.body.clone(),
            conversation_id: message.conversation_id.clone(),
        };
        let sent = match Frame::send_message(&payload) {
            Ok(frame) => self.channel.emit(frame).await,
            Err(e) => Err(e.into()),
        };
        match sent {
            Ok(()) => {
                debug!("Sent {} to {}", message.id, message.conversation_id);
                Ok(message)
            }
            Err(e) => {
                warn!("Send of {} failed: {}", message.id, e);
                self.engine.write().await.mark_failed(&message.id);
                Err(e)
            }
        }
    }

    pub async fn handle_event(&self, event: PushEvent) -> MergeOutcome {
        self.engine.write().await.apply_push(event)
    }

    /// Reload the conversation list and the open conversation
    pub async fn resync(&self) -> Result<()> {
        self.refresh_conversations().await?;
        let open = self
            .engine
            .read()
            .await
            .open_conversation_id()
            .map(str::to_string);
        if let Some(conversation_id) = open {
            self.open_conversation(&conversation_id).await?;
        }
        info!("Chat feed resynchronized");
        Ok(())
    }

    pub async fn conversations(&self) -> Vec<Conversation> {
        self.engine.read().await.conversations()
    }

    pub async fn messages(&self, conversation_id: &str) -> Vec<Message> {
        self.engine.read().await.messages(conversation_id)
    }

    pub async fn open_conversation_id(&self) -> Option<String> {
        self.engine.read().await.open_conversation_id().map(str::to_string)
    }

    pub async fn total_unread(&self) -> u32 {
        self.engine.read().await.total_unread()
    }

    pub async fn revision(&self) -> u64 {
        self.engine.read().await.revision()
    }

    /// Non-blocking connection indicator
    pub fn channel_status(&self) -> ChannelStatus {
        *self.channel.status().borrow()
    }
}

impl<A: HistoryApi> Feed for ChatPresenter<A> {
    const KIND: FeedKind = FeedKind::Chat;

    fn channel(&self) -> &ChannelHandle {
        &self.channel
    }

    async fn handle_event(&self, event: PushEvent) -> MergeOutcome {
        ChatPresenter::handle_event(self, event).await
    }

    async fn resync(&self) -> Result<()> {
        ChatPresenter::resync(self).await
    }
}
