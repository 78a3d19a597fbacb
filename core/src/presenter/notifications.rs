/// Notification feed presenter
use super::{spawn_pump, Feed};
use crate::config::Config;
use crate::engine::{MergeOutcome, NotificationEngine};
use crate::error::Result;
use crate::history::HistoryApi;
use crate::push::{ChannelHandle, ChannelStatus, PushEvent};
use crate::types::{FeedKind, Notification};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub struct NotificationPresenter<A: HistoryApi> {
    api: Arc<A>,
    channel: ChannelHandle,
    engine: RwLock<NotificationEngine>,
    limit: usize,
}

impl<A: HistoryApi> NotificationPresenter<A> {
    pub fn new(api: Arc<A>, channel: ChannelHandle, config: &Config) -> Self {
        Self {
            api,
            channel,
            engine: RwLock::new(NotificationEngine::new()),
            limit: config.notification_limit,
        }
    }

    pub fn spawn_event_pump(self: &Arc<Self>) -> JoinHandle<()> {
        spawn_pump(self)
    }

    /// Manual refresh: latest page plus the server's unread count
    pub async fn refresh(&self) -> Result<Vec<Notification>> {
        match self.api.load_notifications(self.limit).await {
            Ok(page) => {
                let mut engine = self.engine.write().await;
                engine.apply_snapshot(page.items, page.unread_count);
                Ok(engine.notifications())
            }
            Err(e) => {
                if e.is_auth() {
                    warn!("Notification load rejected, clearing feed: {}", e);
                    self.engine.write().await.clear();
                }
                Err(e)
            }
        }
    }

    /// Re-read just the unread counter
    pub async fn refresh_unread_count(&self) -> Result<u64> {
        let count = match self.api.unread_count().await {
            Ok(count) => count,
            Err(e) => {
                if e.is_auth() {
                    warn!("Unread count rejected, clearing feed: {}", e);
                    self.engine.write().await.clear();
                }
                return Err(e);
            }
        };
        let mut engine = self.engine.write().await;
        engine.apply_push(PushEvent::CounterUpdated(count));
        Ok(engine.unread_count())
    }

    /// Optimistic; the local change is rolled back if the backend refuses
    pub async fn mark_read(&self, id: &str) -> Result<()> {
        let rollback = self.engine.write().await.mark_read_local(id);
        if let Err(e) = self.api.mark_notification_read(id).await {
            warn!("Mark read of {} failed, rolling back: {}", id, e);
            self.engine.write().await.rollback(rollback);
            return Err(e);
        }
        Ok(())
    }

    pub async fn mark_all_read(&self) -> Result<()> {
        let rollback = self.engine.write().await.mark_all_read_local();
        if let Err(e) = self.api.mark_all_notifications_read().await {
            warn!("Mark all read failed, rolling back: {}", e);
            self.engine.write().await.rollback(rollback);
            return Err(e);
        }
        Ok(())
    }

    /// Whether the notification view is on screen; suppresses unread increments
    pub async fn set_open(&self, open: bool) {
        self.engine.write().await.set_open(open);
    }

    pub async fn handle_event(&self, event: PushEvent) -> MergeOutcome {
        self.engine.write().await.apply_push(event)
    }

    pub async fn resync(&self) -> Result<()> {
        self.refresh().await?;
        info!("Notification feed resynchronized");
        Ok(())
    }

    pub async fn notifications(&self) -> Vec<Notification> {
        self.engine.read().await.notifications()
    }

    pub async fn unread_count(&self) -> u64 {
        self.engine.read().await.unread_count()
    }

    pub async fn revision(&self) -> u64 {
        self.engine.read().await.revision()
    }

    pub fn channel_status(&self) -> ChannelStatus {
        *self.channel.status().borrow()
    }
}

impl<A: HistoryApi> Feed for NotificationPresenter<A> {
    const KIND: FeedKind = FeedKind::Notifications;

    fn channel(&self) -> &ChannelHandle {
        &self.channel
    }

    async fn handle_event(&self, event: PushEvent) -> MergeOutcome {
        NotificationPresenter::handle_event(self, event).await
    }

    async fn resync(&self) -> Result<()> {
        NotificationPresenter::resync(self).await
    }
}
