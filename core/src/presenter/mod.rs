/// Feed presenters: user intent in, reconciled views out
///
/// Each presenter owns one engine behind a single lock, holds one reference to
/// the shared push channel and pumps that channel's events into the engine.
pub mod chat;
pub mod notifications;

pub use chat::ChatPresenter;
pub use notifications::NotificationPresenter;

use crate::engine::MergeOutcome;
use crate::error::Result;
use crate::push::{ChannelHandle, PushEvent};
use crate::types::FeedKind;
use std::future::Future;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// What the event pump needs from a presenter
pub(crate) trait Feed: Send + Sync + 'static {
    const KIND: FeedKind;

    fn channel(&self) -> &ChannelHandle;

    fn handle_event(&self, event: PushEvent) -> impl Future<Output = MergeOutcome> + Send;

    /// Fresh loads after missed events
    fn resync(&self) -> impl Future<Output = Result<()>> + Send;
}

/// Forward routed events into `feed` until the presenter or the channel goes
/// away. Holds only a weak reference so the pump never keeps the channel open.
pub(crate) fn spawn_pump<F: Feed>(feed: &Arc<F>) -> JoinHandle<()> {
    let weak: Weak<F> = Arc::downgrade(feed);
    let mut events = feed.channel().subscribe(F::KIND);
    let mut status = feed.channel().status();

    tokio::spawn(async move {
        let mut last_session = status.borrow_and_update().session();
        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(feed) = weak.upgrade() else { break };
                    match event {
                        Ok(event) => {
                            feed.handle_event(event).await;
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!("{:?} feed lagged by {} events, resyncing", F::KIND, skipped);
                            resync(&*feed).await;
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
                changed = status.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let Some(feed) = weak.upgrade() else { break };
                    let current = status.borrow_and_update().session();
                    if let Some(session) = current {
                        if last_session.is_some_and(|previous| previous != session) {
                            info!("Push channel reconnected, resyncing {:?} feed", F::KIND);
                            resync(&*feed).await;
                        }
                        last_session = Some(session);
                    }
                }
            }
        }
        debug!("{:?} event pump stopped", F::KIND);
    })
}

async fn resync<F: Feed>(feed: &F) {
    // Stays stale until the next manual refresh
    if let Err(e) = feed.resync().await {
        warn!("{:?} resync failed: {}", F::KIND, e);
    }
}
