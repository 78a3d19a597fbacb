/// FeedSync - real-time feed synchronization core
///
/// Keeps a conversation feed and a notification feed consistent across an
/// initial REST history load, a shared push channel and optimistic local
/// writes.

pub mod config;
pub mod engine;
pub mod error;
pub mod history;
pub mod identity;
pub mod presenter;
pub mod push;
pub mod types;
pub mod wire;

pub use config::Config;
pub use engine::{ChatEngine, MergeOutcome, NotificationEngine};
pub use error::{Result, SyncError};
pub use history::{HistoryApi, HttpHistoryClient, NotificationPage};
pub use identity::derive_conversation_id;
pub use presenter::{ChatPresenter, NotificationPresenter};
pub use push::{ChannelHandle, ChannelManager, ChannelStatus, PushEvent, TcpConnector};
pub use types::{Conversation, DeliveryStatus, FeedKind, Message, Notification, UserSummary};
