/// Push channel: wire protocol, shared connection and event normalization
pub mod channel;
pub mod listener;
pub mod protocol;

pub use channel::{
    BoxedStream, ChannelHandle, ChannelManager, ChannelStatus, Connector, PushStream, TcpConnector,
};
pub use listener::{normalize_frame, FeedItem, PushEvent};
pub use protocol::{Frame, SendMessagePayload};
