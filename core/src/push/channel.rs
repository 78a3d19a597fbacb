/// Shared push channel with a reference-counted lifecycle
///
/// One connection serves both feeds. Every `ChannelHandle` counts as a
/// subscriber; the connection task is stopped when the last handle is dropped
/// or when `ChannelManager::close` is called.
use super::listener::{normalize_frame, PushEvent};
use super::protocol::Frame;
use crate::config::Config;
use crate::error::{Result, SyncError};
use crate::types::FeedKind;
use chrono::Utc;
use parking_lot::Mutex;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const OUTBOUND_QUEUE: usize = 32;

/// Byte stream carrying push frames
pub trait PushStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> PushStream for T {}

pub type BoxedStream = Box<dyn PushStream>;

/// Establishes the underlying stream; called again on every reconnect
pub trait Connector: Send + Sync + 'static {
    fn connect(&self) -> impl Future<Output = Result<BoxedStream>> + Send;
}

/// Plain TCP connector
pub struct TcpConnector {
    addr: SocketAddr,
    timeout: Duration,
}

impl TcpConnector {
    pub fn new(addr: SocketAddr, timeout: Duration) -> Self {
        Self { addr, timeout }
    }
}

impl Connector for TcpConnector {
    async fn connect(&self) -> Result<BoxedStream> {
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(self.addr))
            .await
            .map_err(|_| SyncError::Transport(format!("connect to {} timed out", self.addr)))?
            .map_err(|e| SyncError::Transport(format!("connect to {}: {}", self.addr, e)))?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

/// Connection state as seen by the feeds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    /// No subscribers
    Closed,
    Connecting,
    /// Joined; `session` increases on every successful (re)connect
    Connected { session: u64 },
    /// Lost the connection; feeds are stale until the next manual refresh
    Disconnected,
}

impl ChannelStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, ChannelStatus::Connected { .. })
    }

    pub fn session(&self) -> Option<u64> {
        match self {
            ChannelStatus::Connected { session } => Some(*session),
            _ => None,
        }
    }
}

type Outbound = (Frame, oneshot::Sender<Result<()>>);

struct RegistryState {
    identity: Option<String>,
    refs: usize,
    /// Bumped on every open-from-closed so stale handles cannot release a newer session
    epoch: u64,
    outbound: Option<mpsc::Sender<Outbound>>,
    task: Option<JoinHandle<()>>,
}

struct Registry {
    state: Mutex<RegistryState>,
    status: watch::Sender<ChannelStatus>,
    chat_events: broadcast::Sender<PushEvent>,
    notification_events: broadcast::Sender<PushEvent>,
}

impl Registry {
    fn release(&self, epoch: u64) {
        let mut state = self.state.lock();
        if state.epoch != epoch || state.refs == 0 {
            return;
        }
        state.refs -= 1;
        debug!("Push channel subscriber released ({} left)", state.refs);
        if state.refs == 0 {
            self.shutdown(&mut state);
        }
    }

    fn shutdown(&self, state: &mut RegistryState) {
        if let Some(task) = state.task.take() {
            task.abort();
        }
        state.outbound = None;
        state.refs = 0;
        if let Some(identity) = state.identity.take() {
            info!("Push channel closed for {}", identity);
        }
        self.status.send_replace(ChannelStatus::Closed);
    }

    fn sender_for(&self, feed: FeedKind) -> &broadcast::Sender<PushEvent> {
        match feed {
            FeedKind::Chat => &self.chat_events,
            FeedKind::Notifications => &self.notification_events,
        }
    }

    fn dispatch_line(&self, line: &str, identity: &str) {
        let frame = match Frame::from_line(line) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Dropping unparseable push frame: {}", e);
                return;
            }
        };
        let event_name = frame.event.clone();
        match normalize_frame(frame, identity, Utc::now()) {
            Ok(Some(event)) => {
                let feed = event.feed();
                if self.sender_for(feed).send(event).is_err() {
                    debug!("No {:?} subscriber for {}", feed, event_name);
                }
            }
            Ok(None) => {}
            Err(e) => warn!("Dropping {} frame: {}", event_name, e),
        }
    }
}

/// Process-wide push channel, injected into the presenters
pub struct ChannelManager<C: Connector> {
    connector: Arc<C>,
    registry: Arc<Registry>,
    reconnect_interval: Duration,
}

impl<C: Connector> ChannelManager<C> {
    pub fn new(connector: C, config: &Config) -> Self {
        let (status, _) = watch::channel(ChannelStatus::Closed);
        let (chat_events, _) = broadcast::channel(config.event_buffer);
        let (notification_events, _) = broadcast::channel(config.event_buffer);
        Self {
            connector: Arc::new(connector),
            registry: Arc::new(Registry {
                state: Mutex::new(RegistryState {
                    identity: None,
                    refs: 0,
                    epoch: 0,
                    outbound: None,
                    task: None,
                }),
                status,
                chat_events,
                notification_events,
            }),
            reconnect_interval: config.reconnect_interval,
        }
    }

    /// Subscribe to the channel for `identity`, connecting and joining if this
    /// is the first subscriber. Must be called inside a tokio runtime.
    pub fn open(&self, identity: &str) -> Result<ChannelHandle> {
        if identity.is_empty() {
            return Err(SyncError::Auth("cannot join push channel without an identity".to_string()));
        }

        let mut state = self.registry.state.lock();
        let bound = state.identity.clone();
        match bound.as_deref() {
            Some(bound) if bound != identity => {
                return Err(SyncError::Auth(format!(
                    "push channel is bound to another identity ({})",
                    bound
                )));
            }
            Some(_) => {
                state.refs += 1;
            }
            None => {
                let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
                let task = tokio::spawn(run_connection(
                    self.connector.clone(),
                    identity.to_string(),
                    self.registry.clone(),
                    rx,
                    self.reconnect_interval,
                ));
                state.identity = Some(identity.to_string());
                state.epoch += 1;
                state.refs = 1;
                state.outbound = Some(tx);
                state.task = Some(task);
                info!("Opening push channel for {}", identity);
            }
        }

        Ok(ChannelHandle {
            registry: self.registry.clone(),
            identity: identity.to_string(),
            epoch: state.epoch,
        })
    }

    /// Tear the channel down regardless of outstanding subscribers
    pub fn close(&self) {
        let mut state = self.registry.state.lock();
        if state.identity.is_some() {
            self.registry.shutdown(&mut state);
        }
    }

    pub fn status(&self) -> watch::Receiver<ChannelStatus> {
        self.registry.status.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.state.lock().refs
    }
}

/// A feed's reference to the shared channel
pub struct ChannelHandle {
    registry: Arc<Registry>,
    identity: String,
    epoch: u64,
}

impl std::fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("identity", &self.identity)
            .field("epoch", &self.epoch)
            .finish()
    }
}

impl ChannelHandle {
    /// The identity the channel was joined with
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Events routed to `feed`
    pub fn subscribe(&self, feed: FeedKind) -> broadcast::Receiver<PushEvent> {
        self.registry.sender_for(feed).subscribe()
    }

    pub fn status(&self) -> watch::Receiver<ChannelStatus> {
        self.registry.status.subscribe()
    }

    /// Write one frame; resolves once it is on the wire or has failed
    pub async fn emit(&self, frame: Frame) -> Result<()> {
        let outbound = {
            let state = self.registry.state.lock();
            if state.epoch != self.epoch {
                return Err(SyncError::ChannelClosed);
            }
            state.outbound.clone()
        }
        .ok_or(SyncError::ChannelClosed)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        outbound
            .send((frame, reply_tx))
            .await
            .map_err(|_| SyncError::ChannelClosed)?;
        reply_rx.await.map_err(|_| SyncError::ChannelClosed)?
    }
}

impl Clone for ChannelHandle {
    fn clone(&self) -> Self {
        {
            let mut state = self.registry.state.lock();
            if state.epoch == self.epoch && state.refs > 0 {
                state.refs += 1;
            }
        }
        Self {
            registry: self.registry.clone(),
            identity: self.identity.clone(),
            epoch: self.epoch,
        }
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        self.registry.release(self.epoch);
    }
}

enum SessionEnd {
    /// Every handle is gone
    Released,
    Disconnected(String),
}

async fn run_connection<C: Connector>(
    connector: Arc<C>,
    identity: String,
    registry: Arc<Registry>,
    mut outbound: mpsc::Receiver<Outbound>,
    reconnect_interval: Duration,
) {
    let mut session = 0u64;
    loop {
        registry.status.send_replace(ChannelStatus::Connecting);
        match connector.connect().await {
            Ok(stream) => {
                session += 1;
                match serve_session(stream, &identity, &registry, &mut outbound, session).await {
                    SessionEnd::Released => return,
                    SessionEnd::Disconnected(reason) => {
                        warn!("Push channel disconnected: {}", reason)
                    }
                }
            }
            Err(e) => warn!("Push channel connect failed: {}", e),
        }

        registry.status.send_replace(ChannelStatus::Disconnected);

        // Sends fail fast while we wait to reconnect; nothing is queued
        let wait = tokio::time::sleep(reconnect_interval);
        tokio::pin!(wait);
        loop {
            tokio::select! {
                _ = &mut wait => break,
                cmd = outbound.recv() => match cmd {
                    Some((frame, reply)) => {
                        let _ = reply.send(Err(SyncError::Transport(format!(
                            "push channel disconnected, {} not sent",
                            frame.event
                        ))));
                    }
                    None => return,
                },
            }
        }
    }
}

async fn serve_session(
    stream: BoxedStream,
    identity: &str,
    registry: &Registry,
    outbound: &mut mpsc::Receiver<Outbound>,
    session: u64,
) -> SessionEnd {
    let (reader, mut writer) = tokio::io::split(stream);
    let mut lines = BufReader::new(reader).lines();

    if let Err(e) = write_frame(&mut writer, &Frame::join(identity)).await {
        return SessionEnd::Disconnected(format!("join failed: {}", e));
    }
    info!("Joined push channel as {} (session {})", identity, session);
    registry
        .status
        .send_replace(ChannelStatus::Connected { session });

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if !line.trim().is_empty() {
                        registry.dispatch_line(&line, identity);
                    }
                }
                Ok(None) => return SessionEnd::Disconnected("closed by server".to_string()),
                Err(e) => return SessionEnd::Disconnected(e.to_string()),
            },
            cmd = outbound.recv() => match cmd {
                Some((frame, reply)) => {
                    let result = write_frame(&mut writer, &frame).await;
                    let failure = result.as_ref().err().map(|e| e.to_string());
                    let _ = reply.send(result);
                    if let Some(reason) = failure {
                        return SessionEnd::Disconnected(reason);
                    }
                }
                None => return SessionEnd::Released,
            },
        }
    }
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> Result<()> {
    let line = frame.to_line()?;
    writer
        .write_all(line.as_bytes())
        .await
        .map_err(|e| SyncError::Transport(format!("write {}: {}", frame, e)))?;
    writer
        .flush()
        .await
        .map_err(|e| SyncError::Transport(format!("flush {}: {}", frame, e)))?;
    Ok(())
}
