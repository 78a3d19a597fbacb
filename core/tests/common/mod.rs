#![allow(dead_code)]
// Shared fixtures for the integration tests: an in-memory backend and a
// push server on `tokio::io::duplex` streams

use chrono::{DateTime, TimeZone, Utc};
use feedsync_core::error::{Result, SyncError};
use feedsync_core::history::{HistoryApi, NotificationPage};
use feedsync_core::push::{BoxedStream, Connector, Frame};
use feedsync_core::types::{Conversation, DeliveryStatus, Message, Notification, NotificationKind};
use feedsync_core::Config;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf};
use tokio::sync::mpsc;

pub fn test_config(user: &str) -> Config {
    Config {
        user_id: Some(user.to_string()),
        auth_token: Some("test-token".to_string()),
        reconnect_interval: Duration::from_millis(50),
        ..Default::default()
    }
}

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap() + chrono::Duration::seconds(secs)
}

pub fn message(id: &str, from: &str, to: &str, body: &str, created_at: DateTime<Utc>) -> Message {
    Message {
        id: id.to_string(),
        conversation_id: feedsync_core::derive_conversation_id(from, to),
        sender_id: from.to_string(),
        receiver_id: to.to_string(),
        body: body.to_string(),
        created_at,
        time_estimated: false,
        read: false,
        status: DeliveryStatus::Confirmed,
    }
}

pub fn notification(id: &str, read: bool, created_at: DateTime<Utc>) -> Notification {
    Notification {
        id: id.to_string(),
        kind: NotificationKind::General,
        title: format!("Notification {}", id),
        body: String::new(),
        link: None,
        read,
        created_at,
        time_estimated: false,
    }
}

/// Backend double with switchable failures
#[derive(Default)]
pub struct FakeApi {
    pub conversations: Mutex<Vec<Conversation>>,
    pub messages: Mutex<HashMap<String, Vec<Message>>>,
    pub message_delays: Mutex<HashMap<String, Duration>>,
    pub notifications: Mutex<NotificationPage>,
    pub reject_auth: AtomicBool,
    pub fail_mark_read: AtomicBool,
    pub conversation_loads: AtomicUsize,
    pub mark_read_calls: AtomicUsize,
}

impl FakeApi {
    fn check_auth(&self) -> Result<()> {
        if self.reject_auth.load(Ordering::SeqCst) {
            return Err(SyncError::Auth("token expired".to_string()));
        }
        Ok(())
    }

    fn check_write(&self) -> Result<()> {
        self.mark_read_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_mark_read.load(Ordering::SeqCst) {
            return Err(SyncError::Transport("503 Service Unavailable".to_string()));
        }
        Ok(())
    }
}

impl HistoryApi for FakeApi {
    async fn load_conversations(&self) -> Result<Vec<Conversation>> {
        self.check_auth()?;
        self.conversation_loads.fetch_add(1, Ordering::SeqCst);
        Ok(self.conversations.lock().clone())
    }

    async fn load_messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        self.check_auth()?;
        let delay = self.message_delays.lock().get(conversation_id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self
            .messages
            .lock()
            .get(conversation_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn load_notifications(&self, limit: usize) -> Result<NotificationPage> {
        self.check_auth()?;
        let page = self.notifications.lock().clone();
        Ok(NotificationPage {
            items: page.items.into_iter().take(limit).collect(),
            unread_count: page.unread_count,
        })
    }

    async fn unread_count(&self) -> Result<u64> {
        self.check_auth()?;
        Ok(self.notifications.lock().unread_count)
    }

    async fn mark_notification_read(&self, _id: &str) -> Result<()> {
        self.check_write()
    }

    async fn mark_all_notifications_read(&self) -> Result<()> {
        self.check_write()
    }
}

/// Hands the server half of every connection to the test
pub struct DuplexConnector {
    servers: mpsc::UnboundedSender<DuplexStream>,
    pub refuse: Arc<AtomicBool>,
    pub connects: Arc<AtomicUsize>,
}

impl DuplexConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DuplexStream>) {
        let (servers, rx) = mpsc::unbounded_channel();
        (
            Self {
                servers,
                refuse: Arc::new(AtomicBool::new(false)),
                connects: Arc::new(AtomicUsize::new(0)),
            },
            rx,
        )
    }
}

impl Connector for DuplexConnector {
    async fn connect(&self) -> Result<BoxedStream> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(SyncError::Transport("connection refused".to_string()));
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        let (client, server) = tokio::io::duplex(64 * 1024);
        self.servers
            .send(server)
            .map_err(|_| SyncError::Transport("test server gone".to_string()))?;
        Ok(Box::new(client))
    }
}

/// Server end of one push connection
pub struct FakeServer {
    lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
    writer: WriteHalf<DuplexStream>,
}

impl FakeServer {
    pub async fn accept(servers: &mut mpsc::UnboundedReceiver<DuplexStream>) -> Self {
        let stream = tokio::time::timeout(Duration::from_secs(2), servers.recv())
            .await
            .expect("no connection within 2s")
            .expect("connector dropped");
        let (reader, writer) = tokio::io::split(stream);
        Self {
            lines: BufReader::new(reader).lines(),
            writer,
        }
    }

    /// Accept and consume the join frame
    pub async fn accept_joined(
        servers: &mut mpsc::UnboundedReceiver<DuplexStream>,
        user: &str,
    ) -> Self {
        let mut server = Self::accept(servers).await;
        let join = server.read_frame().await;
        assert_eq!(join.event, "join");
        assert_eq!(join.data, serde_json::json!(user));
        server
    }

    pub async fn read_frame(&mut self) -> Frame {
        let line = tokio::time::timeout(Duration::from_secs(2), self.lines.next_line())
            .await
            .expect("no frame within 2s")
            .expect("read failed")
            .expect("client closed the stream");
        Frame::from_line(&line).expect("client sent invalid frame")
    }

    pub async fn push(&mut self, event: &str, data: serde_json::Value) {
        let line = Frame::new(event, data).to_line().unwrap();
        self.push_raw(&line).await;
    }

    pub async fn push_raw(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.flush().await.unwrap();
    }
}

/// Poll `check` until it holds or two seconds pass
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if check().await {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
