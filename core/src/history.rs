/// History loader: single-shot REST fetches of the initial feed state
///
/// Endpoints (relative to the configured base URL):
///   GET  /chat/conversations
///   GET  /chat/messages/:conversation_id
///   GET  /notifications?limit=N
///   GET  /notifications/unread-count
///   PUT  /notifications/:id/read
///   PUT  /notifications/read-all
///
/// Nothing here retries; a failed load is retried by the user.
use crate::config::Config;
use crate::error::{Result, SyncError};
use crate::types::{Conversation, Message, Notification};
use crate::wire::{parse_items, Envelope, RawConversation, RawMessage, RawNotification};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::header::{ACCEPT, AUTHORIZATION};
use http::{Method, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// One page of notifications with the server's unread count
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NotificationPage {
    pub items: Vec<Notification>,
    pub unread_count: u64,
}

/// Backend request/response operations used by the presenters
pub trait HistoryApi: Send + Sync + 'static {
    /// Most recently active first
    fn load_conversations(&self) -> impl Future<Output = Result<Vec<Conversation>>> + Send;

    /// Oldest first
    fn load_messages(
        &self,
        conversation_id: &str,
    ) -> impl Future<Output = Result<Vec<Message>>> + Send;

    fn load_notifications(
        &self,
        limit: usize,
    ) -> impl Future<Output = Result<NotificationPage>> + Send;

    fn unread_count(&self) -> impl Future<Output = Result<u64>> + Send;

    fn mark_notification_read(&self, id: &str) -> impl Future<Output = Result<()>> + Send;

    fn mark_all_notifications_read(&self) -> impl Future<Output = Result<()>> + Send;
}

/// `HistoryApi` over HTTP/1 with bearer-token auth
pub struct HttpHistoryClient {
    client: Client<HttpConnector, Full<Bytes>>,
    base_url: String,
    token: Option<String>,
    local_user: String,
    timeout: Duration,
}

impl HttpHistoryClient {
    pub fn new(config: &Config) -> Result<Self> {
        config.validate()?;
        let local_user = config.require_user()?.to_string();
        Ok(Self {
            client: Client::builder(TokioExecutor::new()).build_http(),
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            token: config.auth_token.clone(),
            local_user,
            timeout: config.request_timeout,
        })
    }

    async fn request(&self, method: Method, path: &str) -> Result<Bytes> {
        let token = self
            .token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| SyncError::Auth("no session token".to_string()))?;

        let url = format!("{}{}", self.base_url, path);
        let uri: hyper::Uri = url
            .parse()
            .map_err(|e| SyncError::Config(format!("invalid url {}: {}", url, e)))?;
        let req = Request::builder()
            .method(method.clone())
            .uri(uri)
            .header(AUTHORIZATION, format!("Bearer {}", token))
            .header(ACCEPT, "application/json")
            .body(Full::new(Bytes::new()))
            .map_err(|e| SyncError::Protocol(format!("build request: {}", e)))?;

        debug!("{} {}", method, url);
        let resp = tokio::time::timeout(self.timeout, self.client.request(req))
            .await
            .map_err(|_| SyncError::Transport(format!("{} {} timed out", method, url)))?
            .map_err(|e| SyncError::Transport(format!("{} {}: {}", method, url, e)))?;

        let status = resp.status();
        let body = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| SyncError::Transport(format!("read body: {}", e)))?
            .to_bytes();

        classify_status(status, &body)?;
        Ok(body)
    }

    async fn get_envelope(&self, path: &str) -> Result<Envelope> {
        let body = self.request(Method::GET, path).await?;
        Envelope::from_slice(&body)?.into_success()
    }
}

/// Map HTTP status onto the error taxonomy
fn classify_status(status: StatusCode, body: &[u8]) -> Result<()> {
    if status.is_success() {
        return Ok(());
    }
    let detail = Envelope::from_slice(body)
        .ok()
        .and_then(|e| e.message)
        .unwrap_or_else(|| status.to_string());
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(SyncError::Auth(detail)),
        s if s.is_server_error() => Err(SyncError::Transport(format!("{}: {}", s, detail))),
        s => Err(SyncError::Protocol(format!("{}: {}", s, detail))),
    }
}

pub(crate) fn decode_conversations(
    mut envelope: Envelope,
    local_user: &str,
    now: DateTime<Utc>,
) -> Vec<Conversation> {
    let mut conversations: Vec<Conversation> =
        parse_items::<RawConversation>(envelope.data_items(), "conversation")
            .into_iter()
            .map(|raw| raw.into_conversation(local_user, now))
            .collect();
    conversations.sort_by(|a, b| b.last_activity().cmp(&a.last_activity()));
    conversations
}

pub(crate) fn decode_messages(
    mut envelope: Envelope,
    local_user: &str,
    now: DateTime<Utc>,
) -> Vec<Message> {
    let mut messages: Vec<Message> = parse_items::<RawMessage>(envelope.data_items(), "message")
        .into_iter()
        .filter_map(|raw| match raw.into_message(local_user, now) {
            Ok(m) => Some(m),
            Err(e) => {
                warn!("Skipping history message: {}", e);
                None
            }
        })
        .collect();
    messages.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    messages
}

pub(crate) fn decode_notifications(mut envelope: Envelope, now: DateTime<Utc>) -> NotificationPage {
    let items: Vec<Notification> =
        parse_items::<RawNotification>(envelope.data_items(), "notification")
            .into_iter()
            .map(|raw| raw.into_notification(now))
            .collect();
    let unread_count = envelope
        .unread_count
        .unwrap_or_else(|| items.iter().filter(|n| !n.read).count() as u64);
    NotificationPage {
        items,
        unread_count,
    }
}

impl HistoryApi for HttpHistoryClient {
    async fn load_conversations(&self) -> Result<Vec<Conversation>> {
        let envelope = self.get_envelope("/chat/conversations").await?;
        Ok(decode_conversations(envelope, &self.local_user, Utc::now()))
    }

    async fn load_messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let path = format!("/chat/messages/{}", urlencoding::encode(conversation_id));
        let envelope = self.get_envelope(&path).await?;
        Ok(decode_messages(envelope, &self.local_user, Utc::now()))
    }

    async fn load_notifications(&self, limit: usize) -> Result<NotificationPage> {
        let envelope = self
            .get_envelope(&format!("/notifications?limit={}", limit))
            .await?;
        Ok(decode_notifications(envelope, Utc::now()))
    }

    async fn unread_count(&self) -> Result<u64> {
        let envelope = self.get_envelope("/notifications/unread-count").await?;
        Ok(envelope.count.or(envelope.unread_count).unwrap_or(0))
    }

    async fn mark_notification_read(&self, id: &str) -> Result<()> {
        let path = format!("/notifications/{}/read", urlencoding::encode(id));
        let body = self.request(Method::PUT, &path).await?;
        Envelope::from_slice(&body)?.into_success().map(|_| ())
    }

    async fn mark_all_notifications_read(&self) -> Result<()> {
        let body = self.request(Method::PUT, "/notifications/read-all").await?;
        Envelope::from_slice(&body)?.into_success().map(|_| ())
    }
}
