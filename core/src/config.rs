/// Configuration management
use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

const DEFAULT_API_BASE_URL: &str = "http://127.0.0.1:5000/api";
const DEFAULT_PUSH_ADDR: &str = "127.0.0.1:5001";

/// Feed synchronization configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Base URL of the REST backend (plain http)
    pub api_base_url: String,

    /// Push channel address
    pub push_addr: SocketAddr,

    /// Local identity used to join the push channel
    pub user_id: Option<String>,

    /// Bearer token for REST calls
    pub auth_token: Option<String>,

    /// Per-request timeout for history loads and mark-read calls
    pub request_timeout: Duration,

    /// Delay between push channel reconnect attempts
    pub reconnect_interval: Duration,

    /// How far apart a provisional send and its confirmation may be
    pub confirm_window: Duration,

    /// Page size for the notification history load
    pub notification_limit: usize,

    /// Per-feed buffer of routed push events
    pub event_buffer: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            push_addr: DEFAULT_PUSH_ADDR
                .parse()
                .unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], 5001))),
            user_id: None,
            auth_token: None,
            request_timeout: Duration::from_secs(10),
            reconnect_interval: Duration::from_secs(5),
            confirm_window: Duration::from_secs(30),
            notification_limit: 20,
            event_buffer: 256,
        }
    }
}

impl Config {
    /// Parse flags from command line arguments.
    ///
    /// Returns the config and the remaining positional arguments (after the
    /// program name), in order.
    pub fn from_args(args: &[String]) -> Result<(Self, Vec<String>)> {
        let mut config = Config::default();
        let mut positional = Vec::new();

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--api" => {
                    config.api_base_url = flag_value(args, i, "--api")?.to_string();
                    i += 2;
                }
                "--push" => {
                    let v = flag_value(args, i, "--push")?;
                    config.push_addr = v.parse().map_err(|_| {
                        SyncError::Config(format!("--push must be host:port, got {}", v))
                    })?;
                    i += 2;
                }
                "--user" => {
                    config.user_id = Some(flag_value(args, i, "--user")?.to_string());
                    i += 2;
                }
                "--token" => {
                    config.auth_token = Some(flag_value(args, i, "--token")?.to_string());
                    i += 2;
                }
                "--limit" => {
                    let v = flag_value(args, i, "--limit")?;
                    config.notification_limit = v.parse().map_err(|_| {
                        SyncError::Config("--limit must be a positive number".to_string())
                    })?;
                    i += 2;
                }
                "--confirm-window-ms" => {
                    let v = flag_value(args, i, "--confirm-window-ms")?;
                    let ms = v.parse::<u64>().map_err(|_| {
                        SyncError::Config("--confirm-window-ms must be a number".to_string())
                    })?;
                    config.confirm_window = Duration::from_millis(ms);
                    i += 2;
                }
                other => {
                    positional.push(other.to_string());
                    i += 1;
                }
            }
        }

        config.apply_env();
        config.validate()?;
        Ok((config, positional))
    }

    /// Env overrides (nice for scripts)
    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("FEEDSYNC_API_URL") {
            self.api_base_url = url;
        }
        if let Some(addr) = std::env::var("FEEDSYNC_PUSH_ADDR")
            .ok()
            .and_then(|s| s.parse::<SocketAddr>().ok())
        {
            self.push_addr = addr;
        }
        if let Ok(user) = std::env::var("FEEDSYNC_USER_ID") {
            self.user_id = Some(user);
        }
        if let Ok(token) = std::env::var("FEEDSYNC_TOKEN") {
            self.auth_token = Some(token);
        }
    }

    /// Check values that would otherwise fail late
    pub fn validate(&self) -> Result<()> {
        if !self.api_base_url.starts_with("http://") {
            return Err(SyncError::Config(format!(
                "api base url must be an http:// url, got {}",
                self.api_base_url
            )));
        }
        if self.notification_limit == 0 {
            return Err(SyncError::Config(
                "notification limit must be at least 1".to_string(),
            ));
        }
        if self.event_buffer == 0 {
            return Err(SyncError::Config("event buffer must be at least 1".to_string()));
        }
        Ok(())
    }

    /// The configured identity, or an auth error when none is set
    pub fn require_user(&self) -> Result<&str> {
        match self.user_id.as_deref() {
            Some(id) if !id.is_empty() => Ok(id),
            _ => Err(SyncError::Auth("no user id configured".to_string())),
        }
    }
}

fn flag_value<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a str> {
    args.get(i + 1)
        .map(|s| s.as_str())
        .ok_or_else(|| SyncError::Config(format!("{} requires a value", flag)))
}
