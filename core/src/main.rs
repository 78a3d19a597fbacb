/// FeedSync console watcher - Main entry point
use colored::*;
use feedsync_core::{
    ChannelManager, ChannelStatus, ChatPresenter, Config, Conversation, DeliveryStatus, HistoryApi,
    HttpHistoryClient, Message, Notification, NotificationPresenter, TcpConnector, UserSummary,
};
use std::collections::HashMap;
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = env::args().collect();
    let bin = args.first().map(|s| s.as_str()).unwrap_or("feedsync").to_string();
    let (config, positional) =
        Config::from_args(&args).map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    let command = positional.first().map(|s| s.as_str()).unwrap_or("watch");
    match command {
        "watch" | "conversations" | "notifications" | "send" => {}
        "help" | "--help" | "-h" => {
            print_help(&bin);
            return Ok(());
        }
        other => {
            eprintln!("{} Unknown command: {}", "✗".red().bold(), other.red());
            print_help(&bin);
            std::process::exit(1);
        }
    }

    let user = config
        .require_user()
        .map_err(|e| anyhow::anyhow!("{} (use --user or FEEDSYNC_USER_ID)", e))?
        .to_string();
    let api = Arc::new(HttpHistoryClient::new(&config)?);
    let manager = ChannelManager::new(
        TcpConnector::new(config.push_addr, config.request_timeout),
        &config,
    );

    match command {
        "conversations" => {
            let chat = ChatPresenter::new(api, manager.open(&user)?, &config);
            let conversations = chat.refresh_conversations().await?;
            print_conversations(&conversations);
        }
        "notifications" => {
            let feed = NotificationPresenter::new(api, manager.open(&user)?, &config);
            let notifications = feed.refresh().await?;
            print_notifications(&notifications, feed.unread_count().await);
        }
        "send" => {
            let (Some(to), Some(text)) = (positional.get(1), positional.get(2..)) else {
                eprintln!("{}", format!("Usage: {} send <counterpart> <text>", bin).yellow());
                std::process::exit(1);
            };
            let text = text.join(" ");
            if text.is_empty() {
                eprintln!("{}", format!("Usage: {} send <counterpart> <text>", bin).yellow());
                std::process::exit(1);
            }
            let chat = ChatPresenter::new(api, manager.open(&user)?, &config);
            if let Err(e) = chat.refresh_conversations().await {
                warn!("Conversation list unavailable: {}", e);
            }
            wait_connected(&manager).await;
            let conversation_id = chat.start_conversation(UserSummary::from_id(to.as_str())).await?;
            match chat.send_message(&conversation_id, &text).await {
                Ok(message) => println!(
                    "{} Message queued in {} ({})",
                    "✓".green().bold(),
                    conversation_id.cyan(),
                    message.id.dimmed()
                ),
                Err(e) => {
                    eprintln!("{} Error: {}", "✗".red().bold(), e.to_string().red());
                    std::process::exit(1);
                }
            }
        }
        _ => watch(api, &manager, &user, &config).await?,
    }

    manager.close();
    Ok(())
}

async fn watch(
    api: Arc<HttpHistoryClient>,
    manager: &ChannelManager<TcpConnector>,
    user: &str,
    config: &Config,
) -> anyhow::Result<()> {
    let chat = Arc::new(ChatPresenter::new(api.clone(), manager.open(user)?, config));
    let notifications = Arc::new(NotificationPresenter::new(api, manager.open(user)?, config));
    let mut status = manager.status();

    let chat_pump = chat.spawn_event_pump();
    let notification_pump = notifications.spawn_event_pump();

    match chat.refresh_conversations().await {
        Ok(conversations) => print_conversations(&conversations),
        Err(e) => warn!("Conversation load failed: {}", e),
    }
    match notifications.refresh().await {
        Ok(items) => print_notifications(&items, notifications.unread_count().await),
        Err(e) => warn!("Notification load failed: {}", e),
    }

    // Print the reconciled feeds, not raw events: replays and stale snapshots
    // never show up, confirmations appear as a status change
    let mut shown: HashMap<String, Message> = HashMap::new();
    print_chat_changes(&chat, &mut shown, true).await;
    let mut chat_revision = chat.revision().await;
    let mut notification_revision = notifications.revision().await;
    let mut tick = tokio::time::interval(Duration::from_millis(200));

    info!("Watching feeds for {} (Ctrl+C to stop)", user);
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
            _ = tick.tick() => {
                let revision = chat.revision().await;
                if revision != chat_revision {
                    chat_revision = revision;
                    print_chat_changes(&chat, &mut shown, false).await;
                }
                let revision = notifications.revision().await;
                if revision != notification_revision {
                    notification_revision = revision;
                    print_notifications(
                        &notifications.notifications().await,
                        notifications.unread_count().await,
                    );
                }
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *status.borrow_and_update();
                print_status(current);
            }
        }
    }

    chat_pump.abort();
    notification_pump.abort();
    Ok(())
}

/// Messages that differ from what was last shown; records them as shown
fn unseen_messages(shown: &mut HashMap<String, Message>, messages: Vec<Message>) -> Vec<Message> {
    let mut unseen = Vec::new();
    for message in messages {
        if shown.get(&message.id) == Some(&message) {
            continue;
        }
        shown.insert(message.id.clone(), message.clone());
        unseen.push(message);
    }
    unseen
}

/// Print messages that are new or changed since the last call
async fn print_chat_changes<A: HistoryApi>(
    chat: &ChatPresenter<A>,
    shown: &mut HashMap<String, Message>,
    quiet: bool,
) {
    let local = chat.local_user().to_string();
    let mut printed = false;
    for conv in chat.conversations().await {
        for message in unseen_messages(shown, chat.messages(&conv.id).await) {
            if quiet {
                continue;
            }
            let prefix = match (message.sender_id == local, message.status) {
                (false, _) => "←".green().bold(),
                (true, DeliveryStatus::Confirmed) => "✓".green(),
                (true, _) => "→".cyan(),
            };
            print_message(prefix, &message);
            printed = true;
        }
    }
    if printed {
        println!(
            "{} unread messages: {}",
            "●".yellow(),
            chat.total_unread().await.to_string().bold()
        );
    }
}

async fn wait_connected(manager: &ChannelManager<TcpConnector>) {
    let mut status = manager.status();
    let connected = tokio::time::timeout(
        Duration::from_secs(5),
        status.wait_for(|s| s.is_connected()),
    )
    .await;
    if !matches!(connected, Ok(Ok(_))) {
        warn!("Push channel not connected, the send will be marked failed");
    }
}

fn print_help(bin: &str) {
    println!("{}", "FeedSync".bright_cyan().bold());
    println!();
    println!("{}", "Usage:".bright_white().bold());
    println!("  {} [--api URL] [--push HOST:PORT] [--user ID] [--token T] <command>", bin.cyan());
    println!();
    println!("{}", "Commands:".bright_white().bold());
    println!("  {}                          Follow both feeds live (default)", "watch".cyan());
    println!("  {}                  List conversations", "conversations".cyan());
    println!("  {}                  List notifications", "notifications".cyan());
    println!("  {} <counterpart> <text>      Send a message", "send".cyan());
}

fn print_conversations(conversations: &[Conversation]) {
    if conversations.is_empty() {
        println!("{}", "No conversations".yellow());
        return;
    }
    println!("{}", format!("Conversations ({})", conversations.len()).bold());
    println!("{}", "─".repeat(60).dimmed());
    for conv in conversations {
        let preview = conv
            .last_message
            .as_ref()
            .map(|m| m.body.as_str())
            .unwrap_or("");
        let unread = if conv.unread_count > 0 {
            format!(" [{}]", conv.unread_count).yellow().bold().to_string()
        } else {
            String::new()
        };
        println!(
            "  {}{}  {}  {}",
            conv.counterpart.name.cyan(),
            unread,
            conv.id.dimmed(),
            preview
        );
    }
}

fn print_notifications(notifications: &[Notification], unread: u64) {
    println!(
        "{} ({} unread)",
        format!("Notifications ({})", notifications.len()).bold(),
        unread.to_string().yellow()
    );
    println!("{}", "─".repeat(60).dimmed());
    for n in notifications {
        let marker = if n.read { "○".dimmed() } else { "●".yellow() };
        println!(
            "  {} {}  {}  {}",
            marker,
            n.created_at.format("%Y-%m-%d %H:%M").to_string().dimmed(),
            n.title.bold(),
            n.body
        );
    }
}

fn print_message(prefix: ColoredString, message: &Message) {
    let status = match message.status {
        DeliveryStatus::Confirmed => "".normal(),
        DeliveryStatus::Provisional => " (sending)".dimmed(),
        DeliveryStatus::Failed => " (failed)".red(),
    };
    println!(
        "{} {} {}: {}{}",
        prefix,
        message.conversation_id.dimmed(),
        message.sender_id.cyan(),
        message.body,
        status
    );
}

fn print_status(status: ChannelStatus) {
    match status {
        ChannelStatus::Connected { session } => {
            println!("{} push channel connected (session {})", "✓".green(), session)
        }
        ChannelStatus::Connecting => println!("{} connecting...", "…".dimmed()),
        ChannelStatus::Disconnected => println!(
            "{} push channel lost, feeds are stale until the next refresh",
            "✗".red()
        ),
        ChannelStatus::Closed => println!("{} push channel closed", "-".dimmed()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_only_changed_messages_are_shown() {
        let mut shown = HashMap::new();
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let mut sent = Message::provisional("u1_u2", "u1", "u2", "hi", now);
        let received = Message {
            id: "m1".to_string(),
            sender_id: "u2".to_string(),
            receiver_id: "u1".to_string(),
            read: false,
            status: DeliveryStatus::Confirmed,
            ..sent.clone()
        };

        let first = unseen_messages(&mut shown, vec![sent.clone(), received.clone()]);
        assert_eq!(first.len(), 2);
        // A replayed push leaves the reconciled state unchanged
        assert!(unseen_messages(&mut shown, vec![sent.clone(), received.clone()]).is_empty());

        sent.status = DeliveryStatus::Failed;
        let changed = unseen_messages(&mut shown, vec![sent.clone(), received]);
        assert_eq!(changed, vec![sent]);
    }
}
