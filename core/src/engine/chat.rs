/// Reconciliation engine for the conversation feed
use super::{time_rank, MergeOutcome, Origin};
use crate::error::{Result, SyncError};
use crate::identity::counterpart;
use crate::push::{FeedItem, PushEvent};
use crate::types::{Conversation, DeliveryStatus, Message, MessageSummary, UserSummary};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, warn};

/// Provisional index key; the conversation is implied by the owning thread
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PendingKey {
    sender_id: String,
    body_digest: [u8; 32],
}

impl PendingKey {
    fn for_message(message: &Message) -> Self {
        let mut body_digest = [0u8; 32];
        body_digest.copy_from_slice(&Sha256::digest(message.body.as_bytes()));
        Self {
            sender_id: message.sender_id.clone(),
            body_digest,
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    message: Message,
    origin: Origin,
    /// Position key: creation time, then the id the entry was first inserted
    /// under. A confirmed message inherits its provisional's key.
    sort_key: (DateTime<Utc>, String),
    /// Confirmed in place of a provisional; the key no longer follows `created_at`
    pinned: bool,
    /// Time of the latest send attempt (provisional entries only)
    sent_at: DateTime<Utc>,
}

impl Entry {
    fn new(message: Message, origin: Origin) -> Self {
        let sort_key = (message.created_at, message.id.clone());
        let sent_at = message.created_at;
        Self {
            message,
            origin,
            sort_key,
            pinned: false,
            sent_at,
        }
    }
}

/// Combine two versions of the same message.
///
/// Every field is picked by a rule that ignores arrival order: content from
/// the higher-ranked origin (body breaks ties), read if either version says
/// so, and the timestamp the server assigned over one we estimated.
fn join(existing: &Message, existing_origin: Origin, incoming: Message, origin: Origin) -> Message {
    let take_content = (origin.rank(), incoming.body.as_str())
        > (existing_origin.rank(), existing.body.as_str());
    let take_time = time_rank(incoming.time_estimated, incoming.created_at)
        > time_rank(existing.time_estimated, existing.created_at);
    let read = existing.read || incoming.read;
    let (created_at, time_estimated) = if take_time {
        (incoming.created_at, incoming.time_estimated)
    } else {
        (existing.created_at, existing.time_estimated)
    };

    let mut joined = if take_content {
        incoming
    } else {
        existing.clone()
    };
    joined.read = read;
    joined.created_at = created_at;
    joined.time_estimated = time_estimated;
    joined
}

/// Messages of one conversation, ascending by `sort_key`
#[derive(Debug, Default)]
struct Thread {
    entries: Vec<Entry>,
    /// Provisional ids per (sender, body), oldest first
    pending: HashMap<PendingKey, VecDeque<String>>,
}

impl Thread {
    fn position(&self, id: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.message.id == id)
    }

    fn insert_sorted(&mut self, entry: Entry) -> usize {
        let idx = self.entries.partition_point(|e| e.sort_key <= entry.sort_key);
        self.entries.insert(idx, entry);
        idx
    }

    fn insert_provisional(&mut self, message: Message) {
        self.pending
            .entry(PendingKey::for_message(&message))
            .or_default()
            .push_back(message.id.clone());
        self.insert_sorted(Entry::new(message, Origin::Local));
    }

    /// Oldest pending provisional entry this confirmation answers, if any
    fn take_pending(&mut self, confirmed: &Message, window: chrono::Duration) -> Option<String> {
        let key = PendingKey::for_message(confirmed);
        let queue = self.pending.get_mut(&key)?;
        let entries = &self.entries;
        let idx = queue.iter().position(|pid| {
            entries
                .iter()
                .find(|e| &e.message.id == pid)
                .map(|e| {
                    e.message.status == DeliveryStatus::Provisional
                        && within(e.sent_at, confirmed.created_at, window)
                })
                .unwrap_or(false)
        })?;
        let pid = queue.remove(idx);
        if queue.is_empty() {
            self.pending.remove(&key);
        }
        pid
    }

    fn merge(&mut self, message: Message, origin: Origin, window: chrono::Duration) -> MergeOutcome {
        if let Some(pos) = self.position(&message.id) {
            let existing = &self.entries[pos];
            let joined_origin = existing.origin.max(origin);
            let joined = join(&existing.message, existing.origin, message, origin);
            if joined == existing.message {
                self.entries[pos].origin = joined_origin;
                return MergeOutcome::Unchanged;
            }

            let mut entry = self.entries.remove(pos);
            let moved = !entry.pinned && entry.message.created_at != joined.created_at;
            entry.message = joined;
            entry.origin = joined_origin;
            if moved {
                entry.sort_key.0 = entry.message.created_at;
                self.insert_sorted(entry);
            } else {
                self.entries.insert(pos, entry);
            }
            return MergeOutcome::Replaced;
        }

        if message.status == DeliveryStatus::Confirmed {
            if let Some(provisional_id) = self.take_pending(&message, window) {
                match self.position(&provisional_id) {
                    Some(pos) => {
                        let entry = &mut self.entries[pos];
                        entry.message = message;
                        entry.origin = origin;
                        entry.pinned = true;
                        return MergeOutcome::Confirmed { provisional_id };
                    }
                    None => warn!(
                        "{}",
                        SyncError::ReconciliationConflict(format!(
                            "pending {} has no entry; inserting {} by time",
                            provisional_id, message.id
                        ))
                    ),
                }
            }
        }

        self.insert_sorted(Entry::new(message, origin));
        MergeOutcome::Inserted
    }

    /// Summary of the newest entry
    fn latest(&self) -> Option<MessageSummary> {
        self.entries.last().map(|e| e.message.summary())
    }

    /// Whether `summary` describes an entry of this thread
    fn describes(&self, summary: &MessageSummary) -> bool {
        match &summary.message_id {
            Some(id) => self.position(id).is_some(),
            // Provisional previews carry no id; match them like a confirmation would
            None => self
                .entries
                .iter()
                .any(|e| e.message.sender_id == summary.sender_id && e.message.body == summary.body),
        }
    }

    fn entry_mut(&mut self, id: &str) -> Option<&mut Entry> {
        self.entries.iter_mut().find(|e| e.message.id == id)
    }
}

fn within(a: DateTime<Utc>, b: DateTime<Utc>, window: chrono::Duration) -> bool {
    let delta = if a > b { a - b } else { b - a };
    delta <= window
}

/// Identifies one history load of a conversation's messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadTicket {
    pub conversation_id: String,
    pub generation: u64,
}

/// Canonical state of the conversation feed
pub struct ChatEngine {
    local_user: String,
    confirm_window: chrono::Duration,
    /// Most recently active first
    conversations: Vec<Conversation>,
    threads: HashMap<String, Thread>,
    /// Newest preview the loader reported per conversation
    server_previews: HashMap<String, MessageSummary>,
    open: Option<String>,
    next_generation: u64,
    applied_generation: u64,
    revision: u64,
}

impl ChatEngine {
    pub fn new(local_user: impl Into<String>, confirm_window: std::time::Duration) -> Self {
        Self {
            local_user: local_user.into(),
            confirm_window: chrono::Duration::from_std(confirm_window)
                .unwrap_or_else(|_| chrono::Duration::days(1)),
            conversations: Vec::new(),
            threads: HashMap::new(),
            server_previews: HashMap::new(),
            open: None,
            next_generation: 0,
            applied_generation: 0,
            revision: 0,
        }
    }

    pub fn local_user(&self) -> &str {
        &self.local_user
    }

    /// Bumped on every change; cheap change detection for presenters
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn conversations(&self) -> Vec<Conversation> {
        self.conversations.clone()
    }

    pub fn conversation(&self, id: &str) -> Option<Conversation> {
        self.conversations.iter().find(|c| c.id == id).cloned()
    }

    pub fn messages(&self, conversation_id: &str) -> Vec<Message> {
        self.threads
            .get(conversation_id)
            .map(|t| t.entries.iter().map(|e| e.message.clone()).collect())
            .unwrap_or_default()
    }

    pub fn open_conversation_id(&self) -> Option<&str> {
        self.open.as_deref()
    }

    pub fn total_unread(&self) -> u32 {
        self.conversations.iter().map(|c| c.unread_count).sum()
    }

    fn conversation_index(&self, id: &str) -> Option<usize> {
        self.conversations.iter().position(|c| c.id == id)
    }

    /// Merge a conversation list from the history loader
    pub fn apply_conversations(&mut self, incoming: Vec<Conversation>) {
        for mut conv in incoming {
            if self.open.as_deref() == Some(conv.id.as_str()) {
                conv.unread_count = 0;
            }
            if let Some(preview) = conv.last_message.take() {
                self.offer_server_preview(&conv.id, preview);
            }
            match self.conversation_index(&conv.id) {
                Some(idx) => {
                    let existing = &mut self.conversations[idx];
                    // The server's count is authoritative unless we saw newer activity
                    let server_activity = self
                        .server_previews
                        .get(&conv.id)
                        .map(|p| p.created_at.max(conv.updated_at))
                        .unwrap_or(conv.updated_at);
                    if server_activity >= existing.last_activity() {
                        existing.unread_count = conv.unread_count;
                    }
                    existing.counterpart = conv.counterpart;
                    existing.updated_at = existing.updated_at.max(conv.updated_at);
                }
                None => self.conversations.push(conv),
            }
        }
        let ids: Vec<String> = self.conversations.iter().map(|c| c.id.clone()).collect();
        for id in ids {
            self.refresh_preview(&id);
        }
        self.sort_conversations();
        self.revision += 1;
    }

    fn offer_server_preview(&mut self, conversation_id: &str, preview: MessageSummary) {
        let key = |p: &MessageSummary| (p.created_at, p.message_id.clone(), p.body.clone());
        match self.server_previews.get_mut(conversation_id) {
            Some(current) if key(current) >= key(&preview) => {}
            Some(current) => *current = preview,
            None => {
                self.server_previews.insert(conversation_id.to_string(), preview);
            }
        }
    }

    /// Recompute the last-message preview from the thread and the loader's report.
    ///
    /// The thread's newest entry wins unless the loader knows of a later
    /// message we have not seen yet.
    fn refresh_preview(&mut self, conversation_id: &str) {
        let thread = self.threads.get(conversation_id);
        let latest = thread.and_then(Thread::latest);
        let server = self.server_previews.get(conversation_id);
        let preview = match (latest, server, thread) {
            (Some(latest), Some(server), Some(thread)) => {
                if thread.describes(server) || latest.created_at >= server.created_at {
                    Some(latest)
                } else {
                    Some(server.clone())
                }
            }
            (latest, server, _) => latest.or_else(|| server.cloned()),
        };
        if let (Some(preview), Some(idx)) = (preview, self.conversation_index(conversation_id)) {
            self.conversations[idx].last_message = Some(preview);
        }
    }

    /// Most recently active first; id breaks ties
    fn sort_conversations(&mut self) {
        self.conversations.sort_by(|a, b| {
            b.last_activity()
                .cmp(&a.last_activity())
                .then_with(|| a.id.cmp(&b.id))
        });
    }

    /// Conversation with `counterpart`, created locally when there is no history yet
    pub fn ensure_conversation(&mut self, counterpart: UserSummary, now: DateTime<Utc>) -> String {
        let conv = Conversation::new_local(&self.local_user, counterpart, now);
        let id = conv.id.clone();
        if self.conversation_index(&id).is_none() {
            debug!("Starting local conversation {}", id);
            self.conversations.push(conv);
            self.threads.entry(id.clone()).or_default();
            self.sort_conversations();
            self.revision += 1;
        }
        id
    }

    /// Make `conversation_id` the open conversation and issue a ticket for its
    /// message load. Takes effect immediately for unread suppression.
    pub fn open(&mut self, conversation_id: &str) -> LoadTicket {
        self.open = Some(conversation_id.to_string());
        self.next_generation += 1;
        if let Some(idx) = self.conversation_index(conversation_id) {
            self.conversations[idx].unread_count = 0;
        }
        if let Some(thread) = self.threads.get_mut(conversation_id) {
            for entry in thread.entries.iter_mut() {
                if entry.message.sender_id != self.local_user {
                    entry.message.read = true;
                }
            }
        }
        self.revision += 1;
        LoadTicket {
            conversation_id: conversation_id.to_string(),
            generation: self.next_generation,
        }
    }

    pub fn close(&mut self) {
        if self.open.take().is_some() {
            self.revision += 1;
        }
    }

    /// Merge a message history response.
    ///
    /// Returns false when the response was discarded because a newer load
    /// has already been applied.
    pub fn apply_message_load(&mut self, ticket: &LoadTicket, messages: Vec<Message>) -> bool {
        if ticket.generation < self.applied_generation {
            debug!(
                "Discarding stale message load for {} (generation {} < {})",
                ticket.conversation_id, ticket.generation, self.applied_generation
            );
            return false;
        }
        self.applied_generation = ticket.generation;

        let window = self.confirm_window;
        let mut touched = vec![ticket.conversation_id.clone()];
        for mut message in messages {
            if self.open.as_deref() == Some(message.conversation_id.as_str())
                && message.sender_id != self.local_user
            {
                message.read = true;
            }
            if message.conversation_id != ticket.conversation_id {
                warn!(
                    "{}",
                    SyncError::ReconciliationConflict(format!(
                        "message {} belongs to {} but arrived with {}",
                        message.id, message.conversation_id, ticket.conversation_id
                    ))
                );
            }
            let conversation_id = message.conversation_id.clone();
            let outcome = self
                .threads
                .entry(conversation_id.clone())
                .or_default()
                .merge(message, Origin::Snapshot, window);
            if outcome.changed() && !touched.contains(&conversation_id) {
                touched.push(conversation_id);
            }
        }
        self.threads.entry(ticket.conversation_id.clone()).or_default();
        for id in &touched {
            self.refresh_preview(id);
        }
        self.sort_conversations();
        self.revision += 1;
        true
    }

    /// Optimistically add a message from the local user
    pub fn insert_provisional(
        &mut self,
        conversation_id: &str,
        body: &str,
        now: DateTime<Utc>,
    ) -> Result<Message> {
        let receiver = self
            .conversation(conversation_id)
            .map(|c| c.counterpart.id)
            .ok_or_else(|| {
                SyncError::ReconciliationConflict(format!(
                    "cannot send into unknown conversation {}",
                    conversation_id
                ))
            })?;

        let message = Message::provisional(conversation_id, &self.local_user, receiver, body, now);
        self.threads
            .entry(conversation_id.to_string())
            .or_default()
            .insert_provisional(message.clone());
        self.refresh_preview(conversation_id);
        self.sort_conversations();
        self.revision += 1;
        Ok(message)
    }

    /// Mark a provisional message as failed; it stays visible for retry
    pub fn mark_failed(&mut self, message_id: &str) -> bool {
        for thread in self.threads.values_mut() {
            if let Some(entry) = thread.entry_mut(message_id) {
                if entry.message.status == DeliveryStatus::Provisional {
                    entry.message.status = DeliveryStatus::Failed;
                    self.revision += 1;
                    return true;
                }
                return false;
            }
        }
        false
    }

    /// Put a failed message back in flight, keeping its position
    pub fn retry(&mut self, message_id: &str, now: DateTime<Utc>) -> Option<Message> {
        for thread in self.threads.values_mut() {
            if let Some(entry) = thread.entry_mut(message_id) {
                if entry.message.status != DeliveryStatus::Failed {
                    return None;
                }
                entry.message.status = DeliveryStatus::Provisional;
                entry.sent_at = now;
                let message = entry.message.clone();
                self.revision += 1;
                return Some(message);
            }
        }
        None
    }

    /// Apply one routed push event
    pub fn apply_push(&mut self, event: PushEvent) -> MergeOutcome {
        match event {
            PushEvent::ItemReceived(FeedItem::Message(message)) => self.apply_live(message, true),
            PushEvent::OwnItemConfirmed(message) => self.apply_live(message, false),
            other => {
                debug!("Chat feed ignoring {:?} event", other.feed());
                MergeOutcome::Unchanged
            }
        }
    }

    fn apply_live(&mut self, mut message: Message, received: bool) -> MergeOutcome {
        let conversation_id = message.conversation_id.clone();
        if self.conversation_index(&conversation_id).is_none() {
            let other = counterpart(&self.local_user, &message.sender_id, &message.receiver_id);
            warn!(
                "{}",
                SyncError::ReconciliationConflict(format!(
                    "message {} references unknown conversation {}, creating it with {}",
                    message.id, conversation_id, other
                ))
            );
            // Activity comes from the preview until the loader reports the conversation
            let mut conv = Conversation::new_local(
                &self.local_user,
                UserSummary::from_id(other),
                DateTime::<Utc>::MIN_UTC,
            );
            conv.id = conversation_id.clone();
            self.conversations.push(conv);
        }

        let from_counterpart = message.sender_id != self.local_user;
        let is_open = self.open.as_deref() == Some(conversation_id.as_str());
        if is_open && from_counterpart {
            message.read = true;
        }
        let window = self.confirm_window;
        let outcome = self
            .threads
            .entry(conversation_id.clone())
            .or_default()
            .merge(message, Origin::Push, window);
        if outcome == MergeOutcome::Unchanged {
            return outcome;
        }

        if received && from_counterpart && outcome == MergeOutcome::Inserted && !is_open {
            if let Some(idx) = self.conversation_index(&conversation_id) {
                self.conversations[idx].unread_count += 1;
            }
        }
        self.refresh_preview(&conversation_id);
        self.sort_conversations();
        self.revision += 1;
        outcome
    }

    /// Drop everything, e.g. after the identity was rejected
    pub fn clear(&mut self) {
        self.conversations.clear();
        self.threads.clear();
        self.server_previews.clear();
        self.open = None;
        self.revision += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn confirmed(id: &str, sender: &str, receiver: &str, body: &str, t: i64) -> Message {
        Message {
            id: id.to_string(),
            conversation_id: crate::identity::derive_conversation_id(sender, receiver),
            sender_id: sender.to_string(),
            receiver_id: receiver.to_string(),
            body: body.to_string(),
            created_at: at(t),
            time_estimated: false,
            read: false,
            status: DeliveryStatus::Confirmed,
        }
    }

    fn estimated(id: &str, sender: &str, receiver: &str, body: &str, t: i64) -> Message {
        Message {
            time_estimated: true,
            ..confirmed(id, sender, receiver, body, t)
        }
    }

    fn engine() -> ChatEngine {
        let mut engine = ChatEngine::new("u1", std::time::Duration::from_secs(30));
        engine.ensure_conversation(UserSummary::from_id("u2"), at(0));
        engine
    }

    fn ids(engine: &ChatEngine, conv: &str) -> Vec<String> {
        engine.messages(conv).into_iter().map(|m| m.id).collect()
    }

    #[test]
    fn test_confirmation_replaces_provisional_in_place() {
        let mut engine = engine();
        engine.apply_push(PushEvent::ItemReceived(FeedItem::Message(confirmed(
            "m1", "u2", "u1", "before", 5,
        ))));
        let provisional = engine.insert_provisional("u1_u2", "hi", at(10)).unwrap();
        engine.apply_push(PushEvent::ItemReceived(FeedItem::Message(confirmed(
            "m2", "u2", "u1", "after", 20,
        ))));
        assert_eq!(ids(&engine, "u1_u2"), vec!["m1", provisional.id.as_str(), "m2"]);

        // Server clock slightly later than the neighbour; position still held
        let outcome =
            engine.apply_push(PushEvent::OwnItemConfirmed(confirmed("m100", "u1", "u2", "hi", 25)));
        assert_eq!(
            outcome,
            MergeOutcome::Confirmed {
                provisional_id: provisional.id.clone()
            }
        );
        assert_eq!(ids(&engine, "u1_u2"), vec!["m1", "m100", "m2"]);
    }

    #[test]
    fn test_confirmation_outside_window_is_inserted() {
        let mut engine = engine();
        engine.insert_provisional("u1_u2", "hi", at(0)).unwrap();
        let outcome =
            engine.apply_push(PushEvent::OwnItemConfirmed(confirmed("m100", "u1", "u2", "hi", 600)));
        assert_eq!(outcome, MergeOutcome::Inserted);
        assert_eq!(engine.messages("u1_u2").len(), 2);
    }

    #[test]
    fn test_identical_bodies_pair_in_send_order() {
        let mut engine = engine();
        let first = engine.insert_provisional("u1_u2", "ok", at(1)).unwrap();
        let second = engine.insert_provisional("u1_u2", "ok", at(2)).unwrap();

        let outcome =
            engine.apply_push(PushEvent::OwnItemConfirmed(confirmed("m1", "u1", "u2", "ok", 3)));
        assert_eq!(
            outcome,
            MergeOutcome::Confirmed {
                provisional_id: first.id
            }
        );
        let outcome =
            engine.apply_push(PushEvent::OwnItemConfirmed(confirmed("m2", "u1", "u2", "ok", 4)));
        assert_eq!(
            outcome,
            MergeOutcome::Confirmed {
                provisional_id: second.id
            }
        );
        assert_eq!(ids(&engine, "u1_u2"), vec!["m1", "m2"]);
    }

    #[test]
    fn test_failed_entry_is_kept_and_retryable() {
        let mut engine = engine();
        let msg = engine.insert_provisional("u1_u2", "hi", at(1)).unwrap();
        assert!(engine.mark_failed(&msg.id));
        assert_eq!(engine.messages("u1_u2")[0].status, DeliveryStatus::Failed);

        // A failed entry is not matched until retried
        let retried = engine.retry(&msg.id, at(100)).unwrap();
        assert_eq!(retried.status, DeliveryStatus::Provisional);
        let outcome =
            engine.apply_push(PushEvent::OwnItemConfirmed(confirmed("m9", "u1", "u2", "hi", 101)));
        assert!(matches!(outcome, MergeOutcome::Confirmed { .. }));
        assert_eq!(ids(&engine, "u1_u2"), vec!["m9"]);
    }

    #[test]
    fn test_snapshot_does_not_override_push() {
        let mut engine = engine();
        engine.apply_push(PushEvent::ItemReceived(FeedItem::Message(confirmed(
            "m1", "u2", "u1", "hello", 1,
        ))));

        let ticket = engine.open("u1_u2");
        let stale = confirmed("m1", "u2", "u1", "stale copy", 1);
        assert!(engine.apply_message_load(&ticket, vec![stale]));
        let messages = engine.messages("u1_u2");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].body, "hello");
    }

    #[test]
    fn test_server_time_moves_estimated_entry() {
        let push = || PushEvent::ItemReceived(FeedItem::Message(estimated("m1", "u2", "u1", "hi", 100)));
        let snapshot = || vec![confirmed("m1", "u2", "u1", "hi", 1), confirmed("m2", "u2", "u1", "yo", 50)];

        let mut push_first = engine();
        push_first.apply_push(push());
        let ticket = push_first.open("u1_u2");
        push_first.apply_message_load(&ticket, snapshot());

        let mut load_first = engine();
        let ticket = load_first.open("u1_u2");
        load_first.apply_message_load(&ticket, snapshot());
        load_first.apply_push(push());

        for engine in [&push_first, &load_first] {
            assert_eq!(ids(engine, "u1_u2"), vec!["m1", "m2"]);
            let first = &engine.messages("u1_u2")[0];
            assert_eq!(first.created_at, at(1));
            assert!(!first.time_estimated);
            let preview = engine.conversation("u1_u2").unwrap().last_message.unwrap();
            assert_eq!(preview.message_id.as_deref(), Some("m2"));
        }
        assert_eq!(push_first.messages("u1_u2"), load_first.messages("u1_u2"));
    }

    #[test]
    fn test_read_flag_is_never_lost() {
        let mut engine = engine();
        let ticket = engine.open("u1_u2");
        engine.apply_push(PushEvent::ItemReceived(FeedItem::Message(confirmed(
            "m1", "u2", "u1", "hi", 1,
        ))));
        engine.close();
        // A later snapshot still reporting unread does not undo the local read
        assert!(engine.apply_message_load(&ticket, vec![confirmed("m1", "u2", "u1", "hi", 1)]));
        assert!(engine.messages("u1_u2")[0].read);
    }

    #[test]
    fn test_equal_times_stay_sorted_after_confirmation() {
        let mut engine = engine();
        engine.apply_push(PushEvent::ItemReceived(FeedItem::Message(confirmed(
            "m5", "u2", "u1", "a", 10,
        ))));
        engine.insert_provisional("u1_u2", "hi", at(10)).unwrap();
        // Server id sorts before the neighbour, the provisional id after it
        let outcome =
            engine.apply_push(PushEvent::OwnItemConfirmed(confirmed("a1", "u1", "u2", "hi", 10)));
        assert!(matches!(outcome, MergeOutcome::Confirmed { .. }));
        engine.apply_push(PushEvent::ItemReceived(FeedItem::Message(confirmed(
            "n", "u2", "u1", "b", 10,
        ))));

        assert_eq!(ids(&engine, "u1_u2"), vec!["m5", "n", "a1"]);
        let entries = &engine.threads["u1_u2"].entries;
        assert!(entries.windows(2).all(|w| w[0].sort_key <= w[1].sort_key));
    }

    #[test]
    fn test_unread_counts_and_bump() {
        let mut engine = engine();
        engine.ensure_conversation(UserSummary::from_id("u3"), at(1));
        assert_eq!(engine.conversations()[0].id, "u1_u3");

        engine.apply_push(PushEvent::ItemReceived(FeedItem::Message(confirmed(
            "m1", "u2", "u1", "yo", 5,
        ))));
        let convs = engine.conversations();
        assert_eq!(convs[0].id, "u1_u2");
        assert_eq!(convs[0].unread_count, 1);
        assert_eq!(convs[0].last_message.as_ref().unwrap().body, "yo");

        // Replay does not double count
        engine.apply_push(PushEvent::ItemReceived(FeedItem::Message(confirmed(
            "m1", "u2", "u1", "yo", 5,
        ))));
        assert_eq!(engine.total_unread(), 1);

        engine.open("u1_u2");
        assert_eq!(engine.total_unread(), 0);
        engine.apply_push(PushEvent::ItemReceived(FeedItem::Message(confirmed(
            "m2", "u2", "u1", "again", 6,
        ))));
        assert_eq!(engine.total_unread(), 0);
    }

    #[test]
    fn test_stale_load_is_discarded() {
        let mut engine = engine();
        engine.ensure_conversation(UserSummary::from_id("u3"), at(0));
        let first = engine.open("u1_u2");
        let second = engine.open("u1_u3");

        assert!(engine.apply_message_load(&second, vec![confirmed("m3", "u3", "u1", "c", 3)]));
        assert!(!engine.apply_message_load(&first, vec![confirmed("m2", "u2", "u1", "b", 2)]));
        assert!(engine.messages("u1_u2").is_empty());
        assert_eq!(engine.open_conversation_id(), Some("u1_u3"));
    }

    #[test]
    fn test_unknown_conversation_created_from_message() {
        let mut engine = ChatEngine::new("u1", std::time::Duration::from_secs(30));
        engine.apply_push(PushEvent::ItemReceived(FeedItem::Message(confirmed(
            "m1", "u9", "u1", "new here", 1,
        ))));
        let conv = engine.conversation("u1_u9").unwrap();
        assert_eq!(conv.counterpart.id, "u9");
        assert_eq!(conv.unread_count, 1);
    }

    #[test]
    fn test_send_into_unknown_conversation_fails() {
        let mut engine = ChatEngine::new("u1", std::time::Duration::from_secs(30));
        let err = engine.insert_provisional("u1_u2", "hi", at(0)).unwrap_err();
        assert!(matches!(err, SyncError::ReconciliationConflict(_)));
    }
}
