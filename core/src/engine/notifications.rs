/// Reconciliation engine for the notification feed
use super::{time_rank, MergeOutcome, Origin};
use crate::push::{FeedItem, PushEvent};
use crate::types::Notification;
use tracing::debug;

#[derive(Debug, Clone)]
struct Entry {
    notification: Notification,
    origin: Origin,
}

/// Combine two versions of the same notification; see the chat engine's
/// `join` for the rules.
fn join(
    existing: &Notification,
    existing_origin: Origin,
    incoming: Notification,
    origin: Origin,
) -> Notification {
    let take_content = (origin.rank(), incoming.title.as_str(), incoming.body.as_str())
        > (existing_origin.rank(), existing.title.as_str(), existing.body.as_str());
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

/// Undo information for an optimistic mark-read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadRollback {
    One {
        id: String,
        was_read: bool,
        /// What the optimistic write took off the count
        decremented: u64,
        counter_epoch: u64,
    },
    All {
        previously_unread: Vec<String>,
        decremented: u64,
        counter_epoch: u64,
    },
}

/// Canonical state of the notification feed
#[derive(Default)]
pub struct NotificationEngine {
    /// Newest first
    entries: Vec<Entry>,
    unread_count: u64,
    /// Bumped on every authoritative count; rollbacks never undo a server value
    counter_epoch: u64,
    open: bool,
    revision: u64,
}

impl NotificationEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.entries.iter().map(|e| e.notification.clone()).collect()
    }

    pub fn unread_count(&self) -> u64 {
        self.unread_count
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Whether the notification view is currently on screen
    pub fn set_open(&mut self, open: bool) {
        self.open = open;
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.notification.id == id)
    }

    fn insert_sorted(&mut self, entry: Entry) {
        let key = (entry.notification.created_at, entry.notification.id.as_str());
        let idx = self
            .entries
            .partition_point(|e| (e.notification.created_at, e.notification.id.as_str()) > key);
        self.entries.insert(idx, entry);
    }

    fn merge(&mut self, notification: Notification, origin: Origin) -> MergeOutcome {
        if let Some(pos) = self.position(&notification.id) {
            let existing = &self.entries[pos];
            let joined_origin = existing.origin.max(origin);
            let joined = join(&existing.notification, existing.origin, notification, origin);
            if joined == existing.notification {
                self.entries[pos].origin = joined_origin;
                return MergeOutcome::Unchanged;
            }
            let mut entry = self.entries.remove(pos);
            entry.notification = joined;
            entry.origin = joined_origin;
            self.insert_sorted(entry);
            return MergeOutcome::Replaced;
        }

        self.insert_sorted(Entry {
            notification,
            origin,
        });
        MergeOutcome::Inserted
    }

    /// Merge a history page; its unread count is authoritative
    pub fn apply_snapshot(&mut self, notifications: Vec<Notification>, unread_count: u64) {
        for n in notifications {
            self.merge(n, Origin::Snapshot);
        }
        self.set_authoritative_count(unread_count);
        self.revision += 1;
    }

    fn set_authoritative_count(&mut self, count: u64) {
        self.unread_count = count;
        self.counter_epoch += 1;
    }

    pub fn apply_push(&mut self, event: PushEvent) -> MergeOutcome {
        match event {
            PushEvent::ItemReceived(FeedItem::Notification(n)) => {
                let unread = !n.read;
                let outcome = self.merge(n, Origin::Push);
                if outcome == MergeOutcome::Inserted && unread && !self.open {
                    self.unread_count += 1;
                }
                if outcome.changed() {
                    self.revision += 1;
                }
                outcome
            }
            PushEvent::CounterUpdated(count) => {
                debug!("Unread count {} -> {} (server)", self.unread_count, count);
                self.set_authoritative_count(count);
                self.revision += 1;
                MergeOutcome::Replaced
            }
            other => {
                debug!("Notification feed ignoring {:?} event", other.feed());
                MergeOutcome::Unchanged
            }
        }
    }

    /// Optimistic local mark-read: count becomes `max(0, count - 1)`
    pub fn mark_read_local(&mut self, id: &str) -> ReadRollback {
        let decremented = self.unread_count.min(1);
        let was_read = match self.position(id) {
            Some(pos) => std::mem::replace(&mut self.entries[pos].notification.read, true),
            None => false,
        };
        self.unread_count -= decremented;
        self.revision += 1;
        ReadRollback::One {
            id: id.to_string(),
            was_read,
            decremented,
            counter_epoch: self.counter_epoch,
        }
    }

    pub fn mark_all_read_local(&mut self) -> ReadRollback {
        let decremented = self.unread_count;
        let mut previously_unread = Vec::new();
        for entry in self.entries.iter_mut() {
            if !entry.notification.read {
                entry.notification.read = true;
                previously_unread.push(entry.notification.id.clone());
            }
        }
        self.unread_count = 0;
        self.revision += 1;
        ReadRollback::All {
            previously_unread,
            decremented,
            counter_epoch: self.counter_epoch,
        }
    }

    /// Undo an optimistic mark-read after the backend refused it.
    ///
    /// The decrement is given back only if no authoritative count arrived
    /// since; increments from pushes in between are kept.
    pub fn rollback(&mut self, rollback: ReadRollback) {
        match rollback {
            ReadRollback::One {
                id,
                was_read,
                decremented,
                counter_epoch,
            } => {
                if let Some(pos) = self.position(&id) {
                    self.entries[pos].notification.read = was_read;
                }
                if counter_epoch == self.counter_epoch {
                    self.unread_count += decremented;
                }
            }
            ReadRollback::All {
                previously_unread,
                decremented,
                counter_epoch,
            } => {
                for id in previously_unread {
                    if let Some(pos) = self.position(&id) {
                        self.entries[pos].notification.read = false;
                    }
                }
                if counter_epoch == self.counter_epoch {
                    self.unread_count += decremented;
                }
            }
        }
        self.revision += 1;
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.unread_count = 0;
        self.revision += 1;
    }
}
