/// Reconciliation engines: one per feed, each the sole owner of its items
///
/// Loader snapshots, push events and local optimistic writes all go through
/// the same merge rule, so the final state does not depend on which source
/// arrives first.
use chrono::{DateTime, Utc};

pub mod chat;
pub mod notifications;

pub use chat::{ChatEngine, LoadTicket};
pub use notifications::{NotificationEngine, ReadRollback};

/// Where an entry's current value came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Optimistic local write
    Local,
    /// History loader response
    Snapshot,
    /// Push channel event
    Push,
}

/// What a single merge did to the feed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted,
    /// An entry with the same id was superseded
    Replaced,
    /// A provisional entry was swapped for its confirmed counterpart in place
    Confirmed { provisional_id: String },
    /// Duplicate or stale input
    Unchanged,
}

impl MergeOutcome {
    pub fn changed(&self) -> bool {
        !matches!(self, MergeOutcome::Unchanged)
    }
}

impl Origin {
    /// Content precedence for two versions of the same id
    pub(crate) fn rank(self) -> u8 {
        match self {
            Origin::Local => 0,
            Origin::Snapshot => 1,
            Origin::Push => 2,
        }
    }

    pub(crate) fn max(self, other: Origin) -> Origin {
        if other.rank() > self.rank() {
            other
        } else {
            self
        }
    }
}

/// Timestamp precedence: a server-assigned time beats a local receive time,
/// then later beats earlier. Comparing these keys is order independent.
pub(crate) fn time_rank(estimated: bool, at: DateTime<Utc>) -> (bool, DateTime<Utc>) {
    (!estimated, at)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_origin_rank() {
        assert_eq!(Origin::Snapshot.max(Origin::Push), Origin::Push);
        assert_eq!(Origin::Push.max(Origin::Snapshot), Origin::Push);
        assert_eq!(Origin::Local.max(Origin::Snapshot), Origin::Snapshot);
        assert_eq!(Origin::Local.max(Origin::Local), Origin::Local);
    }

    #[test]
    fn test_server_time_beats_estimate() {
        let early = Utc.timestamp_opt(1, 0).unwrap();
        let late = Utc.timestamp_opt(100, 0).unwrap();
        assert!(time_rank(false, early) > time_rank(true, late));
        assert!(time_rank(false, late) > time_rank(false, early));
        assert!(time_rank(true, late) > time_rank(true, early));
    }
}
