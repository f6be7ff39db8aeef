//! Bounded, insertion-ordered set of CIDs awaiting broadcast.

use std::collections::{HashSet, VecDeque};

/// Result of queueing a CID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueOutcome {
    /// The CID was queued.
    Queued,
    /// The CID was already queued.
    Duplicate,
    /// The CID was queued and the oldest entry was dropped to make room.
    QueuedEvicting(String),
}

impl QueueOutcome {
    /// Returns true if the CID is newly queued.
    #[must_use]
    pub const fn is_new(&self) -> bool {
        !matches!(self, Self::Duplicate)
    }
}

/// CIDs announced since the last flush.
///
/// Insertion is idempotent and the queue never holds more than
/// `max_pending` entries; overflow drops the oldest.
#[derive(Debug, Clone)]
pub struct PendingQueue {
    order: VecDeque<String>,
    members: HashSet<String>,
    max_pending: usize,
}

impl PendingQueue {
    /// Creates an empty queue bounded at `max_pending`.
    #[must_use]
    pub fn new(max_pending: usize) -> Self {
        Self {
            order: VecDeque::new(),
            members: HashSet::new(),
            max_pending: max_pending.max(1),
        }
    }

    /// Queues a CID unless it is already pending.
    pub fn insert(&mut self, cid: &str) -> QueueOutcome {
        if self.members.contains(cid) {
            return QueueOutcome::Duplicate;
        }

        let evicted = if self.order.len() >= self.max_pending {
            self.order.pop_front().inspect(|oldest| {
                self.members.remove(oldest);
            })
        } else {
            None
        };

        self.order.push_back(cid.to_string());
        self.members.insert(cid.to_string());
        evicted.map_or(QueueOutcome::Queued, QueueOutcome::QueuedEvicting)
    }

    /// Takes every pending CID in announcement order, leaving the queue
    /// empty.
    pub fn drain(&mut self) -> Vec<String> {
        self.members.clear();
        self.order.drain(..).collect()
    }

    /// Returns true if `cid` is pending.
    #[must_use]
    pub fn contains(&self, cid: &str) -> bool {
        self.members.contains(cid)
    }

    /// Returns the pending CIDs in announcement order.
    #[must_use]
    pub fn pending(&self) -> Vec<String> {
        self.order.iter().cloned().collect()
    }

    /// Returns the number of pending CIDs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Returns true if nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Returns the queue bound.
    #[must_use]
    pub const fn max_pending(&self) -> usize {
        self.max_pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn duplicate_announcements_collapse() {
        let mut queue = PendingQueue::new(10);
        assert_eq!(queue.insert("QmA"), QueueOutcome::Queued);
        assert_eq!(queue.insert("QmB"), QueueOutcome::Queued);
        assert_eq!(queue.insert("QmA"), QueueOutcome::Duplicate);

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pending(), vec!["QmA", "QmB"]);
    }

    #[test]
    fn drain_empties_and_preserves_order() {
        let mut queue = PendingQueue::new(10);
        for cid in ["Qm3", "Qm1", "Qm2"] {
            queue.insert(cid);
        }

        assert_eq!(queue.drain(), vec!["Qm3", "Qm1", "Qm2"]);
        assert!(queue.is_empty());
        assert!(!queue.contains("Qm1"));
        // A drained CID may be announced again
        assert_eq!(queue.insert("Qm1"), QueueOutcome::Queued);
    }

    #[test]
    fn overflow_drops_oldest() {
        let mut queue = PendingQueue::new(2);
        queue.insert("QmA");
        queue.insert("QmB");

        assert_eq!(
            queue.insert("QmC"),
            QueueOutcome::QueuedEvicting("QmA".to_string())
        );
        assert_eq!(queue.pending(), vec!["QmB", "QmC"]);
        assert!(!queue.contains("QmA"));
    }

    #[test]
    fn outcome_is_new() {
        assert!(QueueOutcome::Queued.is_new());
        assert!(QueueOutcome::QueuedEvicting("x".into()).is_new());
        assert!(!QueueOutcome::Duplicate.is_new());
    }

    proptest! {
        #[test]
        fn queue_stays_bounded_and_unique(
            max_pending in 1usize..16,
            cids in proptest::collection::vec(0u8..32, 0..128),
        ) {
            let mut queue = PendingQueue::new(max_pending);
            for cid in &cids {
                queue.insert(&format!("Qm{cid}"));
                prop_assert!(queue.len() <= max_pending);
            }
            let drained = queue.drain();
            let unique: HashSet<&String> = drained.iter().collect();
            prop_assert_eq!(unique.len(), drained.len());
        }
    }
}
