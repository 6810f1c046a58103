//! Acknowledgement bookkeeping of the publish pipeline.

use opcua_api::SubscriptionAcknowledgement;
use std::collections::{HashMap, HashSet};

use crate::types::sequence_after;

/// Acknowledgements waiting for the next publish request
///
/// Each request takes the whole pending set. After a response the set is
/// rebuilt: acknowledgements of other subscriptions stay, those of the
/// responding subscription stay only while the server still lists them as
/// available, and the received message is added unless it is a keep-alive.
///
/// Every data message is acknowledged, even one that arrives after a newer
/// message was already acknowledged. Such a message is only reported.
#[derive(Debug, Default)]
pub struct AckTracker {
    pending: Vec<SubscriptionAcknowledgement>,
    /// Newest sequence number sent per subscription
    latest_sent: HashMap<u32, u32>,
}

impl AckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the pending set for a request and remember what was sent
    pub fn take(&mut self) -> Vec<SubscriptionAcknowledgement> {
        let acks = std::mem::take(&mut self.pending);
        for ack in &acks {
            self.latest_sent
                .entry(ack.subscription_id)
                .and_modify(|latest| {
                    if sequence_after(ack.sequence_number, *latest) {
                        *latest = ack.sequence_number;
                    }
                })
                .or_insert(ack.sequence_number);
        }
        acks
    }

    /// Put back acknowledgements of a failed request
    pub fn requeue(&mut self, acks: Vec<SubscriptionAcknowledgement>) {
        for ack in acks {
            self.push(ack);
        }
    }

    fn push(&mut self, ack: SubscriptionAcknowledgement) {
        if !self.pending.contains(&ack) {
            self.pending.push(ack);
        }
    }

    /// True if the sequence number is not newer than the last one sent
    pub fn is_duplicate(&self, subscription_id: u32, sequence_number: u32) -> bool {
        self.latest_sent
            .get(&subscription_id)
            .is_some_and(|latest| !sequence_after(sequence_number, *latest))
    }

    /// Rebuild the pending set after a publish response
    ///
    /// Returns true when the message is not newer than an acknowledgement
    /// already sent. It is acknowledged again all the same.
    pub fn on_response(
        &mut self,
        subscription_id: u32,
        available: &[u32],
        sequence_number: u32,
        keep_alive: bool,
    ) -> bool {
        self.pending.retain(|ack| {
            ack.subscription_id != subscription_id || available.contains(&ack.sequence_number)
        });

        if keep_alive {
            return false;
        }

        let duplicate = self.is_duplicate(subscription_id, sequence_number);
        self.push(SubscriptionAcknowledgement {
            subscription_id,
            sequence_number,
        });
        duplicate
    }

    /// Drop everything kept for subscriptions not in `known`
    ///
    /// Returns the number of pending acknowledgements dropped.
    pub fn retain_subscriptions(&mut self, known: &HashSet<u32>) -> usize {
        let before = self.pending.len();
        self.pending.retain(|ack| known.contains(&ack.subscription_id));
        self.latest_sent.retain(|id, _| known.contains(id));
        before - self.pending.len()
    }

    pub fn pending(&self) -> &[SubscriptionAcknowledgement] {
        &self.pending
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ack(subscription_id: u32, sequence_number: u32) -> SubscriptionAcknowledgement {
        SubscriptionAcknowledgement {
            subscription_id,
            sequence_number,
        }
    }

    #[test]
    fn test_data_message_is_acknowledged_once() {
        let mut tracker = AckTracker::new();
        assert!(!tracker.on_response(1, &[5], 5, false));
        assert!(!tracker.on_response(1, &[5], 5, false));
        assert_eq!(tracker.pending(), &[ack(1, 5)]);

        let sent = tracker.take();
        assert_eq!(sent, vec![ack(1, 5)]);
        assert!(tracker.is_empty());

        // the same message again after it was sent is reported and acknowledged
        assert!(tracker.on_response(1, &[5], 5, false));
        assert_eq!(tracker.pending(), &[ack(1, 5)]);
        assert!(tracker.is_duplicate(1, 4));
        assert!(!tracker.is_duplicate(1, 6));
        assert!(!tracker.is_duplicate(2, 1));
    }

    #[test]
    fn test_out_of_order_message_is_still_acknowledged() {
        let mut tracker = AckTracker::new();
        // two requests in flight; 6 is answered before 5
        tracker.on_response(1, &[5, 6], 6, false);
        assert_eq!(tracker.take(), vec![ack(1, 6)]);

        assert!(tracker.on_response(1, &[5], 5, false));
        assert_eq!(tracker.pending(), &[ack(1, 5)]);
        assert_eq!(tracker.take(), vec![ack(1, 5)]);

        // 5 did not move the newest sent number back
        assert!(tracker.is_duplicate(1, 6));
        assert!(!tracker.is_duplicate(1, 7));
    }

    #[test]
    fn test_acknowledgements_continue_after_rollover() {
        let mut tracker = AckTracker::new();
        tracker.on_response(1, &[u32::MAX], u32::MAX, false);
        tracker.take();

        assert!(!tracker.on_response(1, &[1], 1, false));
        assert_eq!(tracker.take(), vec![ack(1, 1)]);
        assert!(!tracker.on_response(1, &[2], 2, false));
        assert_eq!(tracker.pending(), &[ack(1, 2)]);
    }

    #[test]
    fn test_acknowledgements_of_removed_subscriptions_dropped() {
        let mut tracker = AckTracker::new();
        tracker.on_response(1, &[1], 1, false);
        tracker.on_response(2, &[3], 3, false);
        tracker.take();
        tracker.on_response(1, &[2], 2, false);
        tracker.on_response(2, &[4], 4, false);

        let known = HashSet::from([2]);
        assert_eq!(tracker.retain_subscriptions(&known), 1);
        assert_eq!(tracker.pending(), &[ack(2, 4)]);
        assert!(!tracker.is_duplicate(1, 1));
        assert!(tracker.is_duplicate(2, 3));
    }

    #[test]
    fn test_keep_alive_is_never_acknowledged() {
        let mut tracker = AckTracker::new();
        assert!(!tracker.on_response(1, &[], 7, true));
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_unavailable_acks_dropped_for_responding_subscription_only() {
        let mut tracker = AckTracker::new();
        tracker.on_response(1, &[1], 1, false);
        tracker.on_response(2, &[1], 1, false);
        tracker.on_response(1, &[1, 2], 2, false);
        assert_eq!(tracker.len(), 3);

        // server no longer lists 1 for subscription 1
        tracker.on_response(1, &[2, 3], 3, false);
        assert_eq!(tracker.pending(), &[ack(2, 1), ack(1, 2), ack(1, 3)]);
    }

    #[test]
    fn test_requeue_after_failure() {
        let mut tracker = AckTracker::new();
        tracker.on_response(1, &[1], 1, false);
        let sent = tracker.take();
        tracker.on_response(2, &[4], 4, false);

        tracker.requeue(sent.clone());
        tracker.requeue(sent);
        assert_eq!(tracker.pending(), &[ack(2, 4), ack(1, 1)]);
    }
}
