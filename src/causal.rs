//! # Causal Delivery
//!
//! Synchronous core of the causal broadcast: it owns the local clock, the
//! bounded history of delivered clocks and the buffer of messages received
//! too early. Every method runs to completion, so the owning actor can treat
//! one call as one atomic state transition.
//!
//! ## Delivery Rule
//!
//! A received message is delivered as soon as its clock is causally ready
//! against the local clock (see [`QuasiVectorClock::is_causally_ready`]).
//! Delivering it folds the sender's slots into the local clock, which may in
//! turn make buffered messages ready; these are delivered in the same call
//! until no buffered message is ready any more.
//!
//! ## Anomaly Flag
//!
//! A delivered clock that is strictly below the local clock and below or
//! equal to every clock in the delivered history looks stale. The delivery
//! carries `error = true`; it is still delivered.

use std::collections::VecDeque;

use serde_json::Value;
use tracing::{trace, warn};

use crate::messages::CausalMessage;
use crate::qvc::QuasiVectorClock;

/// Delivered clocks remembered for anomaly detection.
pub const DEFAULT_DELIVERED_HISTORY: usize = 100;

/// Messages held while waiting for their causal predecessors.
/// SECURITY: The oldest waiting message is dropped beyond this bound.
pub const DEFAULT_MAX_PENDING: usize = 10_000;

/// A message handed to the application.
#[derive(Clone, Debug, PartialEq)]
pub struct Delivery {
    pub msg: Value,
    /// Originated at this peer.
    pub local: bool,
    /// The clock looked stale relative to recent deliveries.
    pub error: bool,
    /// Slots owned by the originator.
    pub entries: Vec<usize>,
}

#[derive(Debug)]
pub struct CausalOrder {
    clock: QuasiVectorClock,
    delivered: VecDeque<QuasiVectorClock>,
    pending: VecDeque<CausalMessage>,
    history_capacity: usize,
    max_pending: usize,
}

impl CausalOrder {
    pub fn new(clock: QuasiVectorClock, history_capacity: usize, max_pending: usize) -> Self {
        Self {
            clock,
            delivered: VecDeque::with_capacity(history_capacity.min(DEFAULT_DELIVERED_HISTORY)),
            pending: VecDeque::new(),
            history_capacity: history_capacity.max(1),
            max_pending: max_pending.max(1),
        }
    }

    pub fn clock(&self) -> &QuasiVectorClock {
        &self.clock
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn delivered_len(&self) -> usize {
        self.delivered.len()
    }

    /// Records a local event and returns its delivery.
    pub fn local_event(&mut self, msg: Value) -> Delivery {
        self.clock.increment();
        Delivery {
            msg,
            local: true,
            error: false,
            entries: self.clock.entries(),
        }
    }

    /// Stamps `msg` with a snapshot of the local clock for broadcasting.
    pub fn stamp(&self, msg: Value) -> CausalMessage {
        CausalMessage {
            qvc: self.clock.clone(),
            msg,
        }
    }

    /// Handles a received message. Returns every message delivered as a
    /// consequence, in delivery order.
    pub fn receive(&mut self, message: CausalMessage) -> Vec<Delivery> {
        if message.qvc.width() != self.clock.width() {
            warn!(
                width = message.qvc.width(),
                expected = self.clock.width(),
                "dropping message stamped with a foreign clock width"
            );
            return Vec::new();
        }

        if !message.qvc.is_causally_ready(&self.clock) {
            trace!(pending = self.pending.len(), "message not causally ready, buffering");
            if self.pending.len() >= self.max_pending
                && self.pending.pop_front().is_some()
            {
                warn!(max = self.max_pending, "pending buffer full, dropped oldest message");
            }
            self.pending.push_back(message);
            return Vec::new();
        }

        let mut deliveries = vec![self.deliver(message)];
        while let Some(pos) = self
            .pending
            .iter()
            .position(|m| m.qvc.is_causally_ready(&self.clock))
        {
            if let Some(ready) = self.pending.remove(pos) {
                deliveries.push(self.deliver(ready));
            }
        }
        deliveries
    }

    /// True when `qvc` is below the local clock and below or equal to every
    /// remembered delivered clock.
    pub fn detect_error(&self, qvc: &QuasiVectorClock) -> bool {
        qvc.is_inferior(&self.clock) && self.delivered.iter().all(|d| qvc.is_inferior_or_equal(d))
    }

    fn deliver(&mut self, message: CausalMessage) -> Delivery {
        self.clock.increment_from(&message.qvc);
        let error = self.detect_error(&message.qvc);
        let entries = message.qvc.entries();

        if self.delivered.len() >= self.history_capacity {
            self.delivered.pop_front();
        }
        self.delivered.push_back(message.qvc);

        Delivery {
            msg: message.msg,
            local: false,
            error,
            entries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entries_hash::EntriesHashGenerator;
    use serde_json::json;

    fn order(width: usize, entries: &[usize]) -> CausalOrder {
        let clock = QuasiVectorClock::new(width, entries).unwrap();
        CausalOrder::new(clock, DEFAULT_DELIVERED_HISTORY, DEFAULT_MAX_PENDING)
    }

    fn msgs(deliveries: &[Delivery]) -> Vec<Value> {
        deliveries.iter().map(|d| d.msg.clone()).collect()
    }

    #[test]
    fn local_event_advances_clock() {
        let mut sender = order(7, &[1, 3]);
        let delivery = sender.local_event(json!("a"));
        assert!(delivery.local);
        assert!(!delivery.error);
        assert_eq!(delivery.entries, vec![1, 3]);
        assert_eq!(sender.clock().clocks(), &[0, 1, 0, 1, 0, 0, 0]);
    }

    #[test]
    fn first_message_is_delivered_without_error() {
        let hash = EntriesHashGenerator::default().generate(100, 5).unwrap();
        let mut p1 = order(hash.width(), &hash.hash("p1"));
        let mut p2 = order(hash.width(), &hash.hash("p2"));

        p1.local_event(json!("a"));
        let stamped = p1.stamp(json!("a"));
        let delivered = p2.receive(stamped);

        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].msg, json!("a"));
        assert!(!delivered[0].local);
        assert!(!delivered[0].error);
        for slot in hash.hash("p1") {
            assert!(p2.clock().clocks()[slot] >= 1);
        }
    }

    #[test]
    fn out_of_order_message_waits_for_predecessor() {
        let mut p1 = order(11, &[2, 7]);
        let mut p2 = order(11, &[4]);

        p1.local_event(json!("m1"));
        let m1 = p1.stamp(json!("m1"));
        p1.local_event(json!("m2"));
        let m2 = p1.stamp(json!("m2"));

        assert!(p2.receive(m2).is_empty());
        assert_eq!(p2.pending_len(), 1);

        let delivered = p2.receive(m1);
        assert_eq!(msgs(&delivered), vec![json!("m1"), json!("m2")]);
        assert!(delivered.iter().all(|d| !d.error));
        assert_eq!(p2.pending_len(), 0);
        assert_eq!(p2.delivered_len(), 2);
    }

    #[test]
    fn cascade_unlocks_a_chain() {
        let mut p1 = order(5, &[0]);
        let mut p2 = order(5, &[3]);

        let stamped: Vec<_> = (0..4)
            .map(|i| {
                p1.local_event(json!(i));
                p1.stamp(json!(i))
            })
            .collect();

        for m in stamped.iter().skip(1).rev() {
            assert!(p2.receive(m.clone()).is_empty());
        }
        assert_eq!(p2.pending_len(), 3);

        let delivered = p2.receive(stamped[0].clone());
        assert_eq!(msgs(&delivered), vec![json!(0), json!(1), json!(2), json!(3)]);
    }

    #[test]
    fn dependency_on_third_party_is_respected() {
        // p2 delivers p1's message, then broadcasts; p3 must see p1 first.
        let mut p1 = order(7, &[0]);
        let mut p2 = order(7, &[5]);
        let mut p3 = order(7, &[6]);

        p1.local_event(json!("x"));
        let from_p1 = p1.stamp(json!("x"));
        p2.receive(from_p1.clone());
        p2.local_event(json!("y"));
        let from_p2 = p2.stamp(json!("y"));

        assert!(p3.receive(from_p2).is_empty());
        let delivered = p3.receive(from_p1);
        assert_eq!(msgs(&delivered), vec![json!("x"), json!("y")]);
    }

    #[test]
    fn stale_duplicate_is_flagged() {
        let mut p1 = order(5, &[0]);
        let mut p2 = order(5, &[2]);

        p1.local_event(json!("a"));
        let m = p1.stamp(json!("a"));
        assert!(!p2.receive(m.clone())[0].error);

        let again = p2.receive(m);
        assert_eq!(again.len(), 1);
        assert!(again[0].error);
    }

    #[test]
    fn foreign_width_is_dropped() {
        let mut p2 = order(5, &[2]);
        let foreign = CausalMessage {
            qvc: QuasiVectorClock::new(7, &[0]).unwrap(),
            msg: json!("?"),
        };
        assert!(p2.receive(foreign).is_empty());
        assert_eq!(p2.pending_len(), 0);
    }

    #[test]
    fn history_and_pending_are_bounded() {
        let clock = QuasiVectorClock::new(3, &[1]).unwrap();
        let mut p2 = CausalOrder::new(clock, 2, 2);
        let mut p1 = order(3, &[0]);

        for i in 0..5 {
            p1.local_event(json!(i));
            p2.receive(p1.stamp(json!(i)));
        }
        assert_eq!(p2.delivered_len(), 2);

        for i in 0..4 {
            p1.local_event(json!(i));
        }
        for i in 0..3 {
            p1.local_event(json!(i));
            p2.receive(p1.stamp(json!(i)));
        }
        assert_eq!(p2.pending_len(), 2);
    }
}
