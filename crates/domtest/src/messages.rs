//! One-shot subscription table routing completion messages to pending tests.
//!
//! Each launched test subscribes once under its id; the first message carrying
//! that id resolves the subscription and removes it. Timeouts are not handled
//! here: the coordinator retires an id it gave up on, after which a straggling
//! message for it is dropped rather than treated as a violation.

use crate::protocol::{TestId, WireMessage};
use crate::result::ProtocolViolation;
use std::collections::{HashMap, HashSet};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Receiving end of a subscription
pub type Subscription = oneshot::Receiver<WireMessage>;

/// What happened to an inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Handed to the waiting subscriber
    Delivered(TestId),
    /// Arrived after the id was consumed or retired; dropped
    Late(TestId),
}

/// Pending subscriptions keyed by test id
#[derive(Debug, Default)]
pub struct MessageRegistry {
    listeners: HashMap<TestId, oneshot::Sender<WireMessage>>,
    retired: HashSet<TestId>,
}

impl MessageRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in the completion message for `id`.
    ///
    /// At most one subscription per id per run: subscribing an id that is
    /// pending, or was already consumed or retired, is a violation.
    pub fn subscribe(&mut self, id: TestId) -> Result<Subscription, ProtocolViolation> {
        if self.listeners.contains_key(&id) || self.retired.contains(&id) {
            return Err(ProtocolViolation::DuplicateSubscription { id });
        }
        let (tx, rx) = oneshot::channel();
        debug!(test_id = %id, "subscribed");
        self.listeners.insert(id, tx);
        Ok(rx)
    }

    /// Route raw wire text to its subscriber
    pub fn dispatch(&mut self, payload: &str) -> Result<Delivery, ProtocolViolation> {
        let message = WireMessage::decode(payload)?;
        let Some(id) = message.id.clone() else {
            return Err(ProtocolViolation::MissingId {
                payload: payload.to_string(),
            });
        };

        match self.listeners.remove(&id) {
            Some(tx) => {
                self.retired.insert(id.clone());
                if tx.send(message).is_err() {
                    // The waiting side already settled on its own.
                    warn!(test_id = %id, "completion arrived for an abandoned test");
                    return Ok(Delivery::Late(id));
                }
                Ok(Delivery::Delivered(id))
            }
            None if self.retired.contains(&id) => {
                warn!(test_id = %id, "dropping late completion message");
                Ok(Delivery::Late(id))
            }
            None => Err(ProtocolViolation::UnknownSubscriber { id }),
        }
    }

    /// Stop waiting for `id`; later messages for it are dropped.
    ///
    /// Returns whether a subscription was still pending.
    pub fn retire(&mut self, id: &TestId) -> bool {
        self.retired.insert(id.clone());
        self.listeners.remove(id).is_some()
    }

    /// Whether a subscription for `id` is pending
    #[must_use]
    pub fn is_pending(&self, id: &TestId) -> bool {
        self.listeners.contains_key(id)
    }

    /// Number of pending subscriptions
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.listeners.len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn payload(result: bool, id: &str, message: &str) -> String {
        WireMessage::new(result, Some(TestId::from(id)), message)
            .encode()
            .unwrap()
    }

    #[test]
    fn test_delivers_once_then_removes() {
        let mut registry = MessageRegistry::new();
        let mut rx = registry.subscribe("a".into()).unwrap();
        assert!(registry.is_pending(&"a".into()));

        let delivery = registry.dispatch(&payload(true, "a", "Passed")).unwrap();
        assert_eq!(delivery, Delivery::Delivered("a".into()));
        assert_eq!(registry.pending_count(), 0);

        let message = rx.try_recv().unwrap();
        assert!(message.result);
        assert_eq!(message.message, "Passed");
    }

    #[test]
    fn test_duplicate_subscription_rejected() {
        let mut registry = MessageRegistry::new();
        let _rx = registry.subscribe("a".into()).unwrap();
        let err = registry.subscribe("a".into()).unwrap_err();
        assert_eq!(
            err,
            ProtocolViolation::DuplicateSubscription { id: "a".into() }
        );
    }

    #[test]
    fn test_no_resubscribe_after_consumption() {
        let mut registry = MessageRegistry::new();
        let _rx = registry.subscribe("a".into()).unwrap();
        registry.dispatch(&payload(true, "a", "Passed")).unwrap();
        assert!(registry.subscribe("a".into()).is_err());
    }

    #[test]
    fn test_missing_id_is_violation() {
        let mut registry = MessageRegistry::new();
        let err = registry
            .dispatch(r#"{"result":true,"message":"Passed"}"#)
            .unwrap_err();
        assert!(matches!(err, ProtocolViolation::MissingId { .. }));
    }

    #[test]
    fn test_unknown_id_leaves_others_untouched() {
        let mut registry = MessageRegistry::new();
        let mut rx = registry.subscribe("a".into()).unwrap();

        let err = registry.dispatch(&payload(true, "zzz", "")).unwrap_err();
        assert_eq!(err, ProtocolViolation::UnknownSubscriber { id: "zzz".into() });
        assert!(registry.is_pending(&"a".into()));

        registry.dispatch(&payload(false, "a", "boom")).unwrap();
        assert_eq!(rx.try_recv().unwrap().message, "boom");
    }

    #[test]
    fn test_late_message_after_retire_is_dropped() {
        let mut registry = MessageRegistry::new();
        let _rx = registry.subscribe("slow".into()).unwrap();
        assert!(registry.retire(&"slow".into()));

        let delivery = registry.dispatch(&payload(true, "slow", "Passed")).unwrap();
        assert_eq!(delivery, Delivery::Late("slow".into()));
    }

    #[test]
    fn test_abandoned_receiver_reads_as_late() {
        let mut registry = MessageRegistry::new();
        let rx = registry.subscribe("x".into()).unwrap();
        drop(rx);
        let delivery = registry.dispatch(&payload(true, "x", "Passed")).unwrap();
        assert_eq!(delivery, Delivery::Late("x".into()));
    }

    #[test]
    fn test_numeric_wire_id_matches_text_subscription() {
        let mut registry = MessageRegistry::new();
        let mut rx = registry.subscribe(TestId::from(3_u64)).unwrap();
        registry
            .dispatch(r#"{"result":true,"id":3,"message":"Passed"}"#)
            .unwrap();
        assert!(rx.try_recv().unwrap().result);
    }
}
