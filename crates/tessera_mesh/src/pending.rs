//! Outstanding requests awaiting replies, keyed by correlation id.

use crate::message::Message;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tessera_core::CorrelationId;
use tokio::sync::{mpsc, oneshot};

enum Slot {
    /// Resolved by the first reply, then removed
    Once(oneshot::Sender<Message>),
    /// Accepts replies until the waiter goes away
    Stream(mpsc::UnboundedSender<Message>),
}

/// Table of requests this node is waiting on
#[derive(Default)]
pub(crate) struct PendingReplies {
    slots: Mutex<HashMap<CorrelationId, Slot>>,
}

impl PendingReplies {
    fn slots(&self) -> std::sync::MutexGuard<'_, HashMap<CorrelationId, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait for a single reply
    pub(crate) fn expect_one(
        &self,
        correlation_id: CorrelationId,
    ) -> (PendingGuard<'_>, oneshot::Receiver<Message>) {
        let (tx, rx) = oneshot::channel();
        self.slots().insert(correlation_id, Slot::Once(tx));
        (self.guard(correlation_id), rx)
    }

    /// Collect any number of replies
    pub(crate) fn expect_many(
        &self,
        correlation_id: CorrelationId,
    ) -> (PendingGuard<'_>, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.slots().insert(correlation_id, Slot::Stream(tx));
        (self.guard(correlation_id), rx)
    }

    fn guard(&self, correlation_id: CorrelationId) -> PendingGuard<'_> {
        PendingGuard {
            table: self,
            correlation_id,
        }
    }

    /// Hand a reply to its waiter. Returns false for unknown or expired ids.
    pub(crate) fn resolve(&self, correlation_id: CorrelationId, reply: Message) -> bool {
        let mut slots = self.slots();
        match slots.remove(&correlation_id) {
            Some(Slot::Once(tx)) => tx.send(reply).is_ok(),
            Some(Slot::Stream(tx)) => {
                let delivered = tx.send(reply).is_ok();
                if delivered {
                    slots.insert(correlation_id, Slot::Stream(tx));
                }
                delivered
            }
            None => false,
        }
    }

    /// Number of requests still waiting
    pub(crate) fn len(&self) -> usize {
        self.slots().len()
    }
}

/// Removes its table entry when the waiter finishes or gives up
pub(crate) struct PendingGuard<'a> {
    table: &'a PendingReplies,
    correlation_id: CorrelationId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.table.slots().remove(&self.correlation_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::{HealthStatus, Timestamp};

    fn report(correlation_id: CorrelationId) -> Message {
        Message::HealthReport {
            correlation_id,
            status: HealthStatus::healthy(Timestamp::from_secs(1)),
        }
    }

    #[tokio::test]
    async fn test_single_reply_resolves_once() {
        let table = PendingReplies::default();
        let id = CorrelationId::new();
        let (_guard, rx) = table.expect_one(id);

        assert!(table.resolve(id, report(id)));
        assert!(!table.resolve(id, report(id)));
        assert_eq!(rx.await.unwrap(), report(id));
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn test_stream_accepts_many() {
        let table = PendingReplies::default();
        let id = CorrelationId::new();
        let (_guard, mut rx) = table.expect_many(id);

        assert!(table.resolve(id, report(id)));
        assert!(table.resolve(id, report(id)));
        assert_eq!(table.len(), 1);
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_some());
    }

    #[test]
    fn test_guard_drop_discards_entry() {
        let table = PendingReplies::default();
        let id = CorrelationId::new();
        {
            let (_guard, _rx) = table.expect_one(id);
            assert_eq!(table.len(), 1);
        }
        assert_eq!(table.len(), 0);
        assert!(!table.resolve(id, report(id)));
    }

    #[test]
    fn test_unknown_correlation_ignored() {
        let table = PendingReplies::default();
        assert!(!table.resolve(CorrelationId::new(), report(CorrelationId::new())));
    }
}
