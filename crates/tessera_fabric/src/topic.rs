//! Topics, envelopes, and node mailboxes.

use serde::{Deserialize, Serialize};
use tessera_core::{ServerId, Timestamp};
use tokio::sync::mpsc;

/// Named pub/sub channel
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Topic(String);

impl Topic {
    /// Create a topic from its name
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Topic scoped to one server, e.g. `mesh.task.reply.n1`
    #[must_use]
    pub fn scoped(base: &str, id: &ServerId) -> Self {
        Self(format!("{base}.{id}"))
    }

    /// Topic name
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Topic {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// A delivered message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<M> {
    /// Publishing node
    pub from: ServerId,
    /// Topic it was published on
    pub topic: Topic,
    /// Message body
    pub payload: M,
    /// When it was published
    pub timestamp: Timestamp,
}

/// Sending half of a node's delivery queue
pub type Mailbox<M> = mpsc::UnboundedSender<Envelope<M>>;

/// Receiving half of a node's delivery queue
pub type Inbox<M> = mpsc::UnboundedReceiver<Envelope<M>>;

/// Create a mailbox/inbox pair for one node
#[must_use]
pub fn mailbox<M>() -> (Mailbox<M>, Inbox<M>) {
    mpsc::unbounded_channel()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scoped_topic() {
        let id = ServerId::new("n7").unwrap();
        let topic = Topic::scoped("mesh.health.reply", &id);
        assert_eq!(topic.as_str(), "mesh.health.reply.n7");
        assert_eq!(topic.to_string(), "mesh.health.reply.n7");
    }

    #[test]
    fn test_topic_from_str() {
        assert_eq!(Topic::from("a.b"), Topic::new("a.b".to_string()));
    }

    #[tokio::test]
    async fn test_mailbox_preserves_order() {
        let (tx, mut rx) = mailbox::<u32>();
        let from = ServerId::new("n1").unwrap();
        for i in 0..3 {
            tx.send(Envelope {
                from: from.clone(),
                topic: Topic::new("t"),
                payload: i,
                timestamp: Timestamp::now(),
            })
            .unwrap();
        }
        for i in 0..3 {
            assert_eq!(rx.recv().await.unwrap().payload, i);
        }
    }
}
