//! In-process broker for tests and local development
//!
//! Routes messages entirely in memory: every topic keeps its delivery
//! history, and every consumer group attached to a topic receives every
//! message published to it. `from_beginning` replays the history to a
//! late-joining group, matching the offset policy of the Kafka backend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::broker::{ConsumerStream, InboundMessage, MessageBroker, OutboundMessage, ProducerHandle};
use crate::MessageResult;

#[derive(Default)]
struct TopicState {
    history: Vec<InboundMessage>,
    groups: Vec<mpsc::UnboundedSender<InboundMessage>>,
}

#[derive(Default)]
struct BrokerState {
    topics: HashMap<String, TopicState>,
    /// How many consumers were ever created, per group id.
    consumers_created: HashMap<String, usize>,
}

/// Broker client that never leaves the process.
#[derive(Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of consumers ever created for `group_id`.
    pub fn consumers_created(&self, group_id: &str) -> usize {
        lock(&self.state).consumers_created.get(group_id).copied().unwrap_or(0)
    }

    /// Number of messages delivered to `topic` so far.
    pub fn delivered(&self, topic: &str) -> usize {
        lock(&self.state)
            .topics
            .get(topic)
            .map(|topic| topic.history.len())
            .unwrap_or(0)
    }
}

fn lock(state: &Arc<Mutex<BrokerState>>) -> MutexGuard<'_, BrokerState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl MessageBroker for MemoryBroker {
    async fn create_producer(&self) -> MessageResult<Box<dyn ProducerHandle>> {
        Ok(Box::new(MemoryProducer {
            state: Arc::clone(&self.state),
        }))
    }

    async fn create_consumer(
        &self,
        group_id: &str,
        topic: &str,
        from_beginning: bool,
    ) -> MessageResult<Box<dyn ConsumerStream>> {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut state = lock(&self.state);
        *state.consumers_created.entry(group_id.to_string()).or_insert(0) += 1;

        let topic_state = state.topics.entry(topic.to_string()).or_default();
        if from_beginning {
            for message in &topic_state.history {
                let _ = tx.send(message.clone());
            }
        }
        topic_state.groups.push(tx);

        Ok(Box::new(MemoryConsumerStream { rx }))
    }
}

struct MemoryProducer {
    state: Arc<Mutex<BrokerState>>,
}

#[async_trait]
impl ProducerHandle for MemoryProducer {
    async fn send(&self, topic: &str, message: OutboundMessage) -> MessageResult<()> {
        let delivered = InboundMessage {
            payload: message.payload,
            headers: message.headers,
        };

        let mut state = lock(&self.state);
        let topic_state = state.topics.entry(topic.to_string()).or_default();
        topic_state.history.push(delivered.clone());
        // Closed consumers fall out of the fan-out list here.
        topic_state.groups.retain(|group| group.send(delivered.clone()).is_ok());
        Ok(())
    }

    async fn disconnect(&self) -> MessageResult<()> {
        Ok(())
    }
}

struct MemoryConsumerStream {
    rx: mpsc::UnboundedReceiver<InboundMessage>,
}

#[async_trait]
impl ConsumerStream for MemoryConsumerStream {
    async fn next_message(&mut self) -> MessageResult<Option<InboundMessage>> {
        Ok(self.rx.recv().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn message(text: &str) -> OutboundMessage {
        OutboundMessage::new(Bytes::copy_from_slice(text.as_bytes()))
    }

    #[tokio::test]
    async fn every_group_receives_every_message() {
        let broker = MemoryBroker::new();
        let producer = broker.create_producer().await.unwrap();
        let mut first = broker.create_consumer("group-a", "family.created.people.profile", true).await.unwrap();
        let mut second = broker.create_consumer("group-b", "family.created.people.profile", true).await.unwrap();

        producer.send("family.created.people.profile", message("hello")).await.unwrap();

        let to_first = first.next_message().await.unwrap().unwrap();
        let to_second = second.next_message().await.unwrap().unwrap();
        assert_eq!(to_first.payload, Bytes::from_static(b"hello"));
        assert_eq!(to_second.payload, Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn from_beginning_replays_history() {
        let broker = MemoryBroker::new();
        let producer = broker.create_producer().await.unwrap();
        producer.send("family.created.people.profile", message("early")).await.unwrap();

        let mut late = broker.create_consumer("late-group", "family.created.people.profile", true).await.unwrap();
        let replayed = late.next_message().await.unwrap().unwrap();
        assert_eq!(replayed.payload, Bytes::from_static(b"early"));
    }

    #[tokio::test]
    async fn without_from_beginning_history_is_skipped() {
        let broker = MemoryBroker::new();
        let producer = broker.create_producer().await.unwrap();
        producer.send("family.created.people.profile", message("early")).await.unwrap();

        let mut late = broker.create_consumer("late-group", "family.created.people.profile", false).await.unwrap();
        producer.send("family.created.people.profile", message("fresh")).await.unwrap();

        let received = late.next_message().await.unwrap().unwrap();
        assert_eq!(received.payload, Bytes::from_static(b"fresh"));
    }

    #[tokio::test]
    async fn tracks_consumer_creation_counts() {
        let broker = MemoryBroker::new();
        broker.create_consumer("group-a", "family.created.people.profile", true).await.unwrap();
        broker.create_consumer("group-a", "family.created.people.profile", true).await.unwrap();

        assert_eq!(broker.consumers_created("group-a"), 2);
        assert_eq!(broker.consumers_created("group-b"), 0);
    }
}
