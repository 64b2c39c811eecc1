//! Broker client abstraction
//!
//! The broker's wire protocol lives behind these traits: [`KafkaBroker`]
//! implements them against a real cluster, [`MemoryBroker`] routes messages
//! in-process for tests and local development.
//!
//! [`KafkaBroker`]: crate::kafka::KafkaBroker
//! [`MemoryBroker`]: crate::memory::MemoryBroker

use std::collections::HashMap;

use bytes::Bytes;

use crate::MessageResult;

/// Record handed to a producer.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub payload: Bytes,
    /// Optional partitioning key.
    pub key: Option<String>,
    pub headers: HashMap<String, String>,
}

impl OutboundMessage {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            key: None,
            headers: HashMap::new(),
        }
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }
}

/// Record delivered to a consumer.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub payload: Bytes,
    pub headers: HashMap<String, String>,
}

/// A publish/subscribe broker client.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait MessageBroker: Send + Sync {
    /// Connects a producer handle.
    async fn create_producer(&self) -> MessageResult<Box<dyn ProducerHandle>>;

    /// Connects a consumer bound to `group_id` and subscribed to `topic`.
    ///
    /// With `from_beginning` the consumer starts from the earliest available
    /// offset instead of only new messages.
    async fn create_consumer(
        &self,
        group_id: &str,
        topic: &str,
        from_beginning: bool,
    ) -> MessageResult<Box<dyn ConsumerStream>>;
}

/// A connected producer, safe for concurrent use.
#[async_trait::async_trait]
pub trait ProducerHandle: Send + Sync {
    async fn send(&self, topic: &str, message: OutboundMessage) -> MessageResult<()>;

    /// Flushes in-flight deliveries before the handle is dropped.
    async fn disconnect(&self) -> MessageResult<()>;
}

/// A connected consumer's message stream.
#[async_trait::async_trait]
pub trait ConsumerStream: Send {
    /// Next delivered message, or `None` once the stream has ended.
    async fn next_message(&mut self) -> MessageResult<Option<InboundMessage>>;
}
