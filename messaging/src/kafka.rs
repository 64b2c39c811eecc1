//! Kafka-backed broker client
//!
//! Producer and consumer handles over `rdkafka`. The producer is created
//! once per process by [`BrokerConnection`] and shared; each consumer group
//! gets its own `StreamConsumer`.
//!
//! [`BrokerConnection`]: crate::connection::BrokerConnection

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::{Header, Headers as _, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::Message;
use tracing::info;

use crate::broker::{ConsumerStream, InboundMessage, MessageBroker, OutboundMessage, ProducerHandle};
use crate::config::MessagingConfig;
use crate::{MessageError, MessageResult};

/// Per-message delivery timeout.
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// How long to wait for in-flight deliveries on disconnect.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(30);

/// Broker client for a Kafka cluster.
pub struct KafkaBroker {
    config: MessagingConfig,
}

impl KafkaBroker {
    pub fn new(config: MessagingConfig) -> Self {
        Self { config }
    }

    fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", self.config.brokers.join(","))
            .set("client.id", &self.config.client_id);
        config
    }
}

#[async_trait]
impl MessageBroker for KafkaBroker {
    async fn create_producer(&self) -> MessageResult<Box<dyn ProducerHandle>> {
        let producer: FutureProducer = self
            .client_config()
            .set("message.timeout.ms", "5000")
            .create()
            .map_err(|e| MessageError::Connection(format!("Failed to create producer: {}", e)))?;

        info!("Connected Kafka producer as {}", self.config.client_id);
        Ok(Box::new(KafkaProducerHandle { producer }))
    }

    async fn create_consumer(
        &self,
        group_id: &str,
        topic: &str,
        from_beginning: bool,
    ) -> MessageResult<Box<dyn ConsumerStream>> {
        let consumer: StreamConsumer = self
            .client_config()
            .set("group.id", group_id)
            .set("enable.auto.commit", "true")
            .set("auto.offset.reset", if from_beginning { "earliest" } else { "latest" })
            .create()
            .map_err(|e| {
                MessageError::Subscription(format!(
                    "Failed to create consumer for group {}: {}",
                    group_id, e
                ))
            })?;

        consumer.subscribe(&[topic]).map_err(|e| {
            MessageError::Subscription(format!(
                "Failed to subscribe group {} to {}: {}",
                group_id, topic, e
            ))
        })?;

        info!("Attached Kafka consumer group {} to topic {}", group_id, topic);
        Ok(Box::new(KafkaConsumerStream { consumer }))
    }
}

struct KafkaProducerHandle {
    producer: FutureProducer,
}

#[async_trait]
impl ProducerHandle for KafkaProducerHandle {
    async fn send(&self, topic: &str, message: OutboundMessage) -> MessageResult<()> {
        let mut record = FutureRecord::<String, [u8]>::to(topic).payload(message.payload.as_ref());

        if let Some(key) = &message.key {
            record = record.key(key);
        }

        if !message.headers.is_empty() {
            let mut headers = OwnedHeaders::new_with_capacity(message.headers.len());
            for (key, value) in &message.headers {
                headers = headers.insert(Header {
                    key,
                    value: Some(value.as_bytes()),
                });
            }
            record = record.headers(headers);
        }

        self.producer
            .send(record, DELIVERY_TIMEOUT)
            .await
            .map(|_| ())
            .map_err(|(e, _)| {
                MessageError::Connection(format!("Failed to deliver message to {}: {}", topic, e))
            })
    }

    async fn disconnect(&self) -> MessageResult<()> {
        self.producer
            .flush(FLUSH_TIMEOUT)
            .map_err(|e| MessageError::Shutdown(format!("Failed to flush producer: {}", e)))
    }
}

struct KafkaConsumerStream {
    consumer: StreamConsumer,
}

#[async_trait]
impl ConsumerStream for KafkaConsumerStream {
    async fn next_message(&mut self) -> MessageResult<Option<InboundMessage>> {
        let message = self
            .consumer
            .recv()
            .await
            .map_err(|e| MessageError::Connection(format!("Failed to receive message: {}", e)))?;

        let payload = message
            .payload()
            .map(Bytes::copy_from_slice)
            .unwrap_or_default();

        let mut headers = HashMap::new();
        if let Some(borrowed) = message.headers() {
            for header in borrowed.iter() {
                if let Some(value) = header.value {
                    headers.insert(
                        header.key.to_string(),
                        String::from_utf8_lossy(value).into_owned(),
                    );
                }
            }
        }

        Ok(Some(InboundMessage {
            payload,
            headers,
        }))
    }
}
