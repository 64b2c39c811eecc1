//! High-level messaging client
//!
//! The one type services construct. Every channel routes through the shared
//! [`BrokerConnection`] for handle reuse and through [`naming`] for derived
//! topic and group names. Cloning is cheap and shares the underlying
//! connection.
//!
//! [`naming`]: crate::naming

use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use tracing::warn;

use crate::broker::{MessageBroker, OutboundMessage};
use crate::cdc::{CdcPayload, ChangeEvent};
use crate::config::MessagingConfig;
use crate::connection::{BrokerConnection, MessageHandler};
use crate::kafka::KafkaBroker;
use crate::naming;
use crate::payload::{DecodedPayload, Headers};
use crate::request_reply::CorrelationTable;
use crate::{MessageError, MessageResult};

/// Messaging client shared by a service's request handlers and workers.
#[derive(Clone)]
pub struct MessagingClient {
    pub(crate) config: MessagingConfig,
    pub(crate) connection: Arc<BrokerConnection>,
    pub(crate) correlations: Arc<CorrelationTable>,
}

impl MessagingClient {
    /// Client backed by the Kafka cluster in `config`.
    pub fn new(config: MessagingConfig) -> Self {
        let broker = Arc::new(KafkaBroker::new(config.clone()));
        Self::with_broker(config, broker)
    }

    /// Client backed by a caller-supplied broker, for tests and local runs.
    pub fn with_broker(config: MessagingConfig, broker: Arc<dyn MessageBroker>) -> Self {
        Self {
            config,
            connection: Arc::new(BrokerConnection::new(broker)),
            correlations: Arc::new(CorrelationTable::new()),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.config.client_id
    }

    /// Publishes `message` as JSON to `topic`, fire and forget.
    ///
    /// Delivery is at-least-once; serialization and connection failures
    /// surface synchronously, everything after that is the broker's problem.
    pub async fn publish<T>(&self, topic: &str, message: &T) -> MessageResult<()>
    where
        T: Serialize + ?Sized,
    {
        self.publish_with_headers(topic, message, Headers::new()).await
    }

    pub(crate) async fn publish_with_headers<T>(
        &self,
        topic: &str,
        message: &T,
        headers: Headers,
    ) -> MessageResult<()>
    where
        T: Serialize + ?Sized,
    {
        let payload = serde_json::to_vec(message).map_err(|e| {
            MessageError::Serialization(format!("Failed to serialize message for {}: {}", topic, e))
        })?;

        let producer = self.connection.producer().await?;
        producer
            .send(
                topic,
                OutboundMessage::new(Bytes::from(payload)).with_headers(headers),
            )
            .await
    }

    /// Runs `handler` for every message delivered to `topic`.
    ///
    /// The consumer group is derived from the client id, so all `subscribe`
    /// calls for one topic in a process collapse onto a single loop: the
    /// first handler wins and later calls are no-ops. Callers that need
    /// independent delivery should use [`consume_stream`] with their own
    /// group ids.
    ///
    /// [`consume_stream`]: MessagingClient::consume_stream
    pub async fn subscribe<F, Fut>(&self, topic: &str, handler: F) -> MessageResult<()>
    where
        F: Fn(DecodedPayload, Headers) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let group_id = naming::subscriber_group(&self.config.client_id, topic);
        let created = self
            .connection
            .get_or_create_consumer(&group_id, topic, wrap_handler(handler))
            .await?;

        if !created {
            warn!(
                "subscribe on {} reuses consumer group {}; the handler registered first keeps \
                 receiving, use consume_stream with a distinct group id for independent delivery",
                topic, group_id
            );
        }
        Ok(())
    }

    /// Attaches the caller-chosen consumer group `group_id` to `topic`.
    ///
    /// Distinct groups each receive every message; registering the same
    /// group twice is a no-op.
    pub async fn consume_stream<F, Fut>(
        &self,
        topic: &str,
        group_id: &str,
        handler: F,
    ) -> MessageResult<()>
    where
        F: Fn(DecodedPayload, Headers) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.connection
            .get_or_create_consumer(group_id, topic, wrap_handler(handler))
            .await
            .map(|_| ())
    }

    /// Publishes a database change event to `topic`.
    pub async fn cdc_publish<T: Serialize>(
        &self,
        topic: &str,
        event: &ChangeEvent<T>,
    ) -> MessageResult<()> {
        self.publish(topic, event).await
    }

    /// Consumes database change events from `topic` under `group_id`.
    ///
    /// Payloads that do not parse as a change envelope reach the handler as
    /// [`CdcPayload::Raw`], the same fallback every other consumer applies.
    pub async fn cdc_consume<F, Fut>(
        &self,
        topic: &str,
        group_id: &str,
        handler: F,
    ) -> MessageResult<()>
    where
        F: Fn(CdcPayload, Headers) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.consume_stream(topic, group_id, move |payload, headers| {
            handler(CdcPayload::from(payload), headers)
        })
        .await
    }

    /// Disconnects the shared producer and every consumer loop.
    ///
    /// Pending request/reply calls fail over to a connection error rather
    /// than waiting out their timeouts. Idempotent.
    pub async fn disconnect_all(&self) -> MessageResult<()> {
        self.correlations.clear();
        self.connection.disconnect_all().await
    }

    /// Number of requests currently awaiting replies.
    pub fn in_flight(&self) -> usize {
        self.correlations.len()
    }
}

pub(crate) fn wrap_handler<F, Fut>(handler: F) -> MessageHandler
where
    F: Fn(DecodedPayload, Headers) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |payload, headers| Box::pin(handler(payload, headers)))
}
