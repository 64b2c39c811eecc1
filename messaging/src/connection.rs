//! Shared broker connection
//!
//! Owns the one producer handle every publish goes through and the registry
//! of live consumer loops, keyed by consumer-group id. Registration is
//! idempotent: at most one receive loop exists per group id in a process,
//! no matter how many call sites ask for it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::broker::{ConsumerStream, InboundMessage, MessageBroker, ProducerHandle};
use crate::payload::{DecodedPayload, Headers};
use crate::{MessageError, MessageResult};

/// Pause before polling again after a transient receive error.
const RECEIVE_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Handler invoked for every message delivered to a consumer group.
pub type MessageHandler =
    Arc<dyn Fn(DecodedPayload, Headers) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

struct ConsumerEntry {
    topic: String,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Process-wide broker state: the shared producer and the consumer registry.
pub struct BrokerConnection {
    broker: Arc<dyn MessageBroker>,
    producer: Mutex<Option<Arc<dyn ProducerHandle>>>,
    consumers: Mutex<HashMap<String, ConsumerEntry>>,
}

impl BrokerConnection {
    pub fn new(broker: Arc<dyn MessageBroker>) -> Self {
        Self {
            broker,
            producer: Mutex::new(None),
            consumers: Mutex::new(HashMap::new()),
        }
    }

    /// The shared producer, connected on first use.
    ///
    /// Connection failure surfaces to the caller of the operation that
    /// triggered it; a later call retries the connection.
    pub async fn producer(&self) -> MessageResult<Arc<dyn ProducerHandle>> {
        let mut guard = self.producer.lock().await;
        if let Some(producer) = guard.as_ref() {
            return Ok(Arc::clone(producer));
        }

        let producer: Arc<dyn ProducerHandle> = Arc::from(self.broker.create_producer().await?);
        *guard = Some(Arc::clone(&producer));
        Ok(producer)
    }

    /// Registers a receive loop for `group_id` on `topic`, starting from the
    /// earliest available offset so late joiners do not miss history.
    ///
    /// Returns `false` without touching the broker when the group already
    /// has a live loop. The registry lock is held across creation, so two
    /// racing calls for the same group still yield exactly one loop.
    pub async fn get_or_create_consumer(
        &self,
        group_id: &str,
        topic: &str,
        handler: MessageHandler,
    ) -> MessageResult<bool> {
        let mut consumers = self.consumers.lock().await;
        if consumers.contains_key(group_id) {
            return Ok(false);
        }

        let stream = self.broker.create_consumer(group_id, topic, true).await?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_consumer_loop(
            stream,
            group_id.to_string(),
            handler,
            shutdown_rx,
        ));

        consumers.insert(
            group_id.to_string(),
            ConsumerEntry {
                topic: topic.to_string(),
                shutdown: shutdown_tx,
                task,
            },
        );
        info!("Registered consumer group {} on topic {}", group_id, topic);
        Ok(true)
    }

    /// Number of live consumer groups.
    pub async fn consumer_count(&self) -> usize {
        self.consumers.lock().await.len()
    }

    /// Disconnects the shared producer and every consumer loop.
    ///
    /// Safe to call with nothing connected and safe to call repeatedly. A
    /// failing disconnect never aborts the remaining cleanup; failures are
    /// collected and surfaced as one aggregate error.
    pub async fn disconnect_all(&self) -> MessageResult<()> {
        let mut failures = Vec::new();

        let producer = self.producer.lock().await.take();
        if let Some(producer) = producer {
            if let Err(e) = producer.disconnect().await {
                error!("Failed to disconnect producer: {}", e);
                failures.push(format!("producer: {}", e));
            } else {
                info!("Disconnected shared producer");
            }
        }

        let consumers = std::mem::take(&mut *self.consumers.lock().await);
        for (group_id, entry) in consumers {
            let _ = entry.shutdown.send(true);
            if let Err(e) = entry.task.await {
                error!("Consumer loop for group {} did not stop cleanly: {}", group_id, e);
                failures.push(format!("{}: {}", group_id, e));
            } else {
                info!("Disconnected consumer group {} from topic {}", group_id, entry.topic);
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(MessageError::Shutdown(failures.join("; ")))
        }
    }
}

/// Receive loop for one consumer group.
///
/// Runs until shut down or the stream ends. A handler failure is logged and
/// the loop moves to the next message; one poison message never kills the
/// group.
async fn run_consumer_loop(
    mut stream: Box<dyn ConsumerStream>,
    group_id: String,
    handler: MessageHandler,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            received = stream.next_message() => match received {
                Ok(Some(InboundMessage { payload, headers })) => {
                    let decoded = DecodedPayload::decode(&payload);
                    if let Err(e) = (*handler)(decoded, headers).await {
                        error!("Handler failed in consumer group {}: {:#}", group_id, e);
                    }
                }
                Ok(None) => {
                    info!("Message stream ended for consumer group {}", group_id);
                    break;
                }
                Err(e) => {
                    error!("Receive failed in consumer group {}: {}", group_id, e);
                    tokio::time::sleep(RECEIVE_RETRY_DELAY).await;
                }
            }
        }
    }
}
