//! Correlation-based request/reply over the broker
//!
//! Every request carries a fresh correlation id and the name of the reply
//! topic all of this client's replies funnel through. One shared reply
//! listener serves every request topic; the correlation table maps ids to
//! the callers still waiting.
//!
//! A pending entry resolves exactly once: either the reply listener
//! completes it or the caller's timeout abandons it. Removal from the table
//! under its lock is the single mutation point deciding that race, so a
//! reply arriving after the timeout finds no entry and is dropped without
//! error.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

use crate::client::MessagingClient;
use crate::naming;
use crate::payload::{DecodedPayload, Headers};
use crate::{MessageError, MessageResult};

/// Header carrying the per-request correlation token.
pub const CORRELATION_ID_HEADER: &str = "correlationId";

/// Header naming the topic the reply must be published to.
pub const REPLY_TO_HEADER: &str = "replyTo";

/// Requests awaiting replies, keyed by correlation id.
pub(crate) struct CorrelationTable {
    pending: Mutex<HashMap<String, oneshot::Sender<DecodedPayload>>>,
}

impl CorrelationTable {
    pub(crate) fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, oneshot::Sender<DecodedPayload>>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers a pending entry and returns the waiter's end.
    fn insert(&self, correlation_id: &str) -> oneshot::Receiver<DecodedPayload> {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(correlation_id.to_string(), tx);
        rx
    }

    /// Completes a pending entry. Returns false when no entry matches, which
    /// is the late-reply-after-timeout case.
    fn complete(&self, correlation_id: &str, reply: DecodedPayload) -> bool {
        match self.lock().remove(correlation_id) {
            Some(waiter) => {
                // The waiter may have been dropped between timeout and
                // removal; a failed send is equivalent to a late reply.
                let _ = waiter.send(reply);
                true
            }
            None => false,
        }
    }

    /// Removes a pending entry without fulfilling it.
    fn abandon(&self, correlation_id: &str) {
        self.lock().remove(correlation_id);
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    pub(crate) fn clear(&self) {
        self.lock().clear();
    }
}

impl MessagingClient {
    /// Sends `message` to `topic` and waits for the correlated reply, using
    /// the configured default timeout.
    pub async fn send_request<T>(&self, topic: &str, message: &T) -> MessageResult<DecodedPayload>
    where
        T: Serialize + ?Sized,
    {
        let timeout = Duration::from_millis(self.config.request_timeout_ms);
        self.send_request_with_timeout(topic, message, timeout).await
    }

    /// Sends `message` to `topic` and waits up to `timeout` for the reply.
    ///
    /// Concurrent calls are independent: each suspends only its own caller,
    /// and replies are matched by correlation id, not arrival order.
    pub async fn send_request_with_timeout<T>(
        &self,
        topic: &str,
        message: &T,
        timeout: Duration,
    ) -> MessageResult<DecodedPayload>
    where
        T: Serialize + ?Sized,
    {
        self.ensure_reply_listener().await?;

        let correlation_id = Uuid::new_v4().to_string();
        // Registered before publishing so a reply can never beat the entry.
        let receiver = self.correlations.insert(&correlation_id);

        let mut headers = Headers::new();
        headers.insert(CORRELATION_ID_HEADER.to_string(), correlation_id.clone());
        headers.insert(
            REPLY_TO_HEADER.to_string(),
            naming::reply_topic(&self.config.client_id),
        );

        if let Err(e) = self.publish_with_headers(topic, message, headers).await {
            self.correlations.abandon(&correlation_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(MessageError::Connection(
                "reply listener shut down before a reply arrived".to_string(),
            )),
            Err(_) => {
                self.correlations.abandon(&correlation_id);
                Err(MessageError::RequestTimeout(timeout.as_millis() as u64))
            }
        }
    }

    /// Serves requests on `topic`: the handler's output is published back to
    /// each requester's reply topic under the request's correlation id.
    ///
    /// Messages missing the request headers are ignored; they are not
    /// requests. A handler failure produces no reply, so the requester runs
    /// into its own timeout.
    pub async fn reply_to<F, Fut>(&self, topic: &str, handler: F) -> MessageResult<()>
    where
        F: Fn(DecodedPayload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<serde_json::Value>> + Send + 'static,
    {
        let group_id = naming::replier_group(&self.config.client_id, topic);
        let client = self.clone();
        let handler = Arc::new(handler);

        let wrapped: crate::connection::MessageHandler =
            Arc::new(move |payload, headers: Headers| {
                let client = client.clone();
                let handler = Arc::clone(&handler);
                Box::pin(async move {
                    let (correlation_id, reply_topic) = match (
                        headers.get(CORRELATION_ID_HEADER),
                        headers.get(REPLY_TO_HEADER),
                    ) {
                        (Some(correlation_id), Some(reply_topic)) => {
                            (correlation_id.clone(), reply_topic.clone())
                        }
                        _ => {
                            debug!("Ignoring message without request headers");
                            return Ok(());
                        }
                    };

                    let reply = (*handler)(payload).await?;

                    let mut reply_headers = Headers::new();
                    reply_headers.insert(CORRELATION_ID_HEADER.to_string(), correlation_id);
                    client
                        .publish_with_headers(&reply_topic, &reply, reply_headers)
                        .await?;
                    Ok(())
                })
            });

        self.connection
            .get_or_create_consumer(&group_id, topic, wrapped)
            .await
            .map(|_| ())
    }

    /// Registers the shared reply listener; a no-op after the first call.
    async fn ensure_reply_listener(&self) -> MessageResult<()> {
        let topic = naming::reply_topic(&self.config.client_id);
        let group_id = naming::reply_group(&self.config.client_id);
        let correlations = Arc::clone(&self.correlations);

        let handler: crate::connection::MessageHandler =
            Arc::new(move |payload, headers: Headers| {
                let correlations = Arc::clone(&correlations);
                Box::pin(async move {
                    match headers.get(CORRELATION_ID_HEADER) {
                        Some(correlation_id) => {
                            if !correlations.complete(correlation_id, payload) {
                                debug!("Dropping reply with no pending request: {}", correlation_id);
                            }
                        }
                        None => debug!("Dropping reply without a correlation id header"),
                    }
                    Ok(())
                })
            });

        self.connection
            .get_or_create_consumer(&group_id, &topic, handler)
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MessageBroker;
    use crate::config::MessagingConfig;
    use crate::memory::MemoryBroker;
    use serde_json::json;

    fn test_client() -> (MessagingClient, Arc<MemoryBroker>) {
        let broker = Arc::new(MemoryBroker::new());
        let config = MessagingConfig {
            client_id: "keepsake-api".to_string(),
            ..MessagingConfig::default()
        };
        let client = MessagingClient::with_broker(config, Arc::clone(&broker) as Arc<dyn MessageBroker>);
        (client, broker)
    }

    fn sum_handler(payload: DecodedPayload) -> impl Future<Output = anyhow::Result<serde_json::Value>> {
        async move {
            let request = payload
                .as_json()
                .ok_or_else(|| anyhow::anyhow!("expected a JSON request"))?;
            let a = request["a"].as_i64().unwrap_or(0);
            let b = request["b"].as_i64().unwrap_or(0);
            Ok(json!(a + b))
        }
    }

    #[tokio::test]
    async fn request_reply_round_trip() {
        let (client, _broker) = test_client();
        let topic = naming::build_topic("family", "request", "planner", "sum");

        client.reply_to(&topic, sum_handler).await.unwrap();

        let reply = client.send_request(&topic, &json!({"a": 2, "b": 3})).await.unwrap();
        assert_eq!(reply, DecodedPayload::Json(json!(5)));
        assert_eq!(client.in_flight(), 0);
    }

    #[tokio::test]
    async fn concurrent_requests_resolve_to_their_own_replies() {
        let (client, _broker) = test_client();
        let topic = naming::build_topic("family", "request", "planner", "sum");

        client.reply_to(&topic, sum_handler).await.unwrap();

        let first = {
            let client = client.clone();
            let topic = topic.clone();
            tokio::spawn(async move { client.send_request(&topic, &json!({"a": 1, "b": 1})).await })
        };
        let second = {
            let client = client.clone();
            let topic = topic.clone();
            tokio::spawn(async move { client.send_request(&topic, &json!({"a": 10, "b": 20})).await })
        };

        assert_eq!(first.await.unwrap().unwrap(), DecodedPayload::Json(json!(2)));
        assert_eq!(second.await.unwrap().unwrap(), DecodedPayload::Json(json!(30)));
        assert_eq!(client.in_flight(), 0);
    }

    #[tokio::test]
    async fn request_without_replier_times_out_and_cleans_up() {
        let (client, _broker) = test_client();
        let topic = naming::build_topic("family", "request", "planner", "noone");

        let result = client
            .send_request_with_timeout(&topic, &json!({"a": 1}), Duration::from_millis(50))
            .await;

        match result {
            Err(MessageError::RequestTimeout(ms)) => assert_eq!(ms, 50),
            other => panic!("expected a timeout, got {:?}", other),
        }
        assert_eq!(client.in_flight(), 0);
    }

    #[tokio::test]
    async fn late_reply_after_timeout_is_dropped_silently() {
        let (client, _broker) = test_client();
        let topic = naming::build_topic("family", "request", "planner", "slow");

        client
            .reply_to(&topic, |_payload| async move {
                tokio::time::sleep(Duration::from_millis(150)).await;
                Ok(json!("too late"))
            })
            .await
            .unwrap();

        let result = client
            .send_request_with_timeout(&topic, &json!({"q": 1}), Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(MessageError::RequestTimeout(_))));
        assert_eq!(client.in_flight(), 0);

        // Let the late reply land; the listener must drop it without fuss
        // and keep serving new requests.
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(client.in_flight(), 0);

        let reply = client
            .send_request_with_timeout(&topic, &json!({"q": 2}), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(reply, DecodedPayload::Json(json!("too late")));
    }

    #[tokio::test]
    async fn non_request_messages_on_a_replied_topic_are_ignored() {
        let (client, broker) = test_client();
        let topic = naming::build_topic("family", "request", "planner", "sum");

        client.reply_to(&topic, sum_handler).await.unwrap();

        // No correlation headers: the replier must not answer this one.
        client.publish(&topic, &json!({"a": 1, "b": 2})).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(broker.delivered(&naming::reply_topic("keepsake-api")), 0);
    }

    #[tokio::test]
    async fn reply_listener_is_registered_once_across_topics() {
        let (client, broker) = test_client();
        let first = naming::build_topic("family", "request", "planner", "sum");
        let second = naming::build_topic("family", "request", "wishlist", "lookup");

        client.reply_to(&first, sum_handler).await.unwrap();
        client.reply_to(&second, sum_handler).await.unwrap();

        client.send_request(&first, &json!({"a": 1, "b": 2})).await.unwrap();
        client.send_request(&second, &json!({"a": 3, "b": 4})).await.unwrap();

        assert_eq!(broker.consumers_created(&naming::reply_group("keepsake-api")), 1);
    }
}
