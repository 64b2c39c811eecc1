//! Message broker client shared by Keepsake backend services
//!
//! Wraps the Kafka broker behind four interaction patterns:
//!
//! - fire-and-forget publish/subscribe ([`MessagingClient::publish`],
//!   [`MessagingClient::subscribe`])
//! - correlation-based request/reply ([`MessagingClient::send_request`],
//!   [`MessagingClient::reply_to`])
//! - consumer-group stream processing ([`MessagingClient::consume_stream`])
//! - change-data-capture propagation ([`MessagingClient::cdc_publish`],
//!   [`MessagingClient::cdc_consume`])
//!
//! A single shared producer handle is connected on first use and reused by
//! every publish; each consumer group gets exactly one long-lived receive
//! loop per process. [`MessagingClient::disconnect_all`] tears both down.
//!
//! ```rust,ignore
//! use messaging::{naming, MessagingClient, MessagingConfig};
//!
//! let client = MessagingClient::new(MessagingConfig::from_env()?);
//! let topic = naming::build_topic("family", "created", "memories", "photo");
//!
//! client.subscribe(&topic, |payload, _headers| async move {
//!     println!("received {:?}", payload);
//!     Ok(())
//! }).await?;
//!
//! client.publish(&topic, &serde_json::json!({ "id": 42 })).await?;
//! ```

pub mod broker;
pub mod cdc;
pub mod client;
pub mod config;
pub mod connection;
pub mod kafka;
pub mod memory;
pub mod naming;
pub mod payload;
pub mod request_reply;

pub use broker::{ConsumerStream, InboundMessage, MessageBroker, OutboundMessage, ProducerHandle};
pub use cdc::{CdcPayload, ChangeEvent, ChangeOperation};
pub use client::MessagingClient;
pub use config::MessagingConfig;
pub use connection::BrokerConnection;
pub use kafka::KafkaBroker;
pub use memory::MemoryBroker;
pub use payload::{DecodedPayload, Headers};
pub use request_reply::{CORRELATION_ID_HEADER, REPLY_TO_HEADER};

/// Message broker errors
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Subscription error: {0}")]
    Subscription(String),

    #[error("Request timed out after {0} ms")]
    RequestTimeout(u64),

    #[error("Shutdown error: {0}")]
    Shutdown(String),
}

pub type MessageResult<T> = Result<T, MessageError>;
