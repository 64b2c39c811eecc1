//! Broker connection settings

use anyhow::Result;
use serde::{Deserialize, Serialize};

const DEFAULT_BROKER: &str = "localhost:9092";
const DEFAULT_CLIENT_ID: &str = "keepsake-backend";
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;

/// Settings shared by every channel the client opens.
///
/// The client id seeds every derived topic and consumer-group name
/// (`<client_id>-replies`, `<client_id>-<topic>-sub`, and so on), so two
/// services sharing a broker must use distinct client ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagingConfig {
    pub brokers: Vec<String>,
    pub client_id: String,
    /// Default wait for request/reply calls, in milliseconds.
    pub request_timeout_ms: u64,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            brokers: vec![DEFAULT_BROKER.to_string()],
            client_id: DEFAULT_CLIENT_ID.to_string(),
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
        }
    }
}

impl MessagingConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            brokers: std::env::var("KAFKA_BROKERS")
                .unwrap_or_else(|_| DEFAULT_BROKER.to_string())
                .split(',')
                .map(|broker| broker.trim().to_string())
                .collect(),
            client_id: std::env::var("KAFKA_CLIENT_ID")
                .unwrap_or_else(|_| DEFAULT_CLIENT_ID.to_string()),
            request_timeout_ms: std::env::var("KAFKA_REQUEST_TIMEOUT_MS")
                .unwrap_or_else(|_| DEFAULT_REQUEST_TIMEOUT_MS.to_string())
                .parse()?,
        })
    }
}
