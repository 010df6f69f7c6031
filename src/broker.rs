//! Message broker port.
//!
//! The core only depends on this trait; the broker itself (connection
//! lifecycle, reconnects, topology) is owned by the caller and passed in
//! explicitly. Delivery is at-least-once: a timed-out publish may have
//! reached the broker, so consumers deduplicate on `event_id`.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::info;

/// Failure of a single publish attempt. Contained inside the relay, never
/// surfaced to command callers.
#[derive(Debug, Clone, Error)]
pub enum PublishError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("broker rejected message: {0}")]
    Nack(String),

    #[error("publish timed out after {0} ms")]
    Timeout(u64),
}

/// Publish port implemented by broker clients.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish a payload under a routing key. `Ok(())` means the broker
    /// acknowledged the message.
    async fn publish(&self, routing_key: &str, payload: &Value) -> Result<(), PublishError>;
}

/// Development broker that logs every publish and acknowledges it.
/// Lets the relay run end-to-end without a broker deployment.
pub struct LogBroker;

#[async_trait]
impl Broker for LogBroker {
    async fn publish(&self, routing_key: &str, payload: &Value) -> Result<(), PublishError> {
        info!(routing_key, %payload, "publish");
        Ok(())
    }
}
