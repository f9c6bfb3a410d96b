//! # Topic Bus
//!
//! A RabbitMQ topic-exchange client shared by every module that produces or
//! consumes platform events.
//!
//! ## What It Does
//!
//! - Owns one broker connection carrying exactly one channel
//! - Declares the platform topic exchange and applies the prefetch window
//! - Declares queues and binds them to routing-key patterns
//! - Consumes with explicit ack, rejecting failed deliveries with requeue
//! - Publishes `{ "data": ... }` envelopes to routing keys
//!
//! Staging and production deployments connect over mutual TLS; the
//! certificate, key and CA bundle must all be present or connecting fails.
//!
//! ## Implementations
//!
//! - **AmqpBroker**: Production implementation using `lapin`
//! - **InMemoryBroker**: Test/dev implementation with topic-exchange routing in process
//!
//! ## Usage
//!
//! ```rust
//! use topic_bus::{BusConfig, InMemoryBroker, TopicBus};
//! use serde_json::{json, Value};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = BusConfig::new("amqp://localhost:5672/%2f", "smp-events");
//! let bus = TopicBus::new(config, Arc::new(InMemoryBroker::new()));
//!
//! bus.declare_and_bind("org-queue", ["rk.organization.organization.created"])
//!     .await?;
//!
//! let consumer = bus
//!     .consume("org-queue", |routing_key: String, payload: Value| async move {
//!         println!("{routing_key}: {payload}");
//!         Ok(())
//!     })
//!     .await?;
//!
//! bus.publish(
//!     "rk.organization.organization.created",
//!     &json!({ "id": 42, "name": "Acme" }),
//! )
//! .await?;
//!
//! bus.close().await?;
//! let stats = consumer.wait().await;
//! # let _ = stats;
//! # Ok(())
//! # }
//! ```

mod amqp_broker;
mod broker;
mod bus;
mod config;
mod connection;
mod consumer;
mod envelope;
mod inmemory_broker;
mod publisher;
mod topology;
mod transport;

pub mod retry;

pub use amqp_broker::AmqpBroker;
pub use broker::{Broker, BrokerError, BrokerSession, Delivery, DeliveryStream, DeliveryTag};
pub use bus::TopicBus;
pub use config::BusConfig;
pub use connection::{ConnectionManager, ConnectionState};
pub use consumer::{
    AlwaysRequeue, ConsumeStats, Consumer, ConsumerHandle, Disposition, RedeliveryPolicy,
    RequeueOnce,
};
pub use envelope::{decode, encode, Envelope};
pub use inmemory_broker::{AckEvent, InMemoryBroker};
pub use publisher::Publisher;
pub use topology::{QueueBinding, Topology};
pub use transport::{
    resolve_transport, Credentials, DeploymentEnv, FileSource, MaterialSource, TlsMaterial,
    TransportSettings,
};

/// Errors surfaced by the bus to its callers
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// Required deployment configuration is missing or unreadable. Not retryable.
    #[error("configuration error ({artifact}): {reason}")]
    Configuration { artifact: String, reason: String },

    #[error("connection error: {0}")]
    Connect(String),

    #[error("topology error on queue '{queue}'{}: {reason}", routing_key.as_deref().map(|rk| format!(" (routing key '{rk}')")).unwrap_or_default())]
    Topology {
        queue: String,
        routing_key: Option<String>,
        reason: String,
    },

    #[error("failed to consume from queue '{queue}': {reason}")]
    Consume { queue: String, reason: String },

    #[error("failed to publish to routing key '{routing_key}': {reason}")]
    Publish { routing_key: String, reason: String },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("close error: {0}")]
    Close(String),
}

impl BusError {
    pub(crate) fn configuration(artifact: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Configuration {
            artifact: artifact.into(),
            reason: reason.into(),
        }
    }
}

/// Result type for bus operations
pub type BusResult<T> = Result<T, BusError>;

/// Error returned by a consumer handler
///
/// Handler failures never escape the consume loop; they turn into a reject
/// of the delivery (see [`RedeliveryPolicy`]).
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;
