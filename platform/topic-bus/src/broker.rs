//! Broker seam: one connection carrying one channel
//!
//! [`crate::ConnectionManager`] is the only caller of these traits. It wraps
//! the session in a mutex so implementations never see concurrent channel
//! operations.

use crate::transport::TlsMaterial;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::fmt;

/// Opaque per-channel handle identifying one delivery for ack/nack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeliveryTag(pub u64);

impl fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One message handed to a consumer
#[derive(Debug, Clone)]
pub struct Delivery {
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub delivery_tag: DeliveryTag,
    /// Set by the broker when this message was requeued at least once
    pub redelivered: bool,
}

/// Stream of deliveries for one consumer; ends when the channel closes
pub type DeliveryStream = BoxStream<'static, Result<Delivery, BrokerError>>;

/// Failure reported by a broker implementation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct BrokerError(pub String);

impl BrokerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Opens sessions against a broker
#[async_trait]
pub trait Broker: Send + Sync {
    /// Open a connection and exactly one channel on it
    ///
    /// `tls` is `Some` in secured deployments and is consumed by the call.
    async fn open(
        &self,
        url: &str,
        tls: Option<TlsMaterial>,
    ) -> Result<Box<dyn BrokerSession>, BrokerError>;
}

/// An open connection with its single channel
#[async_trait]
pub trait BrokerSession: Send + Sync {
    async fn declare_topic_exchange(&self, name: &str, durable: bool) -> Result<(), BrokerError>;

    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError>;

    async fn declare_queue(&self, name: &str, durable: bool) -> Result<(), BrokerError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    async fn consume(&self, queue: &str, consumer_tag: &str)
        -> Result<DeliveryStream, BrokerError>;

    async fn ack(&self, tag: DeliveryTag) -> Result<(), BrokerError>;

    async fn nack(&self, tag: DeliveryTag, requeue: bool) -> Result<(), BrokerError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
    ) -> Result<(), BrokerError>;

    async fn close_channel(&self) -> Result<(), BrokerError>;

    async fn close_connection(&self) -> Result<(), BrokerError>;

    /// True while both the connection and the channel are usable
    fn is_open(&self) -> bool;
}

impl fmt::Debug for dyn Broker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Broker")
    }
}

impl fmt::Debug for dyn BrokerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BrokerSession")
    }
}
