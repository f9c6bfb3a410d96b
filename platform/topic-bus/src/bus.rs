use crate::broker::Broker;
use crate::config::BusConfig;
use crate::connection::{ConnectionManager, ConnectionState};
use crate::consumer::{Consumer, ConsumerHandle, RedeliveryPolicy};
use crate::publisher::Publisher;
use crate::topology::{QueueBinding, Topology};
use crate::transport::MaterialSource;
use crate::{BusResult, HandlerError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;

/// One bus handle: topology, consumer and publisher over a shared connection
///
/// Cloning is cheap and every clone shares the same connection and channel.
#[derive(Debug, Clone)]
pub struct TopicBus {
    connection: Arc<ConnectionManager>,
    topology: Topology,
    consumer: Consumer,
    publisher: Publisher,
}

impl TopicBus {
    pub fn new(config: BusConfig, broker: Arc<dyn Broker>) -> Self {
        Self::from_connection(Arc::new(ConnectionManager::new(config, broker)))
    }

    /// Build the bus with a custom byte source for TLS artifacts
    pub fn with_material_source(
        config: BusConfig,
        broker: Arc<dyn Broker>,
        source: Arc<dyn MaterialSource>,
    ) -> Self {
        Self::from_connection(Arc::new(ConnectionManager::with_material_source(
            config, broker, source,
        )))
    }

    fn from_connection(connection: Arc<ConnectionManager>) -> Self {
        Self {
            topology: Topology::new(Arc::clone(&connection)),
            consumer: Consumer::new(Arc::clone(&connection)),
            publisher: Publisher::new(Arc::clone(&connection)),
            connection,
        }
    }

    /// Replace the default [`crate::AlwaysRequeue`] policy for consumers started afterwards
    pub fn with_redelivery_policy(mut self, policy: Arc<dyn RedeliveryPolicy>) -> Self {
        self.consumer = self.consumer.with_policy(policy);
        self
    }

    pub fn config(&self) -> Arc<BusConfig> {
        self.connection.shared_config()
    }

    pub async fn connect(&self) -> BusResult<()> {
        self.connection.connect().await
    }

    pub async fn close(&self) -> BusResult<()> {
        self.connection.close().await
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.subscribe_state()
    }

    /// Declare `queue` and bind it to the exchange under each routing key
    pub async fn declare_and_bind<I, S>(&self, queue: &str, routing_keys: I) -> BusResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.declare_binding(&QueueBinding::new(queue, routing_keys)).await
    }

    pub async fn declare_binding(&self, binding: &QueueBinding) -> BusResult<()> {
        self.topology.declare_and_bind(binding).await
    }

    pub async fn consume<T, H, Fut>(&self, queue: &str, handler: H) -> BusResult<ConsumerHandle>
    where
        T: DeserializeOwned + Send + 'static,
        H: Fn(String, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.consumer.consume(queue, handler).await
    }

    pub async fn publish<T: Serialize + ?Sized>(&self, routing_key: &str, data: &T) -> BusResult<()> {
        self.publisher.publish(routing_key, data).await
    }
}
