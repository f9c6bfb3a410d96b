//! Queue declaration and routing-key bindings

use crate::connection::ConnectionManager;
use crate::{BusError, BusResult};
use std::sync::Arc;
use tracing::{error, info};

/// A queue and the routing-key patterns it should receive
///
/// Only describes what to declare; the broker holds the bindings afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub queue_name: String,
    pub routing_keys: Vec<String>,
}

impl QueueBinding {
    pub fn new<I, S>(queue_name: impl Into<String>, routing_keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            queue_name: queue_name.into(),
            routing_keys: routing_keys.into_iter().map(Into::into).collect(),
        }
    }
}

/// Declares queues and binds them to the bus exchange
#[derive(Debug, Clone)]
pub struct Topology {
    connection: Arc<ConnectionManager>,
}

impl Topology {
    pub fn new(connection: Arc<ConnectionManager>) -> Self {
        Self { connection }
    }

    /// Declare the queue, then bind it under each routing key in order
    ///
    /// Bindings created before a failure stay in place. Declaring and binding
    /// are idempotent on the broker, so the whole call can simply be repeated.
    pub async fn declare_and_bind(&self, binding: &QueueBinding) -> BusResult<()> {
        let channel = self.connection.ensure_connected().await?;
        let config = self.connection.config();
        let queue = binding.queue_name.as_str();

        if let Err(e) = channel.declare_queue(queue, config.durable).await {
            let err = BusError::Topology {
                queue: queue.to_string(),
                routing_key: None,
                reason: e.to_string(),
            };
            error!(queue = %queue, durable = config.durable, error = %err, "Failed to declare queue");
            return Err(err);
        }

        for routing_key in &binding.routing_keys {
            if let Err(e) = channel
                .bind_queue(queue, &config.exchange_name, routing_key)
                .await
            {
                let err = BusError::Topology {
                    queue: queue.to_string(),
                    routing_key: Some(routing_key.clone()),
                    reason: e.to_string(),
                };
                error!(
                    queue = %queue,
                    exchange = %config.exchange_name,
                    routing_key = %routing_key,
                    error = %err,
                    "Failed to bind queue"
                );
                return Err(err);
            }

            info!(
                queue = %queue,
                exchange = %config.exchange_name,
                routing_key = %routing_key,
                "Queue bound to routing key"
            );
        }

        Ok(())
    }
}
