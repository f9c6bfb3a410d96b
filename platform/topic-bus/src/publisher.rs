//! Publishing envelopes to the bus exchange

use crate::connection::ConnectionManager;
use crate::envelope::encode;
use crate::{BusError, BusResult};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info};

/// Publishes messages to the configured topic exchange
///
/// Fire-and-forget: success means the message was handed to the channel,
/// not that the broker stored it. There are no publisher confirms.
#[derive(Debug, Clone)]
pub struct Publisher {
    connection: Arc<ConnectionManager>,
}

impl Publisher {
    pub fn new(connection: Arc<ConnectionManager>) -> Self {
        Self { connection }
    }

    /// Wrap `data` as `{ "data": ... }` and publish it under `routing_key`
    ///
    /// The routing key is passed to the broker verbatim.
    pub async fn publish<T: Serialize + ?Sized>(&self, routing_key: &str, data: &T) -> BusResult<()> {
        let payload = encode(data)?;
        let channel = self.connection.ensure_connected().await?;
        let exchange = &self.connection.config().exchange_name;

        if let Err(e) = channel.publish(exchange, routing_key, payload).await {
            let err = BusError::Publish {
                routing_key: routing_key.to_string(),
                reason: e.to_string(),
            };
            error!(
                exchange = %exchange,
                routing_key = %routing_key,
                error = %err,
                "Failed to publish event"
            );
            return Err(err);
        }

        info!(exchange = %exchange, routing_key = %routing_key, "Published event");
        Ok(())
    }
}
