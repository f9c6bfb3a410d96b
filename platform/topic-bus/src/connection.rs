//! Connection lifecycle and the serialized channel handle
//!
//! The manager is the only owner of the broker session. Components get a
//! [`Channel`] from [`ConnectionManager::ensure_connected`]; every call on it
//! takes the channel lock, so declares, binds, publishes and acks never
//! interleave on the wire.

use crate::broker::{Broker, BrokerError, BrokerSession, DeliveryStream, DeliveryTag};
use crate::config::BusConfig;
use crate::transport::{resolve_transport, FileSource, MaterialSource};
use crate::{BusError, BusResult};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn};

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Mutex-guarded handle to the single broker channel
#[derive(Clone)]
pub(crate) struct Channel {
    session: Arc<dyn BrokerSession>,
    lock: Arc<Mutex<()>>,
}

impl Channel {
    fn new(session: Box<dyn BrokerSession>) -> Self {
        Self {
            session: Arc::from(session),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.session.is_open()
    }

    /// True when both handles are clones of one channel
    fn same_channel(&self, other: &Channel) -> bool {
        Arc::ptr_eq(&self.lock, &other.lock)
    }

    pub(crate) async fn declare_topic_exchange(
        &self,
        name: &str,
        durable: bool,
    ) -> Result<(), BrokerError> {
        let _guard = self.lock.lock().await;
        self.session.declare_topic_exchange(name, durable).await
    }

    pub(crate) async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError> {
        let _guard = self.lock.lock().await;
        self.session.set_prefetch(count).await
    }

    pub(crate) async fn declare_queue(&self, name: &str, durable: bool) -> Result<(), BrokerError> {
        let _guard = self.lock.lock().await;
        self.session.declare_queue(name, durable).await
    }

    pub(crate) async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        let _guard = self.lock.lock().await;
        self.session.bind_queue(queue, exchange, routing_key).await
    }

    pub(crate) async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, BrokerError> {
        let _guard = self.lock.lock().await;
        self.session.consume(queue, consumer_tag).await
    }

    pub(crate) async fn ack(&self, tag: DeliveryTag) -> Result<(), BrokerError> {
        let _guard = self.lock.lock().await;
        self.session.ack(tag).await
    }

    pub(crate) async fn nack(&self, tag: DeliveryTag, requeue: bool) -> Result<(), BrokerError> {
        let _guard = self.lock.lock().await;
        self.session.nack(tag, requeue).await
    }

    pub(crate) async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
    ) -> Result<(), BrokerError> {
        let _guard = self.lock.lock().await;
        self.session.publish(exchange, routing_key, payload).await
    }

    /// Close the channel, then the connection
    ///
    /// Both steps always run; failures are logged and otherwise ignored.
    async fn shutdown(&self, endpoint: &str) {
        let _guard = self.lock.lock().await;

        if let Err(e) = self.session.close_channel().await {
            let err = BusError::Close(format!("channel: {e}"));
            warn!(endpoint = %endpoint, error = %err, "Error closing broker channel");
        }
        if let Err(e) = self.session.close_connection().await {
            let err = BusError::Close(format!("connection: {e}"));
            warn!(endpoint = %endpoint, error = %err, "Error closing broker connection");
        }
    }
}

/// Owns the broker connection and its one channel
///
/// `connect` is single-flight: concurrent callers wait on the same attempt
/// instead of opening their own connection. Nothing retries internally; a
/// failed connect leaves the manager disconnected and returns the error.
pub struct ConnectionManager {
    config: Arc<BusConfig>,
    broker: Arc<dyn Broker>,
    source: Arc<dyn MaterialSource>,
    lifecycle: Mutex<()>,
    channel: RwLock<Option<Channel>>,
    state: watch::Sender<ConnectionState>,
}

impl ConnectionManager {
    pub fn new(config: BusConfig, broker: Arc<dyn Broker>) -> Self {
        Self::with_material_source(config, broker, Arc::new(FileSource))
    }

    /// Use a custom byte source for TLS artifacts instead of the filesystem
    pub fn with_material_source(
        config: BusConfig,
        broker: Arc<dyn Broker>,
        source: Arc<dyn MaterialSource>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            config: Arc::new(config),
            broker,
            source,
            lifecycle: Mutex::new(()),
            channel: RwLock::new(None),
            state,
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub(crate) fn shared_config(&self) -> Arc<BusConfig> {
        Arc::clone(&self.config)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch lifecycle transitions
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// True while connected with an open connection and channel
    pub fn is_connected(&self) -> bool {
        self.live_channel().is_some()
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn current_channel(&self) -> Option<Channel> {
        self.channel
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn replace_channel(&self, channel: Option<Channel>) -> Option<Channel> {
        let mut slot = self.channel.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *slot, channel)
    }

    /// The channel, if the manager is connected and the session is still open
    ///
    /// A session that closed underneath us (broker restart, channel
    /// exception) moves the state back to `Disconnected`.
    fn live_channel(&self) -> Option<Channel> {
        if self.state() != ConnectionState::Connected {
            return None;
        }

        let channel = self.current_channel()?;
        if channel.is_open() {
            return Some(channel);
        }

        self.mark_lost(&channel);
        None
    }

    /// Move to `Disconnected` if `dead` is still the installed channel
    ///
    /// The slot is read-locked across the check and the state change, so a
    /// reconnect that already installed a newer channel is left untouched.
    fn mark_lost(&self, dead: &Channel) {
        let slot = self.channel.read().unwrap_or_else(PoisonError::into_inner);
        if !slot.as_ref().is_some_and(|current| current.same_channel(dead)) {
            return;
        }

        let lost = self.state.send_if_modified(|state| {
            if *state == ConnectionState::Connected {
                *state = ConnectionState::Disconnected;
                true
            } else {
                false
            }
        });
        drop(slot);

        if lost {
            warn!(
                endpoint = %self.config.broker_endpoint(),
                exchange = %self.config.exchange_name,
                "Connection to broker lost"
            );
        }
    }

    /// Connect if needed and hand out the channel
    pub(crate) async fn ensure_connected(&self) -> BusResult<Channel> {
        if let Some(channel) = self.live_channel() {
            return Ok(channel);
        }

        self.connect().await?;

        self.live_channel()
            .ok_or_else(|| BusError::Connect("connection closed during setup".to_string()))
    }

    /// Open the connection and channel, declare the exchange, apply prefetch
    ///
    /// No-op when already connected.
    pub async fn connect(&self) -> BusResult<()> {
        if self.is_connected() {
            return Ok(());
        }

        let _lifecycle = self.lifecycle.lock().await;

        // Another caller may have connected while we waited
        if self.is_connected() {
            return Ok(());
        }

        // Release whatever is left of a session that died underneath us
        if let Some(stale) = self.replace_channel(None) {
            stale.shutdown(&self.config.broker_endpoint()).await;
        }

        self.set_state(ConnectionState::Connecting);

        match self.open_channel().await {
            Ok(channel) => {
                self.replace_channel(Some(channel));
                self.set_state(ConnectionState::Connected);
                info!(
                    endpoint = %self.config.broker_endpoint(),
                    exchange = %self.config.exchange_name,
                    prefetch = self.config.prefetch_count,
                    secured = self.config.transport.environment.is_secured(),
                    "Connected to broker"
                );
                Ok(())
            }
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                error!(
                    endpoint = %self.config.broker_endpoint(),
                    exchange = %self.config.exchange_name,
                    error = %e,
                    "Failed to connect to broker"
                );
                Err(e)
            }
        }
    }

    async fn open_channel(&self) -> BusResult<Channel> {
        let tls = resolve_transport(&self.config.transport, self.source.as_ref())?;

        let session = self
            .broker
            .open(&self.config.connection_url, tls)
            .await
            .map_err(|e| BusError::Connect(e.to_string()))?;
        let channel = Channel::new(session);

        let setup = async {
            channel
                .declare_topic_exchange(&self.config.exchange_name, self.config.durable)
                .await
                .map_err(|e| {
                    BusError::Connect(format!(
                        "failed to declare exchange '{}': {e}",
                        self.config.exchange_name
                    ))
                })?;

            channel
                .set_prefetch(self.config.prefetch_count)
                .await
                .map_err(|e| BusError::Connect(format!("failed to set prefetch: {e}")))
        };

        if let Err(e) = setup.await {
            channel.shutdown(&self.config.broker_endpoint()).await;
            return Err(e);
        }

        Ok(channel)
    }

    /// Close the channel and then the connection
    ///
    /// No-op when already disconnected. Close failures are logged, never returned.
    pub async fn close(&self) -> BusResult<()> {
        let _lifecycle = self.lifecycle.lock().await;

        let Some(channel) = self.replace_channel(None) else {
            self.set_state(ConnectionState::Disconnected);
            return Ok(());
        };

        channel.shutdown(&self.config.broker_endpoint()).await;
        self.set_state(ConnectionState::Disconnected);

        info!(
            endpoint = %self.config.broker_endpoint(),
            exchange = %self.config.exchange_name,
            "Disconnected from broker"
        );
        Ok(())
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("endpoint", &self.config.broker_endpoint())
            .field("exchange", &self.config.exchange_name)
            .field("state", &self.state())
            .finish()
    }
}
