//! In-memory implementation of the broker seam for testing and development

use crate::broker::{Broker, BrokerError, BrokerSession, Delivery, DeliveryStream, DeliveryTag};
use crate::transport::TlsMaterial;
use async_trait::async_trait;
use futures::stream::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

/// AMQP short strings (names, routing keys, consumer tags) are length-prefixed by one byte
const SHORT_STRING_MAX: usize = 255;

/// Broker implementation with RabbitMQ topic-exchange semantics, in process
///
/// This implementation is suitable for:
/// - Unit tests (no external dependencies)
/// - Local development without Docker
/// - Integration tests that need to observe acks, nacks and redeliveries
///
/// Routing follows topic exchange rules: `*` matches exactly one word and
/// `#` matches zero or more words. A message is enqueued once per matching
/// queue no matter how many of that queue's bindings match. Each consumer
/// holds at most its prefetch count of unacknowledged deliveries; a nack with
/// requeue puts the message back at the head of its queue flagged as
/// redelivered, and unacked deliveries are requeued when their channel closes.
///
/// # Example
/// ```rust
/// use std::sync::Arc;
/// use topic_bus::{BusConfig, InMemoryBroker, TopicBus};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let broker = InMemoryBroker::new();
/// let bus = TopicBus::new(BusConfig::new("amqp://localhost", "events"), Arc::new(broker.clone()));
///
/// bus.connect().await?;
/// assert_eq!(broker.connection_attempts(), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

/// One ack or nack observed by the broker, in the order it arrived
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckEvent {
    Ack {
        tag: DeliveryTag,
        routing_key: String,
        payload: Vec<u8>,
    },
    Nack {
        tag: DeliveryTag,
        routing_key: String,
        payload: Vec<u8>,
        requeue: bool,
    },
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeState>,
    queues: HashMap<String, QueueState>,
    sessions: HashMap<u64, SessionState>,
    next_session: u64,
    connection_attempts: usize,
    refuse_connections: bool,
    published: usize,
    journal: Vec<AckEvent>,
}

struct ExchangeState {
    durable: bool,
    bindings: Vec<(String, String)>,
}

struct QueueState {
    durable: bool,
    ready: VecDeque<Message>,
    consumers: Vec<ConsumerSlot>,
    next_consumer: usize,
}

#[derive(Clone)]
struct Message {
    routing_key: String,
    payload: Vec<u8>,
    redelivered: bool,
}

struct ConsumerSlot {
    session: u64,
    tag: String,
    prefetch: u16,
    in_flight: usize,
    sender: mpsc::UnboundedSender<Result<Delivery, BrokerError>>,
}

struct SessionState {
    connection_open: bool,
    channel_open: bool,
    prefetch: u16,
    next_tag: u64,
    unacked: HashMap<u64, Unacked>,
}

struct Unacked {
    queue: String,
    consumer_tag: String,
    message: Message,
}

impl SessionState {
    fn is_open(&self) -> bool {
        self.connection_open && self.channel_open
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make subsequent connection attempts fail (or succeed again)
    pub fn refuse_connections(&self, refuse: bool) {
        self.lock().refuse_connections = refuse;
    }

    /// Drop every open connection from the broker side
    ///
    /// Consumer streams end and unacknowledged deliveries go back to their queues.
    pub fn drop_connections(&self) {
        let mut state = self.lock();
        let ids: Vec<u64> = state.sessions.keys().copied().collect();
        for id in ids {
            state.close_session(id, true);
        }
    }

    /// Number of times `open` was called, successful or not
    pub fn connection_attempts(&self) -> usize {
        self.lock().connection_attempts
    }

    /// Sessions whose connection and channel are both open
    pub fn open_sessions(&self) -> usize {
        self.lock().sessions.values().filter(|s| s.is_open()).count()
    }

    /// Every ack and nack received so far
    pub fn journal(&self) -> Vec<AckEvent> {
        self.lock().journal.clone()
    }

    pub fn published_count(&self) -> usize {
        self.lock().published
    }

    /// Messages waiting in a queue (not yet delivered)
    pub fn ready_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    /// Messages delivered from a queue but not yet acked or nacked
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.lock()
            .sessions
            .values()
            .flat_map(|s| s.unacked.values())
            .filter(|u| u.queue == queue)
            .count()
    }

    pub fn exchange_durable(&self, exchange: &str) -> Option<bool> {
        self.lock().exchanges.get(exchange).map(|e| e.durable)
    }

    pub fn queue_durable(&self, queue: &str) -> Option<bool> {
        self.lock().queues.get(queue).map(|q| q.durable)
    }

    /// `(queue, routing key pattern)` pairs bound to an exchange, in bind order
    pub fn bindings(&self, exchange: &str) -> Vec<(String, String)> {
        self.lock()
            .exchanges
            .get(exchange)
            .map(|e| e.bindings.clone())
            .unwrap_or_default()
    }

    /// Prefetch window last applied by a session, if any session set one
    pub fn last_prefetch(&self) -> Option<u16> {
        let state = self.lock();
        state
            .sessions
            .iter()
            .max_by_key(|(id, _)| **id)
            .map(|(_, s)| s.prefetch)
    }

    /// Check if a routing key matches a topic binding pattern
    ///
    /// - `*` matches exactly one word
    /// - `#` matches zero or more words
    ///
    /// # Examples
    /// - `rk.org.#` matches `rk.org` and `rk.org.member.created`
    /// - `rk.*.created` matches `rk.org.created`
    /// - `rk.*` does NOT match `rk.org.created` (too many words)
    pub fn matches_topic(routing_key: &str, pattern: &str) -> bool {
        let key_words: Vec<&str> = routing_key.split('.').collect();
        let pattern_words: Vec<&str> = pattern.split('.').collect();
        matches_words(&key_words, &pattern_words)
    }
}

fn matches_words(key: &[&str], pattern: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        // `#` may swallow any number of words, including none
        Some((&"#", rest)) => (0..=key.len()).any(|skip| matches_words(&key[skip..], rest)),
        Some((&"*", rest)) => !key.is_empty() && matches_words(&key[1..], rest),
        Some((word, rest)) => key.first() == Some(word) && matches_words(&key[1..], rest),
    }
}

fn check_short_string(kind: &str, value: &str) -> Result<(), BrokerError> {
    if value.len() > SHORT_STRING_MAX {
        return Err(BrokerError::new(format!(
            "{kind} exceeds {SHORT_STRING_MAX} bytes"
        )));
    }
    Ok(())
}

impl BrokerState {
    fn open_session(&mut self, id: u64) -> Result<&mut SessionState, BrokerError> {
        match self.sessions.get_mut(&id) {
            Some(session) if session.is_open() => Ok(session),
            _ => Err(BrokerError::new("channel is closed")),
        }
    }

    /// Close a session's channel (and its connection when `connection` is set)
    ///
    /// Consumers registered by the session are dropped, which ends their
    /// streams, and its unacknowledged deliveries are requeued in tag order.
    fn close_session(&mut self, id: u64, connection: bool) {
        let Some(session) = self.sessions.get_mut(&id) else {
            return;
        };
        session.channel_open = false;
        if connection {
            session.connection_open = false;
        }

        let mut unacked: Vec<(u64, Unacked)> = session.unacked.drain().collect();
        unacked.sort_by_key(|(tag, _)| std::cmp::Reverse(*tag));

        let mut touched: Vec<String> = Vec::new();
        for (_, entry) in unacked {
            if let Some(queue) = self.queues.get_mut(&entry.queue) {
                queue.ready.push_front(Message {
                    redelivered: true,
                    ..entry.message
                });
            }
            if !touched.contains(&entry.queue) {
                touched.push(entry.queue);
            }
        }

        for (name, queue) in self.queues.iter_mut() {
            let before = queue.consumers.len();
            queue.consumers.retain(|c| c.session != id);
            if queue.consumers.len() != before && !touched.contains(name) {
                touched.push(name.clone());
            }
        }

        for name in touched {
            self.dispatch(&name);
        }
    }

    /// Channel-level protocol errors close the channel, as RabbitMQ does
    fn channel_exception(&mut self, id: u64, message: String) -> BrokerError {
        self.close_session(id, false);
        BrokerError::new(message)
    }

    /// Push ready messages to consumers that still have room in their prefetch window
    fn dispatch(&mut self, queue_name: &str) {
        let BrokerState {
            queues, sessions, ..
        } = self;
        let Some(queue) = queues.get_mut(queue_name) else {
            return;
        };

        queue.consumers.retain(|c| {
            !c.sender.is_closed() && sessions.get(&c.session).is_some_and(|s| s.is_open())
        });

        while !queue.ready.is_empty() && !queue.consumers.is_empty() {
            let count = queue.consumers.len();
            let picked = (0..count)
                .map(|offset| (queue.next_consumer + offset) % count)
                .find(|&idx| {
                    let c = &queue.consumers[idx];
                    c.prefetch == 0 || c.in_flight < usize::from(c.prefetch)
                });
            let Some(idx) = picked else {
                break;
            };
            queue.next_consumer = (idx + 1) % count;

            let Some(message) = queue.ready.pop_front() else {
                break;
            };
            let consumer = &mut queue.consumers[idx];
            let Some(session) = sessions.get_mut(&consumer.session) else {
                queue.ready.push_front(message);
                queue.consumers.remove(idx);
                continue;
            };

            session.next_tag += 1;
            let tag = session.next_tag;
            let delivery = Delivery {
                routing_key: message.routing_key.clone(),
                payload: message.payload.clone(),
                delivery_tag: DeliveryTag(tag),
                redelivered: message.redelivered,
            };

            if consumer.sender.send(Ok(delivery)).is_err() {
                queue.ready.push_front(message);
                queue.consumers.remove(idx);
                continue;
            }

            consumer.in_flight += 1;
            session.unacked.insert(
                tag,
                Unacked {
                    queue: queue_name.to_string(),
                    consumer_tag: consumer.tag.clone(),
                    message,
                },
            );
        }
    }

    /// Remove an unacked delivery and free its consumer's prefetch slot
    fn settle(&mut self, id: u64, tag: DeliveryTag) -> Result<Unacked, BrokerError> {
        let session = self.open_session(id)?;
        let Some(entry) = session.unacked.remove(&tag.0) else {
            return Err(self.channel_exception(
                id,
                format!("PRECONDITION_FAILED - unknown delivery tag {tag}"),
            ));
        };

        if let Some(queue) = self.queues.get_mut(&entry.queue) {
            if let Some(consumer) = queue
                .consumers
                .iter_mut()
                .find(|c| c.session == id && c.tag == entry.consumer_tag)
            {
                consumer.in_flight = consumer.in_flight.saturating_sub(1);
            }
        }

        Ok(entry)
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn open(
        &self,
        url: &str,
        tls: Option<TlsMaterial>,
    ) -> Result<Box<dyn BrokerSession>, BrokerError> {
        // Let concurrent callers interleave the way a network round trip would
        tokio::task::yield_now().await;

        let mut state = self.lock();
        state.connection_attempts += 1;

        if state.refuse_connections {
            return Err(BrokerError::new("connection refused"));
        }

        let secured = url.starts_with("amqps://");
        if !secured && !url.starts_with("amqp://") {
            return Err(BrokerError::new(format!("invalid broker URL '{url}'")));
        }
        if let Some(tls) = &tls {
            if !secured {
                return Err(BrokerError::new(
                    "secured deployments require an amqps:// broker URL",
                ));
            }
            if !tls.verify_peer {
                return Err(BrokerError::new("peer verification cannot be disabled"));
            }
        }

        state.next_session += 1;
        let id = state.next_session;
        state.sessions.insert(
            id,
            SessionState {
                connection_open: true,
                channel_open: true,
                prefetch: 0,
                next_tag: 0,
                unacked: HashMap::new(),
            },
        );

        Ok(Box::new(InMemorySession {
            broker: self.clone(),
            id,
        }))
    }
}

struct InMemorySession {
    broker: InMemoryBroker,
    id: u64,
}

#[async_trait]
impl BrokerSession for InMemorySession {
    async fn declare_topic_exchange(&self, name: &str, durable: bool) -> Result<(), BrokerError> {
        check_short_string("exchange name", name)?;
        let mut state = self.broker.lock();
        state.open_session(self.id)?;

        match state.exchanges.get(name).map(|e| e.durable) {
            Some(existing) if existing != durable => Err(state.channel_exception(
                self.id,
                format!("PRECONDITION_FAILED - inequivalent arg 'durable' for exchange '{name}'"),
            )),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(
                    name.to_string(),
                    ExchangeState {
                        durable,
                        bindings: Vec::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError> {
        let mut state = self.broker.lock();
        state.open_session(self.id)?.prefetch = count;
        Ok(())
    }

    async fn declare_queue(&self, name: &str, durable: bool) -> Result<(), BrokerError> {
        check_short_string("queue name", name)?;
        let mut state = self.broker.lock();
        state.open_session(self.id)?;

        match state.queues.get(name).map(|q| q.durable) {
            Some(existing) if existing != durable => Err(state.channel_exception(
                self.id,
                format!("PRECONDITION_FAILED - inequivalent arg 'durable' for queue '{name}'"),
            )),
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    name.to_string(),
                    QueueState {
                        durable,
                        ready: VecDeque::new(),
                        consumers: Vec::new(),
                        next_consumer: 0,
                    },
                );
                Ok(())
            }
        }
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        check_short_string("routing key", routing_key)?;
        let mut state = self.broker.lock();
        state.open_session(self.id)?;

        if !state.queues.contains_key(queue) {
            return Err(state.channel_exception(self.id, format!("NOT_FOUND - no queue '{queue}'")));
        }
        if !state.exchanges.contains_key(exchange) {
            return Err(state.channel_exception(
                self.id,
                format!("NOT_FOUND - no exchange '{exchange}'"),
            ));
        }

        let binding = (queue.to_string(), routing_key.to_string());
        if let Some(target) = state.exchanges.get_mut(exchange) {
            if !target.bindings.contains(&binding) {
                target.bindings.push(binding);
            }
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, BrokerError> {
        check_short_string("consumer tag", consumer_tag)?;
        let mut state = self.broker.lock();
        let prefetch = state.open_session(self.id)?.prefetch;

        let duplicate_tag = state
            .queues
            .values()
            .flat_map(|q| q.consumers.iter())
            .any(|c| c.session == self.id && c.tag == consumer_tag);
        if duplicate_tag {
            return Err(state.channel_exception(
                self.id,
                format!("NOT_ALLOWED - attempt to reuse consumer tag '{consumer_tag}'"),
            ));
        }

        if !state.queues.contains_key(queue) {
            return Err(state.channel_exception(self.id, format!("NOT_FOUND - no queue '{queue}'")));
        }

        let (sender, mut receiver) = mpsc::unbounded_channel();
        if let Some(target) = state.queues.get_mut(queue) {
            target.consumers.push(ConsumerSlot {
                session: self.id,
                tag: consumer_tag.to_string(),
                prefetch,
                in_flight: 0,
                sender,
            });
        }
        state.dispatch(queue);

        let stream = async_stream::stream! {
            while let Some(delivery) = receiver.recv().await {
                yield delivery;
            }
        };

        Ok(stream.boxed())
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<(), BrokerError> {
        let mut state = self.broker.lock();
        let entry = state.settle(self.id, tag)?;

        state.journal.push(AckEvent::Ack {
            tag,
            routing_key: entry.message.routing_key.clone(),
            payload: entry.message.payload.clone(),
        });
        state.dispatch(&entry.queue);
        Ok(())
    }

    async fn nack(&self, tag: DeliveryTag, requeue: bool) -> Result<(), BrokerError> {
        let mut state = self.broker.lock();
        let entry = state.settle(self.id, tag)?;

        state.journal.push(AckEvent::Nack {
            tag,
            routing_key: entry.message.routing_key.clone(),
            payload: entry.message.payload.clone(),
            requeue,
        });

        if requeue {
            if let Some(queue) = state.queues.get_mut(&entry.queue) {
                queue.ready.push_front(Message {
                    redelivered: true,
                    ..entry.message
                });
            }
        }
        state.dispatch(&entry.queue);
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
    ) -> Result<(), BrokerError> {
        check_short_string("routing key", routing_key)?;
        let mut state = self.broker.lock();
        state.open_session(self.id)?;

        // One copy per queue, however many of its bindings match
        let destinations = match state.exchanges.get(exchange) {
            Some(target) => {
                let mut destinations: Vec<String> = Vec::new();
                for (queue, pattern) in &target.bindings {
                    if !destinations.contains(queue)
                        && InMemoryBroker::matches_topic(routing_key, pattern)
                    {
                        destinations.push(queue.clone());
                    }
                }
                destinations
            }
            None => {
                return Err(state.channel_exception(
                    self.id,
                    format!("NOT_FOUND - no exchange '{exchange}'"),
                ))
            }
        };

        state.published += 1;
        for queue_name in destinations {
            if let Some(queue) = state.queues.get_mut(&queue_name) {
                queue.ready.push_back(Message {
                    routing_key: routing_key.to_string(),
                    payload: payload.clone(),
                    redelivered: false,
                });
            }
            state.dispatch(&queue_name);
        }
        Ok(())
    }

    async fn close_channel(&self) -> Result<(), BrokerError> {
        let mut state = self.broker.lock();
        state.open_session(self.id)?;
        state.close_session(self.id, false);
        Ok(())
    }

    async fn close_connection(&self) -> Result<(), BrokerError> {
        let mut state = self.broker.lock();
        match state.sessions.get(&self.id) {
            Some(session) if session.connection_open => {
                state.close_session(self.id, true);
                Ok(())
            }
            _ => Err(BrokerError::new("connection is closed")),
        }
    }

    fn is_open(&self) -> bool {
        self.broker
            .lock()
            .sessions
            .get(&self.id)
            .is_some_and(|s| s.is_open())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn session(broker: &InMemoryBroker) -> Box<dyn BrokerSession> {
        broker.open("amqp://localhost:5672", None).await.unwrap()
    }

    async fn next(stream: &mut DeliveryStream) -> Delivery {
        tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("timeout")
            .expect("stream ended")
            .expect("delivery error")
    }

    #[test]
    fn test_topic_matching() {
        // Exact match
        assert!(InMemoryBroker::matches_topic("rk.org.created", "rk.org.created"));

        // Single-word wildcard
        assert!(InMemoryBroker::matches_topic("rk.org.created", "rk.*.created"));
        assert!(InMemoryBroker::matches_topic("rk.org.created", "rk.org.*"));
        assert!(!InMemoryBroker::matches_topic("rk.org.member.created", "rk.*.created"));
        assert!(!InMemoryBroker::matches_topic("rk.org", "rk.org.*"));

        // Multi-word wildcard, including zero words
        assert!(InMemoryBroker::matches_topic("rk.org.member.created", "rk.#"));
        assert!(InMemoryBroker::matches_topic("rk.org", "rk.org.#"));
        assert!(InMemoryBroker::matches_topic("rk.org.member.created", "rk.#.created"));
        assert!(InMemoryBroker::matches_topic("anything.at.all", "#"));
        assert!(!InMemoryBroker::matches_topic("billing.org.created", "rk.#"));

        // Edge cases
        assert!(InMemoryBroker::matches_topic("single", "*"));
        assert!(!InMemoryBroker::matches_topic("one.two", "one"));
    }

    #[tokio::test]
    async fn test_publish_routes_to_bound_queue_once() {
        let broker = InMemoryBroker::new();
        let s = session(&broker).await;
        s.declare_topic_exchange("ex", true).await.unwrap();
        s.declare_queue("q", true).await.unwrap();
        s.bind_queue("q", "ex", "rk.org.created").await.unwrap();
        s.bind_queue("q", "ex", "rk.org.*").await.unwrap();

        s.publish("ex", "rk.org.created", b"one".to_vec()).await.unwrap();
        s.publish("ex", "rk.billing.created", b"none".to_vec()).await.unwrap();

        assert_eq!(broker.ready_count("q"), 1);
        assert_eq!(broker.published_count(), 2);
    }

    #[tokio::test]
    async fn test_prefetch_limits_unacked_deliveries() {
        let broker = InMemoryBroker::new();
        let s = session(&broker).await;
        s.declare_topic_exchange("ex", true).await.unwrap();
        s.declare_queue("q", true).await.unwrap();
        s.bind_queue("q", "ex", "#").await.unwrap();
        s.set_prefetch(2).await.unwrap();

        for i in 0..5 {
            s.publish("ex", "rk.msg", vec![i]).await.unwrap();
        }

        let mut stream = s.consume("q", "c1").await.unwrap();
        let first = next(&mut stream).await;
        let _second = next(&mut stream).await;
        assert_eq!(broker.unacked_count("q"), 2);
        assert_eq!(broker.ready_count("q"), 3);

        s.ack(first.delivery_tag).await.unwrap();
        let third = next(&mut stream).await;
        assert_eq!(third.payload, vec![2]);
        assert_eq!(broker.ready_count("q"), 2);
    }

    #[tokio::test]
    async fn test_nack_requeue_redelivers_with_flag() {
        let broker = InMemoryBroker::new();
        let s = session(&broker).await;
        s.declare_topic_exchange("ex", true).await.unwrap();
        s.declare_queue("q", true).await.unwrap();
        s.bind_queue("q", "ex", "rk.#").await.unwrap();
        s.set_prefetch(1).await.unwrap();
        s.publish("ex", "rk.a", b"x".to_vec()).await.unwrap();

        let mut stream = s.consume("q", "c1").await.unwrap();
        let first = next(&mut stream).await;
        assert!(!first.redelivered);

        s.nack(first.delivery_tag, true).await.unwrap();
        let again = next(&mut stream).await;
        assert!(again.redelivered);
        assert_eq!(again.payload, b"x".to_vec());
        assert_ne!(again.delivery_tag, first.delivery_tag);
    }

    #[tokio::test]
    async fn test_unknown_delivery_tag_closes_channel() {
        let broker = InMemoryBroker::new();
        let s = session(&broker).await;

        let err = s.ack(DeliveryTag(99)).await.unwrap_err();
        assert!(err.0.contains("PRECONDITION_FAILED"));
        assert!(!s.is_open());
    }

    #[tokio::test]
    async fn test_durability_mismatch_is_rejected() {
        let broker = InMemoryBroker::new();
        let s = session(&broker).await;
        s.declare_queue("q", true).await.unwrap();

        let s2 = session(&broker).await;
        assert!(s2.declare_queue("q", false).await.is_err());
        assert!(!s2.is_open());
        assert!(s.is_open());
    }

    #[tokio::test]
    async fn test_drop_connections_ends_streams_and_requeues() {
        let broker = InMemoryBroker::new();
        let s = session(&broker).await;
        s.declare_topic_exchange("ex", true).await.unwrap();
        s.declare_queue("q", true).await.unwrap();
        s.bind_queue("q", "ex", "#").await.unwrap();
        s.set_prefetch(1).await.unwrap();
        s.publish("ex", "rk", b"pending".to_vec()).await.unwrap();

        let mut stream = s.consume("q", "c1").await.unwrap();
        let _delivery = next(&mut stream).await;

        broker.drop_connections();

        let end = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("timeout");
        assert!(end.is_none());
        assert!(!s.is_open());
        assert_eq!(broker.ready_count("q"), 1);
        assert_eq!(broker.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_refused_connections_are_counted() {
        let broker = InMemoryBroker::new();
        broker.refuse_connections(true);

        assert!(broker.open("amqp://localhost", None).await.is_err());
        assert_eq!(broker.connection_attempts(), 1);
    }

    #[tokio::test]
    async fn test_routing_key_length_limit() {
        let broker = InMemoryBroker::new();
        let s = session(&broker).await;
        s.declare_topic_exchange("ex", true).await.unwrap();

        let long_key = "k".repeat(SHORT_STRING_MAX + 1);
        assert!(s.publish("ex", &long_key, Vec::new()).await.is_err());
        assert!(s.is_open());
    }
}
