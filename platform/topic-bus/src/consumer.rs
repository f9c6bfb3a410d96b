//! Consumer loop: decode, dispatch to the handler, ack or reject
//!
//! Deliveries are handled concurrently up to the prefetch window. Each
//! handler task owns its delivery and settles that delivery's tag exactly
//! once: ack on success, nack on failure. Whether a failed delivery is
//! requeued is decided by a [`RedeliveryPolicy`].

use crate::broker::{Delivery, DeliveryStream};
use crate::connection::{Channel, ConnectionManager};
use crate::envelope::decode;
use crate::{BusError, BusResult, HandlerError};
use futures::{FutureExt, StreamExt};
use serde::de::DeserializeOwned;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

/// What to do with a delivery whose handler failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Reject with requeue; the broker redelivers it
    Requeue,
    /// Reject without requeue; the broker drops it or dead-letters it if the queue has a DLX
    Discard,
}

/// Decides the fate of deliveries that failed to decode or whose handler failed
pub trait RedeliveryPolicy: Send + Sync {
    fn on_failure(&self, delivery: &Delivery) -> Disposition;
}

/// Requeue every failure
///
/// A message that always fails is redelivered forever unless a broker-side
/// policy (delivery limit, TTL) steps in.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysRequeue;

impl RedeliveryPolicy for AlwaysRequeue {
    fn on_failure(&self, _delivery: &Delivery) -> Disposition {
        Disposition::Requeue
    }
}

/// Requeue a first failure; discard a delivery that already came back once
#[derive(Debug, Clone, Copy, Default)]
pub struct RequeueOnce;

impl RedeliveryPolicy for RequeueOnce {
    fn on_failure(&self, delivery: &Delivery) -> Disposition {
        if delivery.redelivered {
            Disposition::Discard
        } else {
            Disposition::Requeue
        }
    }
}

/// Counters for one consumer, final once its loop has ended
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeStats {
    pub delivered: u64,
    pub acked: u64,
    pub requeued: u64,
    pub discarded: u64,
    /// Acks or nacks that could not be sent (channel already closed)
    pub ack_failures: u64,
}

#[derive(Default)]
struct Counters {
    delivered: AtomicU64,
    acked: AtomicU64,
    requeued: AtomicU64,
    discarded: AtomicU64,
    ack_failures: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ConsumeStats {
        ConsumeStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            ack_failures: self.ack_failures.load(Ordering::Relaxed),
        }
    }
}

/// Handle to a running consumer loop
///
/// The loop ends when the channel closes (`close()` on the bus, or the
/// broker dropping the connection). Re-invoke `consume` after reconnecting.
#[derive(Debug)]
pub struct ConsumerHandle {
    queue: String,
    consumer_tag: String,
    task: JoinHandle<ConsumeStats>,
}

impl ConsumerHandle {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the loop to end and all in-flight handlers to settle
    pub async fn wait(self) -> ConsumeStats {
        match self.task.await {
            Ok(stats) => stats,
            Err(e) => {
                error!(queue = %self.queue, error = %e, "Consumer task failed");
                ConsumeStats::default()
            }
        }
    }
}

struct LoopContext {
    queue: String,
    channel: Channel,
    policy: Arc<dyn RedeliveryPolicy>,
    counters: Counters,
}

/// Subscribes handlers to queues
#[derive(Clone)]
pub struct Consumer {
    connection: Arc<ConnectionManager>,
    policy: Arc<dyn RedeliveryPolicy>,
}

impl Consumer {
    pub fn new(connection: Arc<ConnectionManager>) -> Self {
        Self {
            connection,
            policy: Arc::new(AlwaysRequeue),
        }
    }

    pub fn with_policy(mut self, policy: Arc<dyn RedeliveryPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Start consuming `queue`, calling `handler(routing_key, payload)` per message
    ///
    /// Returns once the consumer is registered; the loop itself runs on a
    /// spawned task. Up to `prefetch_count` handlers run at the same time.
    pub async fn consume<T, H, Fut>(&self, queue: &str, handler: H) -> BusResult<ConsumerHandle>
    where
        T: DeserializeOwned + Send + 'static,
        H: Fn(String, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let channel = self.connection.ensure_connected().await?;
        let consumer_tag = format!("{queue}.{}", Uuid::new_v4());

        let stream = channel.consume(queue, &consumer_tag).await.map_err(|e| {
            let err = BusError::Consume {
                queue: queue.to_string(),
                reason: e.to_string(),
            };
            error!(queue = %queue, error = %err, "Failed to start consumer");
            err
        })?;

        let window = usize::from(self.connection.config().prefetch_count.max(1));
        info!(
            queue = %queue,
            consumer_tag = %consumer_tag,
            window = window,
            "Start consuming messages"
        );

        let context = Arc::new(LoopContext {
            queue: queue.to_string(),
            channel,
            policy: Arc::clone(&self.policy),
            counters: Counters::default(),
        });
        let task = tokio::spawn(run_loop(context, stream, Arc::new(handler), window));

        Ok(ConsumerHandle {
            queue: queue.to_string(),
            consumer_tag,
            task,
        })
    }
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("connection", &self.connection)
            .finish()
    }
}

async fn run_loop<T, H, Fut>(
    context: Arc<LoopContext>,
    mut stream: DeliveryStream,
    handler: Arc<H>,
    window: usize,
) -> ConsumeStats
where
    T: DeserializeOwned + Send + 'static,
    H: Fn(String, T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    let permits = Arc::new(Semaphore::new(window));

    while let Some(next) = stream.next().await {
        let delivery = match next {
            Ok(delivery) => delivery,
            Err(e) => {
                warn!(queue = %context.queue, error = %e, "Delivery stream failed");
                break;
            }
        };
        Counters::bump(&context.counters.delivered);

        let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
            break;
        };

        let span = tracing::info_span!(
            "handle_delivery",
            queue = %context.queue,
            routing_key = %delivery.routing_key,
            delivery_tag = %delivery.delivery_tag,
            redelivered = delivery.redelivered
        );
        let context = Arc::clone(&context);
        let handler = Arc::clone(&handler);
        tokio::spawn(
            async move {
                handle_delivery(&context, handler.as_ref(), delivery).await;
                drop(permit);
            }
            .instrument(span),
        );
    }

    // Every permit back means every in-flight delivery has been settled
    let _all = permits.acquire_many(window as u32).await;

    let stats = context.counters.snapshot();
    info!(
        queue = %context.queue,
        delivered = stats.delivered,
        acked = stats.acked,
        requeued = stats.requeued,
        discarded = stats.discarded,
        "Consumer stopped"
    );
    stats
}

async fn handle_delivery<T, H, Fut>(context: &LoopContext, handler: &H, delivery: Delivery)
where
    T: DeserializeOwned,
    H: Fn(String, T) -> Fut,
    Fut: Future<Output = Result<(), HandlerError>>,
{
    debug!("Message received");

    let outcome = match decode::<T>(&delivery.payload) {
        Ok(payload) => {
            let routing_key = delivery.routing_key.clone();
            match AssertUnwindSafe(async { handler(routing_key, payload).await })
                .catch_unwind()
                .await
            {
                Ok(result) => result.map_err(|e| e.to_string()),
                Err(_) => Err("handler panicked".to_string()),
            }
        }
        Err(e) => Err(e.to_string()),
    };

    let tag = delivery.delivery_tag;
    match outcome {
        Ok(()) => match context.channel.ack(tag).await {
            Ok(()) => {
                Counters::bump(&context.counters.acked);
                debug!("Message acknowledged");
            }
            Err(e) => {
                Counters::bump(&context.counters.ack_failures);
                error!(error = %e, "Failed to acknowledge message");
            }
        },
        Err(reason) => {
            let disposition = context.policy.on_failure(&delivery);
            let requeue = disposition == Disposition::Requeue;
            error!(error = %reason, requeue = requeue, "Error processing message");

            match context.channel.nack(tag, requeue).await {
                Ok(()) if requeue => Counters::bump(&context.counters.requeued),
                Ok(()) => Counters::bump(&context.counters.discarded),
                Err(e) => {
                    Counters::bump(&context.counters.ack_failures);
                    error!(error = %e, "Failed to reject message");
                }
            }
        }
    }
}
