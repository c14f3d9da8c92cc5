// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Subscriptions
//!
//! A subscription consumes one queue on its own confirm channel. Each delivery
//! is processed as an independent task (at most `prefetch` at a time, enforced
//! by the broker) and settled by the consumer pipeline.
//!
//! When the delivery stream fails or ends while the subscription is running,
//! the channel is dropped and the subscription keeps trying to listen again,
//! once per second, until it succeeds or is stopped. Stopping drains: the
//! consumer is cancelled, in-flight handlers are awaited, and anything still
//! unacknowledged is handed back to the queue.
//!
//! ```text
//! Stopped -> Starting -> Running -> Recovering -> Starting -> ...
//!                        Running -> Draining -> Stopped
//! ```

use crate::{
    broker::{BrokerChannel, DeliveryStream},
    connection::ConnectionProvider,
    consumer::Processor,
    errors::AmqpError,
    exchange::Exchange,
    handler::ConsumerHandler,
    publisher::MessagePublisher,
    queue::Queue,
    retry::RetryPolicy,
    serializer::Serializer,
    topology,
};
use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Wait between two failed attempts to listen again after a channel failure.
pub const RECOVERY_INTERVAL: Duration = Duration::from_secs(1);
/// Poll interval while waiting for in-flight handlers on stop.
pub const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Stopped,
    Starting,
    Running,
    Recovering,
    Draining,
}

/// What to consume and how to handle it.
pub struct SubscriptionOptions<T> {
    pub(crate) queue: Queue,
    pub(crate) exchange: Option<Exchange>,
    pub(crate) prefetch: u16,
    pub(crate) retry_policy: Option<Arc<dyn RetryPolicy>>,
    pub(crate) handler: Arc<dyn ConsumerHandler<T>>,
}

impl<T: Send + 'static> SubscriptionOptions<T> {
    /// Consumes `queue` one message at a time, without retries.
    pub fn new<H>(queue: Queue, handler: H) -> Self
    where
        H: ConsumerHandler<T> + 'static,
    {
        SubscriptionOptions {
            queue,
            exchange: None,
            prefetch: 1,
            retry_policy: None,
            handler: Arc::new(handler),
        }
    }

    /// Exchange declared, when asserted, before consuming.
    pub fn exchange(mut self, exchange: Exchange) -> Self {
        self.exchange = Some(exchange);
        self
    }

    /// Maximum number of unacknowledged deliveries. Must be at least 1.
    pub fn prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    pub fn retry_policy<P: RetryPolicy + 'static>(mut self, policy: P) -> Self {
        self.retry_policy = Some(Arc::new(policy));
        self
    }
}

/// Decrements the in-flight counter when a delivery task finishes.
struct InFlight(Arc<AtomicUsize>);

impl InFlight {
    fn enter(counter: &Arc<AtomicUsize>) -> InFlight {
        counter.fetch_add(1, Ordering::SeqCst);
        InFlight(counter.clone())
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct Inner<T> {
    connections: Arc<dyn ConnectionProvider>,
    queue: Queue,
    exchange: Option<Exchange>,
    prefetch: u16,
    processor: Arc<Processor<T>>,
    closed: Arc<AtomicBool>,
    in_flight: Arc<AtomicUsize>,
    state: Mutex<SubscriptionState>,
    channel: tokio::sync::Mutex<Option<Arc<dyn BrokerChannel>>>,
    consumer_tag: Mutex<Option<String>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// A running consumer of one queue. Cheap to clone.
pub struct Subscription<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Subscription<T> {
    fn clone(&self) -> Self {
        Subscription {
            inner: self.inner.clone(),
        }
    }
}

fn lock<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<T> Subscription<T>
where
    T: DeserializeOwned + Send + 'static,
{
    /// Creates a stopped subscription. Fails with [`AmqpError::InvalidPrefetch`]
    /// when the prefetch is 0.
    pub fn new(
        connections: Arc<dyn ConnectionProvider>,
        publisher: Arc<dyn MessagePublisher>,
        serializer: Arc<dyn Serializer>,
        options: SubscriptionOptions<T>,
    ) -> Result<Self, AmqpError> {
        if options.prefetch == 0 {
            return Err(AmqpError::InvalidPrefetch(options.prefetch));
        }

        let closed = Arc::new(AtomicBool::new(false));
        let processor = Processor {
            queue: options.queue.name().to_owned(),
            handler: options.handler,
            serializer,
            publisher,
            retry_policy: options.retry_policy,
            closed: closed.clone(),
        };

        Ok(Subscription {
            inner: Arc::new(Inner {
                connections,
                queue: options.queue,
                exchange: options.exchange,
                prefetch: options.prefetch,
                processor: Arc::new(processor),
                closed,
                in_flight: Arc::new(AtomicUsize::new(0)),
                state: Mutex::new(SubscriptionState::Stopped),
                channel: tokio::sync::Mutex::new(None),
                consumer_tag: Mutex::new(None),
                task: Mutex::new(None),
            }),
        })
    }

    pub fn queue(&self) -> &str {
        self.inner.queue.name()
    }

    pub fn state(&self) -> SubscriptionState {
        *lock(&self.inner.state)
    }

    /// Number of deliveries whose processing has not finished yet.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Starts consuming. Returns `false`, after logging, when the channel,
    /// the QoS setting, the declarations or the consumer could not be set up.
    pub async fn start(&self) -> bool {
        if matches!(
            self.state(),
            SubscriptionState::Running | SubscriptionState::Recovering
        ) {
            return true;
        }

        self.inner.closed.store(false, Ordering::SeqCst);

        match self.inner.listen().await {
            Ok((channel, stream)) => {
                let task = tokio::spawn(Inner::run(self.inner.clone(), channel, stream));
                if let Some(previous) = lock(&self.inner.task).replace(task) {
                    previous.abort();
                }
                true
            }
            Err(err) => {
                error!(
                    error = err.to_string(),
                    queue = self.queue(),
                    "failed to subscribe"
                );
                self.inner.set_state(SubscriptionState::Stopped);
                false
            }
        }
    }

    /// Stops consuming and drains in-flight deliveries.
    ///
    /// Handlers already running are awaited, never aborted. Deliveries that
    /// are still unacknowledged afterwards are requeued.
    pub async fn stop(&self) -> Result<(), AmqpError> {
        let inner = &self.inner;

        inner.closed.store(true, Ordering::SeqCst);
        inner.set_state(SubscriptionState::Draining);
        debug!(queue = self.queue(), "stopping subscription...");

        let channel = inner.channel.lock().await.clone();
        let consumer_tag = lock(&inner.consumer_tag).take();

        if let (Some(channel), Some(tag)) = (&channel, consumer_tag) {
            if let Err(err) = channel.basic_cancel(&tag).await {
                error!(error = err.to_string(), "error to cancel the consumer");
            }
        }

        // deliveries buffered before the cancel must not be dispatched after the drain
        let task = lock(&inner.task).take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }

        while inner.in_flight.load(Ordering::SeqCst) > 0 {
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }

        let mut result = Ok(());

        let channel = inner.channel.lock().await.take();
        if let Some(channel) = channel.as_ref().filter(|c| c.is_connected()) {
            let settled = async {
                channel.nack_all(true).await?;
                channel.wait_for_confirms().await
            }
            .await;

            if let Err(err) = settled {
                error!(error = err.to_string(), "error returning outstanding messages");
                result = Err(err);
            }
        }

        if let Some(channel) = channel.filter(|c| c.is_connected()) {
            if let Err(err) = channel.close().await {
                error!(error = err.to_string(), "error closing subscription channel");
                result = result.and(Err(err));
            }
        }

        inner.set_state(SubscriptionState::Stopped);
        debug!(queue = self.queue(), "subscription stopped");

        result
    }
}

impl<T> Inner<T>
where
    T: DeserializeOwned + Send + 'static,
{
    fn set_state(&self, state: SubscriptionState) {
        *lock(&self.state) = state;
    }

    async fn channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let mut current = self.channel.lock().await;

        if let Some(channel) = current.as_ref() {
            if channel.is_connected() {
                return Ok(channel.clone());
            }
        }

        let connection = self.connections.get_connection().await?;
        let channel = connection.create_channel(true).await?;
        *current = Some(channel.clone());

        Ok(channel)
    }

    /// Drops the channel and the consumer tag, leaving the channel to the broker.
    async fn release_channel(&self) {
        self.channel.lock().await.take();
        lock(&self.consumer_tag).take();
    }

    /// Sets up the channel and registers the consumer.
    async fn listen(&self) -> Result<(Arc<dyn BrokerChannel>, DeliveryStream), AmqpError> {
        self.set_state(SubscriptionState::Starting);

        let listening = async {
            let channel = self.channel().await?;
            channel.basic_qos(self.prefetch).await?;

            if let Some(exchange) = self.exchange.as_ref().filter(|e| e.assert && !e.is_default()) {
                topology::declare_exchange(channel.as_ref(), exchange).await?;
            }

            if self.queue.assert {
                topology::declare_queue(channel.as_ref(), &self.queue).await?;
            }

            let tag = format!("{}-{}", self.queue.name(), Uuid::new_v4());
            let stream = channel.basic_consume(self.queue.name(), &tag).await?;

            Ok((channel, tag, stream))
        }
        .await;

        match listening {
            Ok((channel, tag, stream)) => {
                *lock(&self.consumer_tag) = Some(tag);
                self.set_state(SubscriptionState::Running);
                debug!(queue = self.queue.name(), "subscription listening");
                Ok((channel, stream))
            }
            Err(err) => {
                self.release_channel().await;
                Err(err)
            }
        }
    }

    /// Consume loop, recovering the channel until the subscription is stopped.
    async fn run(
        inner: Arc<Inner<T>>,
        mut channel: Arc<dyn BrokerChannel>,
        mut stream: DeliveryStream,
    ) {
        loop {
            inner.consume(&channel, &mut stream).await;

            if inner.closed.load(Ordering::SeqCst) {
                return;
            }

            error!(queue = inner.queue.name(), "channel failed, recovering subscription");
            inner.set_state(SubscriptionState::Recovering);
            inner.release_channel().await;

            (channel, stream) = loop {
                if inner.closed.load(Ordering::SeqCst) {
                    return;
                }

                match inner.listen().await {
                    Ok(listening) => break listening,
                    Err(err) => {
                        error!(
                            error = err.to_string(),
                            "failed to recover subscription channel"
                        );
                        inner.set_state(SubscriptionState::Recovering);
                        tokio::time::sleep(RECOVERY_INTERVAL).await;
                    }
                }
            };

            warn!(queue = inner.queue.name(), "subscription recovered");
        }
    }

    /// Dispatches deliveries until the stream ends or fails.
    async fn consume(&self, channel: &Arc<dyn BrokerChannel>, stream: &mut DeliveryStream) {
        while let Some(result) = stream.next().await {
            match result {
                Ok(delivery) => {
                    let in_flight = InFlight::enter(&self.in_flight);
                    let processor = self.processor.clone();
                    let channel = channel.clone();

                    tokio::spawn(async move {
                        let _in_flight = in_flight;
                        processor.process(channel.as_ref(), delivery).await;
                    });
                }
                Err(err) => {
                    error!(error = err.to_string(), "errors consume msg");
                    return;
                }
            }
        }
    }
}
