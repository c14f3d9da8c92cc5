// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! This module implements the per-delivery pipeline of a subscription:
//!
//! 1. Reads the `attempt` and `traceId` headers and opens a consumer span
//! 2. Returns the delivery to the queue when the subscription is stopping
//! 3. Decodes the payload and invokes the handler
//! 4. Acknowledges on success
//! 5. On failure, reschedules a copy with the next attempt number when the
//!    retry policy allows it, or publishes the message to `<queue>.dlq`
//!    otherwise, and then drops the original
//!
//! If the copy cannot be published, the original is nacked with requeue so the
//! broker redelivers it instead of losing it. A panicking handler counts as a
//! failed attempt.

use crate::{
    broker::{BrokerChannel, Delivery},
    errors::AmqpError,
    exchange::Exchange,
    handler::{ConsumerHandler, HandlerError, SubscriptionMessage},
    message::{self, Message},
    otel::{self, with_trace_id},
    publisher::MessagePublisher,
    queue::{dlq_name, Queue},
    retry::RetryPolicy,
    serializer::Serializer,
};
use futures_util::FutureExt as _;
use opentelemetry::{
    global,
    trace::{FutureExt, Status, TraceContextExt},
    Context,
};
use serde::de::DeserializeOwned;
use std::{
    any::{type_name, Any},
    borrow::Cow,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tracing::{debug, debug_span, error, warn, Instrument};

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// Handled and acknowledged
    Acked,
    /// Handler failed, a copy was scheduled for the next attempt
    Rescheduled,
    /// Handler failed for good, a copy went to the dead-letter queue
    DeadLettered,
    /// The copy could not be published, the original was requeued
    Requeued,
    /// The subscription is stopping, the delivery was handed back untouched
    Returned,
}

/// Processes the deliveries of one subscription.
pub(crate) struct Processor<T> {
    pub(crate) queue: String,
    pub(crate) handler: Arc<dyn ConsumerHandler<T>>,
    pub(crate) serializer: Arc<dyn Serializer>,
    pub(crate) publisher: Arc<dyn MessagePublisher>,
    pub(crate) retry_policy: Option<Arc<dyn RetryPolicy>>,
    pub(crate) closed: Arc<AtomicBool>,
}

impl<T> Processor<T>
where
    T: DeserializeOwned + Send + 'static,
{
    /// Settles one delivery on `channel`, then waits for the channel's pending confirms.
    pub(crate) async fn process(&self, channel: &dyn BrokerChannel, delivery: Delivery) -> Outcome {
        let attempt = message::attempt(&delivery.properties);
        let (trace_id, span) = otel::new_span(
            &delivery.properties,
            &global::tracer("amqp consumer"),
            &self.queue,
        );
        let ctx = Context::current_with_span(span);

        let outcome = with_trace_id(trace_id, self.settle(channel, &delivery, attempt))
            .with_context(ctx.clone())
            .instrument(debug_span!(
                "delivery",
                queue = self.queue,
                delivery_tag = delivery.delivery_tag,
                attempt
            ))
            .await;

        if let Err(err) = channel.wait_for_confirms().await {
            error!(error = err.to_string(), "error waiting for confirms");
        }

        let span = ctx.span();
        match outcome {
            Outcome::Acked => span.set_status(Status::Ok),
            Outcome::Requeued => span.set_status(Status::Error {
                description: Cow::from("failure to republish message"),
            }),
            _ => {}
        }

        outcome
    }

    async fn settle(&self, channel: &dyn BrokerChannel, delivery: &Delivery, attempt: u32) -> Outcome {
        if self.closed.load(Ordering::SeqCst) {
            debug!("subscription stopping, returning message to the queue");
            self.nack(channel, delivery, true).await;
            return Outcome::Returned;
        }

        debug!(
            "received: {} - exchange: {}",
            delivery.routing_key, delivery.exchange
        );

        let result = match self.decode(&delivery.data) {
            Ok(data) => {
                self.handle(SubscriptionMessage {
                    attempt,
                    data,
                    exchange: delivery.exchange.clone(),
                    routing_key: delivery.routing_key.clone(),
                    redelivered: delivery.redelivered,
                    properties: delivery.properties.clone(),
                })
                .await
            }
            Err(err) => Err(HandlerError::from(err)),
        };

        let Err(err) = result else {
            debug!("message successfully processed");
            if let Err(err) = channel.basic_ack(delivery.delivery_tag).await {
                error!(error = err.to_string(), "error whiling ack msg");
            }
            return Outcome::Acked;
        };

        error!(error = err.to_string(), attempt, "failure to process message");

        let (republished, outcome) = match &self.retry_policy {
            Some(policy) if policy.can_retry(attempt) => {
                (self.reschedule(policy.as_ref(), delivery, attempt).await, Outcome::Rescheduled)
            }
            _ => (self.dead_letter(delivery).await, Outcome::DeadLettered),
        };

        if republished {
            self.nack(channel, delivery, false).await;
            outcome
        } else {
            warn!("failure to republish message, requeuing the original");
            self.nack(channel, delivery, true).await;
            Outcome::Requeued
        }
    }

    /// Runs the handler, turning a panic into a handler error.
    async fn handle(&self, message: SubscriptionMessage<T>) -> Result<(), HandlerError> {
        match AssertUnwindSafe(async { self.handler.exec(message).await })
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => Err(HandlerError::from(format!(
                "handler panicked: {}",
                panic_message(panic.as_ref())
            ))),
        }
    }

    fn decode(&self, data: &[u8]) -> Result<T, AmqpError> {
        let type_hint = type_name::<T>();
        let value = self.serializer.deserialize(type_hint, data)?;

        serde_json::from_value(value).map_err(|err| AmqpError::DeserializationError {
            type_hint: type_hint.to_owned(),
            reason: err.to_string(),
        })
    }

    /// Schedules a copy of the delivery on this queue for the next attempt.
    async fn reschedule(&self, policy: &dyn RetryPolicy, delivery: &Delivery, attempt: u32) -> bool {
        let next = attempt.saturating_add(1);
        let delay = policy.get_delay(next);

        warn!(
            attempt = next,
            delay_ms = delay.total_milliseconds(),
            "rescheduling message"
        );

        let scheduled = Message::new(Exchange::default_exchange(), &self.queue)
            .raw(delivery.data.clone())
            .properties(message::with_attempt(&delivery.properties, next))
            .delay(delay);

        match self.publisher.schedule(&scheduled).await {
            Ok(scheduled) => scheduled,
            Err(err) => {
                error!(error = err.to_string(), "failure to reschedule message");
                false
            }
        }
    }

    /// Publishes the delivery, unchanged but without expiration, to the dead-letter queue.
    async fn dead_letter(&self, delivery: &Delivery) -> bool {
        error!("too many attempts, sending to dlq");

        let dlq = dlq_name(&self.queue);
        let copy = Message::new(Exchange::default_exchange(), &dlq)
            .raw(delivery.data.clone())
            .properties(message::without_expiration(&delivery.properties))
            .queue(Queue::dlq(&self.queue));

        self.publisher.publish(std::slice::from_ref(&copy)).await
    }

    async fn nack(&self, channel: &dyn BrokerChannel, delivery: &Delivery, requeue: bool) {
        if let Err(err) = channel.basic_nack(delivery.delivery_tag, requeue).await {
            error!(error = err.to_string(), requeue, "error whiling nack msg");
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        broker::MockBrokerChannel, publisher::MockMessagePublisher, retry::LinearRetryPolicy,
        serializer::JsonSerializer, timespan::TimeSpan,
    };
    use lapin::{types::ShortString, BasicProperties};
    use serde::Deserialize;
    use std::sync::Mutex;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Order {
        id: u32,
    }

    fn processor(
        handler: Arc<dyn ConsumerHandler<Order>>,
        publisher: MockMessagePublisher,
        retry_policy: Option<Arc<dyn RetryPolicy>>,
    ) -> Processor<Order> {
        Processor {
            queue: "orders".to_owned(),
            handler,
            serializer: Arc::new(JsonSerializer),
            publisher: Arc::new(publisher),
            retry_policy,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn delivery(data: &[u8], properties: BasicProperties) -> Delivery {
        Delivery {
            delivery_tag: 7,
            exchange: "".to_owned(),
            routing_key: "orders".to_owned(),
            redelivered: false,
            properties,
            data: data.to_vec(),
        }
    }

    fn channel_expecting(ack: bool, nack: Option<bool>) -> MockBrokerChannel {
        let mut channel = MockBrokerChannel::new();
        channel.expect_wait_for_confirms().times(1).returning(|| Ok(()));
        channel
            .expect_basic_ack()
            .withf(|tag| *tag == 7)
            .times(usize::from(ack))
            .returning(|_| Ok(()));
        match nack {
            Some(requeue) => {
                channel
                    .expect_basic_nack()
                    .withf(move |tag, r| *tag == 7 && *r == requeue)
                    .times(1)
                    .returning(|_, _| Ok(()));
            }
            None => {
                channel.expect_basic_nack().never();
            }
        }
        channel
    }

    fn failing() -> Arc<dyn ConsumerHandler<Order>> {
        Arc::new(|_: SubscriptionMessage<Order>| async {
            Err::<(), HandlerError>("boom".into())
        })
    }

    #[tokio::test]
    async fn successful_handler_acks() {
        let seen = Arc::new(Mutex::new(vec![]));
        let handler: Arc<dyn ConsumerHandler<Order>> = {
            let seen = seen.clone();
            Arc::new(move |message: SubscriptionMessage<Order>| {
                seen.lock().unwrap().push((message.attempt, message.data.id));
                async { Ok::<(), HandlerError>(()) }
            })
        };

        let mut publisher = MockMessagePublisher::new();
        publisher.expect_publish().never();
        publisher.expect_schedule().never();

        let processor = processor(handler, publisher, None);
        let channel = channel_expecting(true, None);

        let outcome = processor
            .process(&channel, delivery(br#"{"id":5}"#, BasicProperties::default()))
            .await;

        assert_eq!(outcome, Outcome::Acked);
        assert_eq!(*seen.lock().unwrap(), vec![(1, 5)]);
    }

    #[tokio::test]
    async fn handler_receives_attempt_from_headers() {
        let seen = Arc::new(Mutex::new(None));
        let handler: Arc<dyn ConsumerHandler<Order>> = {
            let seen = seen.clone();
            Arc::new(move |message: SubscriptionMessage<Order>| {
                *seen.lock().unwrap() = Some(message.attempt);
                async { Ok::<(), HandlerError>(()) }
            })
        };

        let processor = processor(handler, MockMessagePublisher::new(), None);
        let channel = channel_expecting(true, None);
        let properties = message::with_attempt(&BasicProperties::default(), 2);

        processor.process(&channel, delivery(br#"{"id":1}"#, properties)).await;

        assert_eq!(*seen.lock().unwrap(), Some(2));
    }

    #[tokio::test]
    async fn failure_with_retry_reschedules_next_attempt() {
        let mut publisher = MockMessagePublisher::new();
        publisher
            .expect_schedule()
            .withf(|scheduled| {
                scheduled.message.routing_key == "orders"
                    && scheduled.message.exchange.is_default()
                    && scheduled.message.queue.is_none()
                    && scheduled.delay == TimeSpan::from_seconds(10)
                    && scheduled
                        .message
                        .properties
                        .as_ref()
                        .map(message::attempt)
                        == Some(2)
            })
            .times(1)
            .returning(|_| Ok(true));
        publisher.expect_publish().never();

        let policy: Arc<dyn RetryPolicy> = Arc::new(LinearRetryPolicy::new(1));
        let processor = processor(failing(), publisher, Some(policy));
        let channel = channel_expecting(false, Some(false));

        let outcome = processor
            .process(&channel, delivery(br#"{"id":1}"#, BasicProperties::default()))
            .await;

        assert_eq!(outcome, Outcome::Rescheduled);
    }

    #[tokio::test]
    async fn exhausted_retries_go_to_dlq() {
        let mut publisher = MockMessagePublisher::new();
        publisher.expect_schedule().never();
        publisher
            .expect_publish()
            .withf(|messages| {
                let copy = &messages[0];
                messages.len() == 1
                    && copy.routing_key == "orders.dlq"
                    && copy.exchange.is_default()
                    && copy.queue.as_ref().is_some_and(|q| q.name() == "orders.dlq" && q.durable)
                    && copy
                        .properties
                        .as_ref()
                        .is_some_and(|p| p.expiration().is_none())
            })
            .times(1)
            .returning(|_| true);

        let policy: Arc<dyn RetryPolicy> = Arc::new(LinearRetryPolicy::new(1));
        let processor = processor(failing(), publisher, Some(policy));
        let channel = channel_expecting(false, Some(false));
        let properties = message::with_attempt(&BasicProperties::default(), 2)
            .with_expiration(ShortString::from("2000"));

        let outcome = processor
            .process(&channel, delivery(br#"{"id":1}"#, properties))
            .await;

        assert_eq!(outcome, Outcome::DeadLettered);
    }

    #[tokio::test]
    async fn failure_without_policy_goes_to_dlq() {
        let mut publisher = MockMessagePublisher::new();
        publisher.expect_publish().times(1).returning(|_| true);

        let processor = processor(failing(), publisher, None);
        let channel = channel_expecting(false, Some(false));

        let outcome = processor
            .process(&channel, delivery(br#"{"id":1}"#, BasicProperties::default()))
            .await;

        assert_eq!(outcome, Outcome::DeadLettered);
    }

    #[tokio::test]
    async fn undecodable_payload_is_dead_lettered_without_calling_handler() {
        let called = Arc::new(AtomicBool::new(false));
        let handler: Arc<dyn ConsumerHandler<Order>> = {
            let called = called.clone();
            Arc::new(move |_: SubscriptionMessage<Order>| {
                called.store(true, Ordering::SeqCst);
                async { Ok::<(), HandlerError>(()) }
            })
        };

        let mut publisher = MockMessagePublisher::new();
        publisher.expect_publish().times(1).returning(|_| true);

        let processor = processor(handler, publisher, None);
        let channel = channel_expecting(false, Some(false));

        let outcome = processor
            .process(&channel, delivery(b"not json", BasicProperties::default()))
            .await;

        assert_eq!(outcome, Outcome::DeadLettered);
        assert!(!called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn panicking_handler_is_treated_as_a_failure() {
        let handler: Arc<dyn ConsumerHandler<Order>> =
            Arc::new(|message: SubscriptionMessage<Order>| async move {
                if message.data.id == 1 {
                    panic!("handler bug");
                }
                Ok::<(), HandlerError>(())
            });

        let mut publisher = MockMessagePublisher::new();
        publisher
            .expect_publish()
            .withf(|messages| messages[0].routing_key == "orders.dlq")
            .times(1)
            .returning(|_| true);

        let processor = Arc::new(processor(handler, publisher, None));
        let channel = Arc::new(channel_expecting(false, Some(false)));

        let outcome = tokio::spawn(async move {
            processor
                .process(channel.as_ref(), delivery(br#"{"id":1}"#, BasicProperties::default()))
                .await
        })
        .await
        .unwrap();

        assert_eq!(outcome, Outcome::DeadLettered);
    }

    #[tokio::test]
    async fn failed_reschedule_requeues_original() {
        let mut publisher = MockMessagePublisher::new();
        publisher
            .expect_schedule()
            .returning(|_| Err(AmqpError::DeclareQueueError("orders.scheduler".to_owned())));

        let policy: Arc<dyn RetryPolicy> = Arc::new(LinearRetryPolicy::new(3));
        let processor = processor(failing(), publisher, Some(policy));
        let channel = channel_expecting(false, Some(true));

        let outcome = processor
            .process(&channel, delivery(br#"{"id":1}"#, BasicProperties::default()))
            .await;

        assert_eq!(outcome, Outcome::Requeued);
    }

    #[tokio::test]
    async fn unconfirmed_dead_letter_requeues_original() {
        let mut publisher = MockMessagePublisher::new();
        publisher.expect_publish().returning(|_| false);

        let processor = processor(failing(), publisher, None);
        let channel = channel_expecting(false, Some(true));

        let outcome = processor
            .process(&channel, delivery(br#"{"id":1}"#, BasicProperties::default()))
            .await;

        assert_eq!(outcome, Outcome::Requeued);
    }

    #[tokio::test]
    async fn stopping_subscription_returns_delivery_untouched() {
        let called = Arc::new(AtomicBool::new(false));
        let handler: Arc<dyn ConsumerHandler<Order>> = {
            let called = called.clone();
            Arc::new(move |_: SubscriptionMessage<Order>| {
                called.store(true, Ordering::SeqCst);
                async { Ok::<(), HandlerError>(()) }
            })
        };

        let processor = processor(handler, MockMessagePublisher::new(), None);
        processor.closed.store(true, Ordering::SeqCst);
        let channel = channel_expecting(false, Some(true));

        let outcome = processor
            .process(&channel, delivery(br#"{"id":1}"#, BasicProperties::default()))
            .await;

        assert_eq!(outcome, Outcome::Returned);
        assert!(!called.load(Ordering::SeqCst));
    }
}
