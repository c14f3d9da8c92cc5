// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! This module provides confirmed publishing on top of the connection manager.
//! Every publisher owns one confirm channel, created on first use and replaced
//! when it is found closed, and remembers which exchanges and queues it already
//! declared so topology is asserted at most once per instance.
//!
//! Delayed delivery does not rely on any broker plugin: a scheduled message is
//! parked on `<routing key>.scheduler` with a per-message expiration, and the
//! broker dead-letters it through the default exchange to the destination once
//! the expiration elapses.

use crate::{
    broker::BrokerChannel,
    connection::ConnectionProvider,
    errors::AmqpError,
    exchange::Exchange,
    message::{header_map, Message, ScheduledMessage, HEADER_TRACE_ID, PERSISTENT_DELIVERY_MODE},
    otel::{current_trace_id, inject_context},
    queue::{scheduler_queue_name, Queue},
    serializer::Serializer,
    topology,
};
use async_trait::async_trait;
use futures_util::future::try_join_all;
use lapin::{
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties,
};
use std::{collections::HashSet, sync::Arc};
use tokio::sync::Mutex;
use tracing::{debug, error};
use uuid::Uuid;

/// Publishing capability used by applications and by subscriptions.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    /// Publishes the messages in order and waits for the broker confirms.
    ///
    /// Returns `false` when any message could not be declared, encoded,
    /// published or confirmed. Failures are logged, never raised.
    async fn publish(&self, messages: &[Message]) -> bool;

    /// Publishes a message that reaches its routing key after its delay.
    ///
    /// Fails with [`AmqpError::SchedulingError`] before touching the broker when
    /// the attached queue does not match the routing key, and with the declare
    /// error when the scheduler queue cannot be declared.
    async fn schedule(&self, message: &ScheduledMessage) -> Result<bool, AmqpError>;

    /// Closes the publisher channel.
    async fn close(&self) -> Result<(), AmqpError>;
}

/// RabbitMQ publisher with publisher confirms and cached declarations.
pub struct Publisher {
    connections: Arc<dyn ConnectionProvider>,
    serializer: Arc<dyn Serializer>,
    channel: Mutex<Option<Arc<dyn BrokerChannel>>>,
    exchanges: Mutex<HashSet<String>>,
    queues: Mutex<HashSet<String>>,
}

impl Publisher {
    pub fn new(connections: Arc<dyn ConnectionProvider>, serializer: Arc<dyn Serializer>) -> Self {
        Publisher {
            connections,
            serializer,
            channel: Mutex::new(None),
            exchanges: Mutex::new(HashSet::new()),
            queues: Mutex::new(HashSet::new()),
        }
    }

    /// Returns the confirm channel, opening a new one if the last one closed.
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

    /// Forgets `channel` when it is closed so the next call opens a new one.
    async fn release_if_closed(&self, channel: &Arc<dyn BrokerChannel>) {
        if channel.is_connected() {
            return;
        }

        let mut current = self.channel.lock().await;
        if current.as_ref().is_some_and(|c| Arc::ptr_eq(c, channel)) {
            debug!("publisher channel closed, dropping it");
            *current = None;
        }
    }

    async fn declare_exchange_once(
        &self,
        channel: &dyn BrokerChannel,
        exchange: &Exchange,
    ) -> Result<(), AmqpError> {
        if !exchange.assert || exchange.is_default() {
            return Ok(());
        }

        let mut declared = self.exchanges.lock().await;
        if declared.contains(exchange.name()) {
            return Ok(());
        }

        topology::declare_exchange(channel, exchange).await?;
        declared.insert(exchange.name().to_owned());

        Ok(())
    }

    async fn declare_queue_once(&self, channel: &dyn BrokerChannel, queue: &Queue) -> Result<(), AmqpError> {
        if !queue.assert {
            return Ok(());
        }

        let mut declared = self.queues.lock().await;
        if declared.contains(queue.name()) {
            return Ok(());
        }

        topology::declare_queue(channel, queue).await?;
        declared.insert(queue.name().to_owned());

        Ok(())
    }

    /// Stamps content type, message id, OpenTelemetry context and trace id.
    fn outgoing_properties(&self, message: &Message) -> BasicProperties {
        let mut properties = message.properties.clone().unwrap_or_default();

        if properties.content_type().is_none() {
            properties = properties.with_content_type(ShortString::from(self.serializer.content_type()));
        }

        if properties.message_id().is_none() {
            properties = properties.with_message_id(ShortString::from(Uuid::new_v4().to_string()));
        }

        let mut headers = header_map(&properties);
        inject_context(&mut headers);

        if let Some(trace_id) = current_trace_id() {
            headers.insert(
                ShortString::from(HEADER_TRACE_ID),
                AMQPValue::LongString(LongString::from(trace_id)),
            );
        }

        properties.with_headers(FieldTable::from(headers))
    }

    /// Publishes the batch and waits for the confirms of exactly these messages.
    async fn publish_on(&self, channel: &dyn BrokerChannel, messages: &[Message]) -> Result<(), AmqpError> {
        let mut confirms = Vec::with_capacity(messages.len());

        for message in messages {
            self.declare_exchange_once(channel, &message.exchange).await?;
            if let Some(queue) = &message.queue {
                self.declare_queue_once(channel, queue).await?;
            }

            let payload = message.payload.encode(self.serializer.as_ref())?;

            debug!(
                exchange = message.exchange.name(),
                routing_key = message.routing_key,
                "publishing message"
            );

            let confirm = channel
                .basic_publish(
                    message.exchange.name(),
                    &message.routing_key,
                    &payload,
                    self.outgoing_properties(message),
                )
                .await?
                .ok_or_else(|| AmqpError::PublishRejected {
                    exchange: message.exchange.name().to_owned(),
                    routing_key: message.routing_key.clone(),
                })?;

            confirms.push(confirm);
        }

        try_join_all(confirms).await.map(|_| ())
    }
}

#[async_trait]
impl MessagePublisher for Publisher {
    async fn publish(&self, messages: &[Message]) -> bool {
        let channel = match self.channel().await {
            Ok(channel) => channel,
            Err(err) => {
                error!(error = err.to_string(), "failure to acquire publisher channel");
                return false;
            }
        };

        match self.publish_on(channel.as_ref(), messages).await {
            Ok(()) => true,
            Err(err) => {
                error!(error = err.to_string(), "error publishing messages");
                self.release_if_closed(&channel).await;
                false
            }
        }
    }

    async fn schedule(&self, scheduled: &ScheduledMessage) -> Result<bool, AmqpError> {
        scheduled.validate()?;

        let message = &scheduled.message;
        let channel = self.channel().await?;

        let declared = async {
            if let Some(queue) = &message.queue {
                self.declare_queue_once(channel.as_ref(), queue).await?;
            }
            self.declare_queue_once(channel.as_ref(), &Queue::scheduler(&message.routing_key))
                .await
        }
        .await;

        if let Err(err) = declared {
            error!(
                error = err.to_string(),
                routing_key = message.routing_key,
                "failure to declare the scheduler queue"
            );
            self.release_if_closed(&channel).await;
            return Err(err);
        }

        let properties = message
            .properties
            .clone()
            .unwrap_or_default()
            .with_expiration(ShortString::from(scheduled.delay.total_milliseconds().to_string()))
            .with_delivery_mode(PERSISTENT_DELIVERY_MODE);

        let delayed = Message {
            exchange: Exchange::default_exchange(),
            routing_key: scheduler_queue_name(&message.routing_key),
            payload: message.payload.clone(),
            properties: Some(properties),
            queue: None,
        };

        debug!(
            routing_key = message.routing_key,
            delay_ms = scheduled.delay.total_milliseconds(),
            "scheduling message"
        );

        Ok(self.publish(std::slice::from_ref(&delayed)).await)
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let Some(channel) = self.channel.lock().await.take() else {
            return Ok(());
        };

        if channel.is_connected() {
            debug!("closing publisher channel...");
            channel.close().await?;
        }

        Ok(())
    }
}
