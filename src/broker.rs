// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Client Seam
//!
//! The publisher, the subscription and the connection manager never talk to
//! lapin directly. They go through the traits in this module, which cover
//! exactly the primitives they need: opening a connection, creating plain or
//! confirm channels, declaring topology, publishing, waiting for confirms,
//! consuming and acknowledging.
//!
//! [`crate::channel`] provides the lapin-backed implementation. Tests use the
//! mockall-generated mocks.

use crate::{config::ConnectionOptions, errors::AmqpError};
use async_trait::async_trait;
use futures_util::{future::BoxFuture, stream::BoxStream};
use lapin::{
    options::{ExchangeDeclareOptions, QueueDeclareOptions},
    types::FieldTable,
    BasicProperties, ExchangeKind,
};
use std::sync::Arc;

/// Stream of deliveries produced by a consumer registration.
///
/// The stream ends, or yields an error, when the underlying channel fails.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

/// Broker confirmation of one published message. Resolves to
/// [`AmqpError::PublishNacked`] when the broker refuses it.
pub type PublishConfirm = BoxFuture<'static, Result<(), AmqpError>>;

/// Callback invoked when the broker connection reports an error or closes.
pub type ErrorListener = Box<dyn Fn(AmqpError) + Send + Sync>;

/// A message received from a queue.
#[derive(Debug, Clone, Default)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: BasicProperties,
    pub data: Vec<u8>,
}

impl From<lapin::message::Delivery> for Delivery {
    fn from(delivery: lapin::message::Delivery) -> Self {
        Delivery {
            delivery_tag: delivery.delivery_tag,
            exchange: delivery.exchange.to_string(),
            routing_key: delivery.routing_key.to_string(),
            redelivered: delivery.redelivered,
            properties: delivery.properties,
            data: delivery.data,
        }
    }
}

/// Opens connections to the broker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(
        &self,
        options: &ConnectionOptions,
    ) -> Result<Arc<dyn BrokerConnection>, AmqpError>;
}

/// A live broker connection.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Returns `false` once the connection has failed or been closed.
    fn is_connected(&self) -> bool;

    /// Registers the listener for connection errors and closes.
    fn on_error(&self, listener: ErrorListener);

    /// Creates a new channel. Confirm channels track publisher confirms.
    async fn create_channel(&self, confirm: bool) -> Result<Arc<dyn BrokerChannel>, AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// A channel opened on a broker connection.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    fn is_connected(&self) -> bool;

    async fn basic_qos(&self, prefetch: u16) -> Result<(), AmqpError>;

    async fn exchange_declare(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), AmqpError>;

    async fn queue_declare(
        &self,
        name: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), AmqpError>;

    /// Buffers a message for publishing and hands back its own confirmation.
    ///
    /// Returns `Ok(None)` when the broker client refuses to buffer the message.
    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<Option<PublishConfirm>, AmqpError>;

    /// Waits for the confirms still outstanding on this channel.
    async fn wait_for_confirms(&self) -> Result<(), AmqpError>;

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError>;

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    /// Negatively acknowledges every outstanding delivery on the channel.
    async fn nack_all(&self, requeue: bool) -> Result<(), AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}
