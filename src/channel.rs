// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection and Channel Management
//!
//! This module implements the broker seam traits on top of lapin. It opens
//! connections to the RabbitMQ server, creates plain or confirm channels, and
//! translates every lapin failure into an [`AmqpError`] after logging it.
//!
//! Publisher confirms belong to the publish call that produced them: each
//! `basic_publish` returns the confirmation of its own message, so concurrent
//! publishers on one channel never observe each other's acks or nacks.

use crate::{
    broker::{
        BrokerChannel, BrokerConnection, BrokerConnector, Delivery, DeliveryStream, ErrorListener,
        PublishConfirm,
    },
    config::ConnectionOptions,
    errors::AmqpError,
};
use async_trait::async_trait;
use futures_util::{FutureExt, StreamExt};
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
        QueueDeclareOptions,
    },
    types::{FieldTable, LongString},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use std::sync::Arc;
use tracing::{debug, error};

const REPLY_SUCCESS: u16 = 200;

/// Opens lapin connections.
#[derive(Debug, Clone, Default)]
pub struct LapinConnector;

#[async_trait]
impl BrokerConnector for LapinConnector {
    /// Connects to RabbitMQ using the URI built from the options, naming the
    /// connection after the application.
    async fn connect(
        &self,
        options: &ConnectionOptions,
    ) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        debug!("creating amqp connection...");
        let properties = ConnectionProperties::default()
            .with_connection_name(LongString::from(options.app_name.clone()));

        let conn = match Connection::connect(&options.uri(), properties).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
        }?;
        debug!("amqp connected");

        Ok(Arc::new(LapinConnection { conn }))
    }
}

/// A lapin connection.
pub struct LapinConnection {
    conn: Connection,
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    fn is_connected(&self) -> bool {
        self.conn.status().connected()
    }

    fn on_error(&self, listener: ErrorListener) {
        self.conn
            .on_error(move |err| listener(AmqpError::ConnectionError(err.to_string())));
    }

    async fn create_channel(&self, confirm: bool) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        debug!("creating amqp channel...");
        let channel = match self.conn.create_channel().await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }?;

        if confirm {
            if let Err(err) = channel
                .confirm_select(ConfirmSelectOptions { nowait: false })
                .await
            {
                error!(error = err.to_string(), "error to enable publisher confirms");
                return Err(AmqpError::ChannelError(err.to_string()));
            }
        }

        debug!("channel created");
        Ok(Arc::new(LapinChannel::new(channel)))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.conn
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|err| AmqpError::ConnectionError(err.to_string()))
    }
}

/// A lapin channel.
pub struct LapinChannel {
    channel: Channel,
}

impl LapinChannel {
    pub fn new(channel: Channel) -> Self {
        LapinChannel { channel }
    }
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    fn is_connected(&self) -> bool {
        self.channel.status().connected()
    }

    async fn basic_qos(&self, prefetch: u16) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(prefetch, BasicQosOptions { global: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), prefetch, "failure to configure qos");
                AmqpError::QoSDeclarationError(err.to_string())
            })
    }

    async fn exchange_declare(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        self.channel
            .exchange_declare(name, kind, options, arguments)
            .await
            .map_err(|err| {
                error!(error = err.to_string(), name, "error to declare the exchange");
                AmqpError::DeclareExchangeError(name.to_owned())
            })
    }

    async fn queue_declare(
        &self,
        name: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        match self.channel.queue_declare(name, options, arguments).await {
            Err(err) => {
                error!(error = err.to_string(), name, "error to declare the queue");
                Err(AmqpError::DeclareQueueError(name.to_owned()))
            }
            _ => Ok(()),
        }
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<Option<PublishConfirm>, AmqpError> {
        let confirm = match self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                payload,
                properties,
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError(err.to_string()))
            }
            Ok(confirm) => Ok(confirm),
        }?;

        Ok(Some(
            async move {
                let confirmation = confirm.await.map_err(|err| {
                    error!(error = err.to_string(), "error waiting for publisher confirm");
                    AmqpError::PublishingError(err.to_string())
                })?;

                if confirmation.is_nack() {
                    return Err(AmqpError::PublishNacked);
                }

                Ok(())
            }
            .boxed(),
        ))
    }

    async fn wait_for_confirms(&self) -> Result<(), AmqpError> {
        self.channel
            .wait_for_confirms()
            .await
            .map(|_| ())
            .map_err(|err| {
                error!(error = err.to_string(), "error waiting for publisher confirms");
                AmqpError::PublishingError(err.to_string())
            })
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError> {
        let consumer = match self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::ConsumerDeclarationError(err.to_string()))
            }
            Ok(c) => Ok(c),
        }?;

        Ok(consumer
            .map(|result| {
                result
                    .map(Delivery::from)
                    .map_err(|err| AmqpError::ConsumerError(err.to_string()))
            })
            .boxed())
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions { nowait: false })
            .await
            .map_err(|err| AmqpError::ConsumerCancelError(err.to_string()))
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| AmqpError::AckMessageError(err.to_string()))
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|err| AmqpError::NackMessageError(err.to_string()))
    }

    async fn nack_all(&self, requeue: bool) -> Result<(), AmqpError> {
        // delivery tag 0 with `multiple` covers every outstanding delivery
        self.channel
            .basic_nack(
                0,
                BasicNackOptions {
                    multiple: true,
                    requeue,
                },
            )
            .await
            .map_err(|err| AmqpError::NackMessageError(err.to_string()))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.channel
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|err| AmqpError::ChannelError(err.to_string()))
    }
}
