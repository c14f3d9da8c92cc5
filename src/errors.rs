// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Resilient RabbitMQ Client
//!
//! This module provides the error type shared by every layer of the crate.
//! `AmqpError` covers connection and channel failures, topology declaration,
//! publishing and confirms, scheduling preconditions, payload codecs and
//! consumer-side acknowledgement failures.
//!
//! Most of these never reach application code: publish failures surface as a
//! `false` return value and processing failures are resolved into the
//! retry / dead-letter pipeline. Only precondition violations such as
//! [`AmqpError::SchedulingError`] are returned to the caller directly.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Variants carry the broker or codec message as a string so the error stays
/// `Clone`, which lets concurrent callers share the outcome of a single
/// connection attempt.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Error establishing a connection to the RabbitMQ server, or a connection
    /// that was lost mid-session
    #[error("failure to connect `{0}`")]
    ConnectionError(String),

    /// Error creating or using a channel
    #[error("failure to create a channel `{0}`")]
    ChannelError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error publishing a message
    #[error("failure to publish `{0}`")]
    PublishingError(String),

    /// The broker refused to buffer the message for the given routing key
    #[error("message rejected by the broker, exchange: `{exchange}` routing key: `{routing_key}`")]
    PublishRejected {
        exchange: String,
        routing_key: String,
    },

    /// The broker negatively confirmed a published message
    #[error("publisher confirm nack")]
    PublishNacked,

    /// A scheduled message named a queue different from its routing key
    #[error("scheduled message queue `{queue}` must match the routing key `{routing_key}`")]
    SchedulingError { queue: String, routing_key: String },

    /// Error encoding a message payload
    #[error("failure to serialize payload `{0}`")]
    SerializationError(String),

    /// Error decoding a message payload into the subscription type
    #[error("failure to deserialize payload into `{type_hint}`: {reason}")]
    DeserializationError { type_hint: String, reason: String },

    /// Error acknowledging a message
    #[error("failure to ack message `{0}`")]
    AckMessageError(String),

    /// Error negative-acknowledging a message
    #[error("failure to nack message `{0}`")]
    NackMessageError(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring a consumer
    #[error("consumer declaration error `{0}`")]
    ConsumerDeclarationError(String),

    /// Error cancelling a consumer
    #[error("failure to cancel consumer `{0}`")]
    ConsumerCancelError(String),

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// Prefetch must allow at least one unacknowledged delivery
    #[error("invalid prefetch `{0}`, must be at least 1")]
    InvalidPrefetch(u16),

    /// Missing or malformed connection settings
    #[error("invalid configuration `{0}`")]
    ConfigError(String),
}
