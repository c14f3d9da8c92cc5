// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Declaration
//!
//! This module turns [`Exchange`] and [`Queue`] definitions into broker
//! declarations. It builds the declaration arguments (dead-letter routing,
//! TTL, length limits) and issues the declare calls on a channel.
//!
//! Declarations are idempotent on the broker side as long as the arguments
//! match; callers decide when to declare and whether to remember it.

use crate::{broker::BrokerChannel, errors::AmqpError, exchange::Exchange, queue::Queue};
use lapin::{
    options::{ExchangeDeclareOptions, QueueDeclareOptions},
    types::{AMQPValue, FieldTable, LongString, LongUInt, ShortString},
};
use std::collections::BTreeMap;
use tracing::{debug, error};

/// Constant for the header field used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the header field used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Constant for the header field used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Constant for the header field used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Constant for the header field used to specify maximum queue size in bytes
pub const AMQP_HEADERS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";

/// Declares an exchange on the given channel.
///
/// # Parameters
/// * `channel` - Channel to issue the declaration on
/// * `exchange` - The exchange definition
///
/// # Returns
/// Ok(()) on success or AmqpError on failure
pub(crate) async fn declare_exchange(
    channel: &dyn BrokerChannel,
    exchange: &Exchange,
) -> Result<(), AmqpError> {
    debug!("creating exchange: {}", exchange.name);

    match channel
        .exchange_declare(
            &exchange.name,
            exchange.kind.clone().into(),
            ExchangeDeclareOptions {
                passive: exchange.passive,
                durable: exchange.durable,
                auto_delete: exchange.delete,
                internal: exchange.internal,
                nowait: false,
            },
            FieldTable::from(exchange.params.clone()),
        )
        .await
    {
        Err(err) => {
            error!(
                error = err.to_string(),
                name = exchange.name,
                "error to declare the exchange"
            );
            Err(err)
        }
        _ => {
            debug!("exchange: {} was created", exchange.name);
            Ok(())
        }
    }
}

/// Declares a queue on the given channel.
///
/// # Parameters
/// * `channel` - Channel to issue the declaration on
/// * `queue` - The queue definition
///
/// # Returns
/// Ok(()) on success or AmqpError on failure
pub(crate) async fn declare_queue(channel: &dyn BrokerChannel, queue: &Queue) -> Result<(), AmqpError> {
    debug!("creating queue: {}", queue.name);

    match channel
        .queue_declare(
            &queue.name,
            QueueDeclareOptions {
                passive: queue.passive,
                durable: queue.durable,
                exclusive: queue.exclusive,
                auto_delete: queue.delete,
                nowait: false,
            },
            queue_arguments(queue),
        )
        .await
    {
        Err(err) => {
            error!(error = err.to_string(), name = queue.name, "error to declare the queue");
            Err(err)
        }
        _ => {
            debug!("queue: {} was created", queue.name);
            Ok(())
        }
    }
}

/// Builds the `x-*` declaration arguments of a queue.
pub(crate) fn queue_arguments(queue: &Queue) -> FieldTable {
    let mut args = BTreeMap::<ShortString, AMQPValue>::new();

    if let Some(exchange) = &queue.dead_letter_exchange {
        args.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            AMQPValue::LongString(LongString::from(exchange.clone())),
        );
    }

    if let Some(key) = &queue.dead_letter_routing_key {
        args.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
            AMQPValue::LongString(LongString::from(key.clone())),
        );
    }

    if let Some(ttl) = queue.ttl {
        args.insert(
            ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
            AMQPValue::LongUInt(LongUInt::from(ttl)),
        );
    }

    if let Some(max) = queue.max_length {
        args.insert(
            ShortString::from(AMQP_HEADERS_MAX_LENGTH),
            AMQPValue::LongUInt(LongUInt::from(max)),
        );
    }

    if let Some(max_bytes) = queue.max_length_bytes {
        args.insert(
            ShortString::from(AMQP_HEADERS_MAX_LENGTH_BYTES),
            AMQPValue::LongUInt(LongUInt::from(max_bytes)),
        );
    }

    FieldTable::from(args)
}
