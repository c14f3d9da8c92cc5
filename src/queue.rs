// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! This module provides the queue definition used by publishers (queues to
//! assert before publishing) and subscriptions (the source queue), together
//! with the two derived queues of the delivery topology:
//!
//! - `<routing key>.scheduler`: holds a delayed message until its expiration,
//!   then dead-letters it through the default exchange to the real queue.
//! - `<queue>.dlq`: terminal queue for messages that exhausted their retries.
//!
//! Both names are part of the wire contract and are not configurable.

pub const SCHEDULER_QUEUE_SUFFIX: &str = ".scheduler";
pub const DLQ_SUFFIX: &str = ".dlq";

/// Returns the name of the scheduler queue holding delayed messages for `routing_key`.
pub fn scheduler_queue_name(routing_key: &str) -> String {
    format!("{routing_key}{SCHEDULER_QUEUE_SUFFIX}")
}

/// Returns the name of the dead-letter queue of `queue`.
pub fn dlq_name(queue: &str) -> String {
    format!("{queue}{DLQ_SUFFIX}")
}

/// Definition of a RabbitMQ queue with its configuration parameters.
///
/// This struct implements the builder pattern. Besides the standard flags it
/// supports message TTL, max length and dead-letter routing, which is what the
/// scheduler queues rely on.
#[derive(Debug, Clone, Default)]
pub struct Queue {
    pub(crate) name: String,
    pub(crate) assert: bool,
    pub(crate) durable: bool,
    pub(crate) delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) passive: bool,
    pub(crate) ttl: Option<u32>,
    pub(crate) max_length: Option<u32>,
    pub(crate) max_length_bytes: Option<u32>,
    pub(crate) dead_letter_exchange: Option<String>,
    pub(crate) dead_letter_routing_key: Option<String>,
}

impl Queue {
    /// Creates a new queue definition with the given name.
    ///
    /// By default, the queue is not declared automatically and uses the
    /// broker's standard settings (non-durable, non-exclusive).
    pub fn new(name: &str) -> Queue {
        Queue {
            name: name.to_owned(),
            ..Default::default()
        }
    }

    /// Builds the scheduler queue for messages delayed on their way to `routing_key`.
    ///
    /// The queue never has consumers: expired messages are dead-lettered through
    /// the default exchange with `routing_key`, landing on the destination queue.
    pub fn scheduler(routing_key: &str) -> Queue {
        Queue::new(&scheduler_queue_name(routing_key))
            .assert()
            .durable()
            .dead_letter_exchange("")
            .dead_letter_routing_key(routing_key)
    }

    /// Builds the durable dead-letter queue of `queue`.
    pub fn dlq(queue: &str) -> Queue {
        Queue::new(&dlq_name(queue)).assert().durable()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Requests the queue to be declared before use.
    pub fn assert(mut self) -> Self {
        self.assert = true;
        self
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the queue to auto-delete when no longer used.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Makes the queue exclusive to the connection.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Makes the declaration passive, checking for existence without creating it.
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    /// Sets the message Time-To-Live (TTL) for the queue, in milliseconds.
    pub fn ttl(mut self, ttl: u32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Sets the maximum number of messages the queue can hold.
    pub fn max_length(mut self, max: u32) -> Self {
        self.max_length = Some(max);
        self
    }

    /// Sets the maximum size in bytes the queue can hold.
    pub fn max_length_bytes(mut self, max_bytes: u32) -> Self {
        self.max_length_bytes = Some(max_bytes);
        self
    }

    /// Sets the exchange rejected or expired messages are re-published to.
    pub fn dead_letter_exchange(mut self, exchange: &str) -> Self {
        self.dead_letter_exchange = Some(exchange.to_owned());
        self
    }

    /// Sets the routing key used when dead-lettering.
    pub fn dead_letter_routing_key(mut self, key: &str) -> Self {
        self.dead_letter_routing_key = Some(key.to_owned());
        self
    }
}
