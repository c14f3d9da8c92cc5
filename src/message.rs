// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Messages
//!
//! Outgoing messages, delayed messages and the header contract shared with
//! consumers. Two headers travel with every message handled by this crate:
//!
//! - `attempt`: delivery attempt number, 1 when absent
//! - `traceId`: trace identifier correlated across retries

use crate::{errors::AmqpError, exchange::Exchange, queue::Queue, serializer::Serializer, timespan::TimeSpan};
use lapin::{
    types::{AMQPValue, FieldTable, LongLongInt, ShortString},
    BasicProperties,
};
use serde::Serialize;
use std::{borrow::Cow, collections::BTreeMap};

/// Header carrying the delivery attempt number
pub const HEADER_ATTEMPT: &str = "attempt";
/// Header carrying the trace identifier
pub const HEADER_TRACE_ID: &str = "traceId";

/// AMQP delivery mode marking a message as persistent
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// The body of a message.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Bytes sent as they are
    Raw(Vec<u8>),
    /// A value encoded by the publisher's serializer
    Value(serde_json::Value),
}

impl Default for Payload {
    fn default() -> Self {
        Payload::Raw(vec![])
    }
}

impl Payload {
    pub(crate) fn encode<'p>(&'p self, serializer: &dyn Serializer) -> Result<Cow<'p, [u8]>, AmqpError> {
        match self {
            Payload::Raw(bytes) => Ok(Cow::Borrowed(bytes)),
            Payload::Value(value) => serializer.serialize(value).map(Cow::Owned),
        }
    }
}

/// A message to publish.
#[derive(Debug, Clone, Default)]
pub struct Message {
    pub exchange: Exchange,
    pub routing_key: String,
    pub payload: Payload,
    pub properties: Option<BasicProperties>,
    pub queue: Option<Queue>,
}

impl Message {
    pub fn new(exchange: Exchange, routing_key: &str) -> Message {
        Message {
            exchange,
            routing_key: routing_key.to_owned(),
            ..Default::default()
        }
    }

    /// Uses `data`, converted to a JSON value, as the payload.
    pub fn json<T: Serialize + ?Sized>(mut self, data: &T) -> Result<Self, AmqpError> {
        let value = serde_json::to_value(data).map_err(|err| AmqpError::SerializationError(err.to_string()))?;
        self.payload = Payload::Value(value);
        Ok(self)
    }

    /// Uses `bytes` verbatim as the payload.
    pub fn raw(mut self, bytes: Vec<u8>) -> Self {
        self.payload = Payload::Raw(bytes);
        self
    }

    pub fn properties(mut self, properties: BasicProperties) -> Self {
        self.properties = Some(properties);
        self
    }

    /// Attaches a queue to declare, when asserted, before publishing.
    pub fn queue(mut self, queue: Queue) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Turns the message into a delayed one.
    pub fn delay(self, delay: TimeSpan) -> ScheduledMessage {
        ScheduledMessage { message: self, delay }
    }
}

/// A message delivered to its routing key once `delay` has elapsed.
///
/// When a queue is attached, its name must equal the routing key.
#[derive(Debug, Clone)]
pub struct ScheduledMessage {
    pub message: Message,
    pub delay: TimeSpan,
}

impl ScheduledMessage {
    /// Checks the queue / routing key contract before anything reaches the broker.
    pub(crate) fn validate(&self) -> Result<(), AmqpError> {
        match &self.message.queue {
            Some(queue) if queue.name != self.message.routing_key => Err(AmqpError::SchedulingError {
                queue: queue.name.clone(),
                routing_key: self.message.routing_key.clone(),
            }),
            _ => Ok(()),
        }
    }
}

/// Returns the headers of the properties as an ordered map.
pub(crate) fn header_map(properties: &BasicProperties) -> BTreeMap<ShortString, AMQPValue> {
    properties
        .headers()
        .as_ref()
        .map(|headers| headers.inner().clone())
        .unwrap_or_default()
}

/// Reads the `attempt` header, defaulting to 1.
pub fn attempt(properties: &BasicProperties) -> u32 {
    let headers = header_map(properties);

    let value = match headers.get(HEADER_ATTEMPT) {
        Some(AMQPValue::ShortShortInt(v)) => i64::from(*v),
        Some(AMQPValue::ShortShortUInt(v)) => i64::from(*v),
        Some(AMQPValue::ShortInt(v)) => i64::from(*v),
        Some(AMQPValue::ShortUInt(v)) => i64::from(*v),
        Some(AMQPValue::LongInt(v)) => i64::from(*v),
        Some(AMQPValue::LongUInt(v)) => i64::from(*v),
        Some(AMQPValue::LongLongInt(v)) => *v,
        Some(AMQPValue::Float(v)) => *v as i64,
        Some(AMQPValue::Double(v)) => *v as i64,
        Some(AMQPValue::LongString(v)) => String::from_utf8_lossy(v.as_bytes()).trim().parse().unwrap_or(1),
        Some(AMQPValue::ShortString(v)) => v.as_str().trim().parse().unwrap_or(1),
        _ => 1,
    };

    u32::try_from(value).ok().filter(|attempt| *attempt >= 1).unwrap_or(1)
}

/// Reads the `traceId` header.
pub fn trace_id(properties: &BasicProperties) -> Option<String> {
    match header_map(properties).get(HEADER_TRACE_ID) {
        Some(AMQPValue::LongString(v)) => Some(String::from_utf8_lossy(v.as_bytes()).into_owned()),
        Some(AMQPValue::ShortString(v)) => Some(v.as_str().to_owned()),
        _ => None,
    }
    .filter(|id| !id.is_empty())
}

/// Returns a copy of the properties with the `attempt` header set.
pub(crate) fn with_attempt(properties: &BasicProperties, attempt: u32) -> BasicProperties {
    let mut headers = header_map(properties);
    headers.insert(
        ShortString::from(HEADER_ATTEMPT),
        AMQPValue::LongLongInt(LongLongInt::from(attempt)),
    );
    properties.clone().with_headers(FieldTable::from(headers))
}

/// Copies every property except the expiration.
///
/// Dead-lettered copies must not expire while waiting on the DLQ.
pub(crate) fn without_expiration(properties: &BasicProperties) -> BasicProperties {
    let mut copy = BasicProperties::default();

    if let Some(v) = properties.content_type() {
        copy = copy.with_content_type(v.clone());
    }
    if let Some(v) = properties.content_encoding() {
        copy = copy.with_content_encoding(v.clone());
    }
    if let Some(v) = properties.headers() {
        copy = copy.with_headers(v.clone());
    }
    if let Some(v) = properties.delivery_mode() {
        copy = copy.with_delivery_mode(*v);
    }
    if let Some(v) = properties.priority() {
        copy = copy.with_priority(*v);
    }
    if let Some(v) = properties.correlation_id() {
        copy = copy.with_correlation_id(v.clone());
    }
    if let Some(v) = properties.reply_to() {
        copy = copy.with_reply_to(v.clone());
    }
    if let Some(v) = properties.message_id() {
        copy = copy.with_message_id(v.clone());
    }
    if let Some(v) = properties.timestamp() {
        copy = copy.with_timestamp(*v);
    }
    if let Some(v) = properties.kind() {
        copy = copy.with_type(v.clone());
    }
    if let Some(v) = properties.user_id() {
        copy = copy.with_user_id(v.clone());
    }
    if let Some(v) = properties.app_id() {
        copy = copy.with_app_id(v.clone());
    }
    if let Some(v) = properties.cluster_id() {
        copy = copy.with_cluster_id(v.clone());
    }

    copy
}
