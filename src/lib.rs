// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod consumer;
mod otel;

pub mod broker;
pub mod channel;
pub mod client;
pub mod config;
pub mod connection;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod message;
pub mod publisher;
pub mod queue;
pub mod retry;
pub mod serializer;
pub mod subscription;
pub mod timespan;
pub mod topology;

pub use client::RabbitMqClient;
pub use config::ConnectionOptions;
pub use connection::{ConnectionManager, ConnectionProvider, ConnectionState};
pub use errors::AmqpError;
pub use exchange::{Exchange, ExchangeKind};
pub use handler::{ConsumerHandler, HandlerError, SubscriptionMessage};
pub use message::{Message, Payload, ScheduledMessage};
pub use otel::{current_trace_id, with_trace_id};
pub use publisher::{MessagePublisher, Publisher};
pub use queue::Queue;
pub use retry::{LinearRetryPolicy, RetryPolicy};
pub use serializer::{JsonSerializer, Serializer};
pub use subscription::{Subscription, SubscriptionOptions, SubscriptionState};
pub use timespan::TimeSpan;
