// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Subscription Handlers
//!
//! A handler receives each decoded delivery together with its attempt number.
//! Returning an error marks the attempt as failed: the subscription then
//! reschedules the message or moves it to the dead-letter queue.
//!
//! Any async closure `Fn(SubscriptionMessage<T>) -> impl Future<Output = Result<(), HandlerError>>`
//! is a handler.

use async_trait::async_trait;
use lapin::BasicProperties;
use std::{error::Error, future::Future};

/// Error returned by handlers.
pub type HandlerError = Box<dyn Error + Send + Sync>;

/// A decoded delivery handed to a handler.
#[derive(Debug, Clone)]
pub struct SubscriptionMessage<T> {
    /// Delivery attempt, starting at 1.
    pub attempt: u32,
    pub data: T,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: BasicProperties,
}

/// Business logic invoked for every delivery of a subscription.
#[async_trait]
pub trait ConsumerHandler<T>: Send + Sync {
    async fn exec(&self, message: SubscriptionMessage<T>) -> Result<(), HandlerError>;
}

#[async_trait]
impl<T, F, Fut> ConsumerHandler<T> for F
where
    T: Send + 'static,
    F: Fn(SubscriptionMessage<T>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn exec(&self, message: SubscriptionMessage<T>) -> Result<(), HandlerError> {
        (self)(message).await
    }
}
