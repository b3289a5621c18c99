// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Handlers
//!
//! A handler receives the decrypted payload of each delivery. Returning `Ok`
//! acknowledges the message; returning an error leaves it unacknowledged and
//! lets the broker decide about redelivery.

use crate::errors::HandlerError;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::future::Future;

/// A decrypted message handed to a [`ConsumerHandler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerMessage {
    pub exchange: String,
    pub channel: String,
    /// Topic pattern the subscription was registered with.
    pub topic: String,
    pub queue: String,
    /// Routing key the message was published with; empty for cancellations.
    pub routing_key: String,
    /// Decrypted payload, `None` when the broker cancelled the consumer.
    pub payload: Option<String>,
}

impl ConsumerMessage {
    /// Deserializes the JSON payload.
    pub fn json<T: DeserializeOwned>(&self) -> Result<Option<T>, serde_json::Error> {
        self.payload
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
    }

    pub fn is_cancellation(&self) -> bool {
        self.payload.is_none()
    }
}

#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn exec(&self, msg: &ConsumerMessage) -> Result<(), HandlerError>;
}

#[async_trait]
impl<F, Fut> ConsumerHandler for F
where
    F: Fn(ConsumerMessage) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn exec(&self, msg: &ConsumerMessage) -> Result<(), HandlerError> {
        (self)(msg.clone()).await
    }
}
