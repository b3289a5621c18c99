// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Transport Seam
//!
//! The wire protocol is not implemented by this crate. These traits describe
//! the primitives the connection lifecycle, channel registry, producer and
//! consumer rely on: connect, open channels, assert topology, publish, consume
//! with manual acknowledgment and close. The production implementation lives
//! in [`crate::amqp`] and is backed by lapin.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::{collections::BTreeMap, fmt, sync::Arc};

#[cfg(test)]
use mockall::automock;

/// Message headers carried alongside a payload.
pub type Headers = BTreeMap<String, String>;

/// Callback fired once when a connection terminates.
pub type CloseListener = Box<dyn FnOnce(CloseReason) + Send>;

/// Stream of deliveries produced by [`BrokerChannel::consume`].
pub type DeliveryStream = BoxStream<'static, Result<Incoming, AmqpError>>;

/// Why a connection terminated, as reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason(pub String);

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An item delivered to a consumer.
pub enum Incoming {
    /// A message waiting for acknowledgment.
    Delivery(Box<dyn BrokerDelivery>),
    /// The broker cancelled the consumer; there is no message to decrypt or ack.
    Cancelled,
}

/// Opens connections to a broker.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Arc<dyn BrokerConnection>, AmqpError>;
}

/// A single physical connection to the broker.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Opens a new channel multiplexed over this connection.
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError>;

    /// Installs a listener fired once when the connection terminates.
    fn on_close(&self, listener: CloseListener);

    async fn close(&self) -> Result<(), AmqpError>;
}

/// A virtual connection used to assert topology, publish and consume.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn assert_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn assert_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError>;

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    /// Publishes without waiting for a broker confirmation.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
        headers: Headers,
    ) -> Result<(), AmqpError>;

    /// Starts consuming `queue` with manual acknowledgment.
    ///
    /// A broker-side cancellation yields [`Incoming::Cancelled`] before the
    /// stream ends. Closing the channel or the connection just ends it.
    async fn consume(&self, queue: &str) -> Result<DeliveryStream, AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// A message handed to a consumer.
#[async_trait]
pub trait BrokerDelivery: Send + Sync {
    fn data(&self) -> &[u8];

    fn routing_key(&self) -> &str;

    fn headers(&self) -> Headers;

    async fn ack(&self) -> Result<(), AmqpError>;
}
