// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Management
//!
//! This module asserts exchanges, queues and bindings on a channel. All
//! assertions are idempotent at the broker, so installing the same topology
//! again after a reconnect is safe.
//!
//! The main components are:
//! - `AmqpTopology`: collects definitions and installs them in order
//! - `init_queue`: asserts and binds the queue a consumer reads a topic from

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
    transport::BrokerChannel,
};
use tracing::debug;

/// Collects exchanges, queues and bindings and installs them on a channel.
pub struct AmqpTopology<'tp> {
    channel: &'tp dyn BrokerChannel,
    pub(crate) exchanges: Vec<ExchangeDefinition>,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) queues_binding: Vec<QueueBinding>,
}

impl<'tp> AmqpTopology<'tp> {
    pub fn new(channel: &'tp dyn BrokerChannel) -> AmqpTopology<'tp> {
        AmqpTopology {
            channel,
            exchanges: vec![],
            queues: vec![],
            queues_binding: vec![],
        }
    }

    /// Adds an exchange definition to the topology.
    pub fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    /// Adds a queue definition to the topology.
    pub fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.push(def);
        self
    }

    /// Adds a queue-to-exchange binding to the topology.
    pub fn queue_binding(mut self, binding: QueueBinding) -> Self {
        self.queues_binding.push(binding);
        self
    }

    /// Installs the topology: exchanges first, then queues, then bindings.
    pub async fn install(&self) -> Result<(), AmqpError> {
        self.install_exchanges().await?;
        self.install_queues().await?;
        self.binding_queues().await
    }

    async fn install_exchanges(&self) -> Result<(), AmqpError> {
        for exch in &self.exchanges {
            debug!("asserting exchange: {}", exch.name);
            self.channel.assert_exchange(exch).await?;
            debug!("exchange: {} was asserted", exch.name);
        }

        Ok(())
    }

    async fn install_queues(&self) -> Result<(), AmqpError> {
        for queue in &self.queues {
            debug!("asserting queue: {}", queue.name);
            self.channel.assert_queue(queue).await?;
            debug!("queue: {} was asserted", queue.name);
        }

        Ok(())
    }

    async fn binding_queues(&self) -> Result<(), AmqpError> {
        for binding in &self.queues_binding {
            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                binding.queue_name, binding.exchange_name, binding.routing_key
            );
            self.channel.bind_queue(binding).await?;
        }

        Ok(())
    }
}

/// Asserts the durable queue derived from `topic` and binds it to
/// `exchange_name` with `topic` as routing pattern. Returns the queue name.
///
/// Wildcards (`*`, `#`) are allowed in `topic`.
pub async fn init_queue(
    channel: &dyn BrokerChannel,
    exchange_name: &str,
    topic: &str,
) -> Result<String, AmqpError> {
    let queue = QueueDefinition::for_topic(topic);
    let queue_name = queue.name().to_owned();

    AmqpTopology::new(channel)
        .queue(queue)
        .queue_binding(
            QueueBinding::new(&queue_name)
                .exchange(exchange_name)
                .routing_key(topic),
        )
        .install()
        .await?;

    Ok(queue_name)
}
