// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! Consumer queues are named after the topic they are bound with: every literal
//! `.` of the topic is replaced with `_`. They are durable and never
//! auto-deleted, so messages published while a consumer is reconnecting are
//! kept by the broker.

/// Derives the queue name used for a topic binding.
pub fn queue_name_for_topic(topic: &str) -> String {
    topic.replace('.', "_")
}

/// Definition of a queue with its configuration parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
}

impl QueueDefinition {
    /// Creates a new queue definition with the given name.
    ///
    /// The queue is non-durable until [`QueueDefinition::durable`] is called.
    /// Queues are never exclusive nor auto-deleted.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            durable: false,
        }
    }

    /// The durable queue a consumer binds for `topic`.
    pub fn for_topic(topic: &str) -> QueueDefinition {
        QueueDefinition::new(&queue_name_for_topic(topic)).durable()
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }
}

/// Configuration for binding a queue to an exchange.
///
/// The routing key of a binding may carry topic wildcards: `*` matches exactly
/// one word and `#` matches zero or more words.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
}

impl QueueBinding {
    /// Creates a new queue binding for the given queue.
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            exchange_name: String::new(),
            routing_key: String::new(),
        }
    }

    /// Sets the exchange to bind the queue to.
    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    /// Sets the routing key for the binding.
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange_name
    }

    pub fn key(&self) -> &str {
        &self.routing_key
    }
}
