// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Definitions
//!
//! Every channel managed by this crate is plugged into exactly one exchange.
//! Exchanges are always declared as topic exchanges so that publishers route
//! by a literal topic and consumers bind with wildcard patterns.

/// Definition of a topic exchange with its declaration parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
}

impl ExchangeDefinition {
    /// Creates a new, non-durable topic exchange definition.
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            durable: false,
        }
    }

    /// The definition used for every channel of the registry: a durable topic exchange.
    pub fn durable_topic(name: &str) -> ExchangeDefinition {
        ExchangeDefinition::new(name).durable()
    }

    /// Makes the exchange durable, persisting across broker restarts.
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
