// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Producer
//!
//! This module publishes encrypted messages to topic exchanges. Messages are
//! serialized to JSON, encrypted with the shared key and published on a
//! channel obtained from the registry. The current OpenTelemetry context is
//! propagated in the message headers.
//!
//! Producer topics must be literal: wildcards only make sense in consumer
//! bindings, so a topic containing `*` or `#` is rejected before any channel
//! is requested.

use crate::{
    amqp::LapinConnector,
    config::AmqpConfig,
    connection::ConnectionLifecycle,
    crypto::Cryptographer,
    errors::AmqpError,
    otel,
    transport::Connector,
};
use opentelemetry::Context;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

/// Publishes encrypted messages.
///
/// Channels are recreated lazily after a reconnection, so the producer needs
/// no reconnect hook.
pub struct AmqpProducer {
    lifecycle: Arc<ConnectionLifecycle>,
    cryptographer: Cryptographer,
}

impl AmqpProducer {
    /// Creates a producer backed by lapin.
    pub fn new(cfg: &AmqpConfig) -> Result<Self, AmqpError> {
        Self::with_connector(cfg, Arc::new(LapinConnector::new(&cfg.connection_name)))
    }

    /// Creates a producer on a custom transport.
    pub fn with_connector(cfg: &AmqpConfig, connector: Arc<dyn Connector>) -> Result<Self, AmqpError> {
        cfg.validate()?;

        let lifecycle =
            ConnectionLifecycle::new(&cfg.broker_url, connector, cfg.retry_policy(), None);
        if cfg.handle_signals {
            lifecycle.install_shutdown_hooks();
        }

        Ok(AmqpProducer {
            lifecycle,
            cryptographer: Cryptographer::new(&cfg.cryptographic_key),
        })
    }

    pub async fn connect(&self) {
        self.lifecycle.connect().await
    }

    pub async fn close(&self) -> Result<(), AmqpError> {
        self.lifecycle.close().await
    }

    pub fn lifecycle(&self) -> &Arc<ConnectionLifecycle> {
        &self.lifecycle
    }

    /// Serializes, encrypts and publishes `message` on `exchange_name` with
    /// `topic` as routing key.
    ///
    /// Publishing is fire-and-forget: no broker confirmation is awaited.
    pub async fn send_message<M>(
        &self,
        message: &M,
        exchange_name: &str,
        channel_name: &str,
        topic: &str,
    ) -> Result<(), AmqpError>
    where
        M: Serialize + ?Sized,
    {
        validate_topic(topic)?;
        validate_names(exchange_name, channel_name)?;

        let channel = self
            .lifecycle
            .get_or_create_channel(exchange_name, channel_name)
            .await?;

        let serialized = serde_json::to_string(message)
            .map_err(|err| AmqpError::SerializationError(err.to_string()))?;
        let encrypted = self.cryptographer.encrypt(serialized.as_bytes())?;
        let headers = otel::inject_headers(&Context::current());

        channel
            .publish(exchange_name, topic, encrypted.into_bytes(), headers)
            .await?;

        info!(
            payload = %serialized,
            topic,
            exchange = exchange_name,
            channel = channel_name,
            "published message"
        );

        Ok(())
    }
}

/// Rejects topics a producer cannot publish to.
pub fn validate_topic(topic: &str) -> Result<(), AmqpError> {
    if topic.is_empty() {
        return Err(AmqpError::ValidationError("topic is required".to_owned()));
    }

    if topic.contains('*') || topic.contains('#') {
        return Err(AmqpError::ValidationError(
            "topic cannot contain wildcards (*, #) when producing messages".to_owned(),
        ));
    }

    Ok(())
}

pub(crate) fn validate_names(exchange_name: &str, channel_name: &str) -> Result<(), AmqpError> {
    if exchange_name.is_empty() {
        return Err(AmqpError::ValidationError("exchange name is required".to_owned()));
    }

    if channel_name.is_empty() {
        return Err(AmqpError::ValidationError("channel name is required".to_owned()));
    }

    Ok(())
}
