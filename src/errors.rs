// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Resilient AMQP Client
//!
//! This module provides the error type shared by every layer of the crate.
//! The `AmqpError` enum represents all failure scenarios that can occur while
//! connecting, managing channels, asserting topology, publishing and consuming.

use thiserror::Error;

/// Error returned by message handlers registered on a consumer.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Represents errors that can occur during AMQP operations.
///
/// Transient connectivity failures are absorbed by the retry policy and only
/// reach callers through logs. Programmer errors such as requesting a channel
/// before connecting surface immediately.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Error establishing a connection to the broker
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// A channel was requested while no connection is active
    #[error("no active connection, call connect() first")]
    NotConnected,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error starting a consumer on a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error publishing a message
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// Caller supplied arguments that can never succeed
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Error serializing an outgoing message
    #[error("failure to serialize message: {0}")]
    SerializationError(String),

    /// Error encrypting a payload
    #[error("failure to encrypt payload")]
    EncryptionError,

    /// Error decrypting a payload
    #[error("failure to decrypt payload: {0}")]
    DecryptionError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// The registered handler returned an error
    #[error("handler failure: {0}")]
    HandlerError(String),

    /// Error reported by a consumer stream
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// Error closing a channel or the connection
    #[error("failure to close: {0}")]
    CloseError(String),

    /// Invalid or missing configuration
    #[error("invalid configuration: {0}")]
    ConfigError(String),
}
