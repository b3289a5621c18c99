// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Resilient AMQP messaging over topic exchanges.
//!
//! A client keeps one broker connection, caches one channel per exchange and
//! channel name, reconnects on unsolicited closure and, for consumers, replays
//! every registered subscription on the new connection. Payloads are
//! encrypted with a shared key.

mod delivery;
mod otel;
#[cfg(test)]
mod testing;

pub mod amqp;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod crypto;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod publisher;
pub mod queue;
pub mod registry;
pub mod retry;
pub mod topology;
pub mod transport;
