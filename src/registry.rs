// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Channel Registry
//!
//! Channels are cached per exchange and per channel name. The first request
//! for a pair opens a channel on the current connection and asserts the
//! exchange as a durable topic exchange; later requests get the cached handle.
//!
//! Concurrent requests for the same new pair converge on one creation: each
//! pair owns a `OnceCell` and only the caller that initializes it talks to the
//! broker. A failed creation leaves the cell empty so the next call retries.
//!
//! `drain()` and `reset()` start a new epoch. A request that spans an epoch
//! change closes the channel it got and fails, so a channel created while the
//! cache was being drained is never left open.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    topology::AmqpTopology,
    transport::{BrokerChannel, BrokerConnection},
};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tokio::sync::{Mutex, OnceCell};
use tracing::{info, warn};

type ChannelCell = Arc<OnceCell<Arc<dyn BrokerChannel>>>;

/// Channels opened for one exchange, keyed by channel name.
#[derive(Default)]
struct Exchange {
    channels: HashMap<String, ChannelCell>,
}

#[derive(Default)]
pub struct ChannelRegistry {
    exchanges: Mutex<HashMap<String, Exchange>>,
    epoch: AtomicU64,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        ChannelRegistry::default()
    }

    /// Returns the channel for `(exchange_name, channel_name)`, creating it on
    /// `connection` the first time.
    pub async fn get_or_create_channel(
        &self,
        connection: &Arc<dyn BrokerConnection>,
        exchange_name: &str,
        channel_name: &str,
    ) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let (cell, epoch) = {
            let mut exchanges = self.exchanges.lock().await;
            let cell = exchanges
                .entry(exchange_name.to_owned())
                .or_default()
                .channels
                .entry(channel_name.to_owned())
                .or_default()
                .clone();
            (cell, self.epoch.load(Ordering::SeqCst))
        };

        let channel = cell
            .get_or_try_init(|| async {
                info!(
                    exchange = exchange_name,
                    channel = channel_name,
                    "creating channel"
                );
                let channel = connection.create_channel().await?;
                info!(channel = channel_name, "channel created");

                AmqpTopology::new(channel.as_ref())
                    .exchange(ExchangeDefinition::durable_topic(exchange_name))
                    .install()
                    .await?;

                info!(
                    exchange = exchange_name,
                    channel = channel_name,
                    "channel plugged to exchange"
                );

                Ok::<_, AmqpError>(channel)
            })
            .await?
            .clone();

        if self.epoch.load(Ordering::SeqCst) != epoch {
            warn!(
                exchange = exchange_name,
                channel = channel_name,
                "registry drained while creating channel, closing it"
            );
            if let Err(err) = channel.close().await {
                warn!(error = %err, "failure to close channel");
            }
            return Err(AmqpError::ChannelError(
                "connection closed while creating channel".to_owned(),
            ));
        }

        Ok(channel)
    }

    /// Removes every cached channel and returns the ones that were opened.
    ///
    /// Channels still being created are closed by their requester.
    pub async fn drain(&self) -> Vec<Arc<dyn BrokerChannel>> {
        let exchanges = {
            let mut exchanges = self.exchanges.lock().await;
            self.epoch.fetch_add(1, Ordering::SeqCst);
            std::mem::take(&mut *exchanges)
        };

        exchanges
            .into_values()
            .flat_map(|exchange| exchange.channels.into_values())
            .filter_map(|cell| cell.get().cloned())
            .collect()
    }

    /// Forgets every cached channel without closing them.
    pub async fn reset(&self) {
        let mut exchanges = self.exchanges.lock().await;
        self.epoch.fetch_add(1, Ordering::SeqCst);
        exchanges.clear();
    }

    /// Number of opened channels across all exchanges.
    pub async fn len(&self) -> usize {
        self.exchanges
            .lock()
            .await
            .values()
            .flat_map(|exchange| exchange.channels.values())
            .filter(|cell| cell.initialized())
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
