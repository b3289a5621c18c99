// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Consumer
//!
//! `AmqpConsumer` keeps an ordered list of subscription intents (exchange,
//! channel, topic, handler). An intent is recorded once its subscription is
//! in place and is replayed, in registration order, after every reconnection
//! so bindings and consumers survive connection loss.
//!
//! Each intent remembers the connection generation it was last subscribed on.
//! Replay skips intents already running on the new connection, so a handler
//! registered while a reconnection completes is not subscribed twice.
//!
//! Messages of one channel are handled one at a time in delivery order, even
//! when several topics share the channel. Different channels run concurrently.
//!
//! Registering the same `(exchange, channel, topic)` twice keeps both intents:
//! the queue and its binding are asserted twice and the broker distributes the
//! queue's messages between the two handlers.

use crate::{
    amqp::LapinConnector,
    config::AmqpConfig,
    connection::{ConnectionLifecycle, ReconnectHook},
    crypto::Cryptographer,
    delivery::{self, Subscription},
    errors::AmqpError,
    handler::ConsumerHandler,
    publisher::validate_names,
    topology::init_queue,
    transport::{Connector, Incoming},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use opentelemetry::global;
use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info};

#[derive(Clone)]
struct SubscriptionIntent {
    exchange_name: String,
    channel_name: String,
    topic: String,
    handler: Arc<dyn ConsumerHandler>,
    /// Connection generation the intent was last subscribed on.
    generation: u64,
}

type DispatchLock = Arc<Mutex<()>>;

struct ConsumerState {
    intents: RwLock<Vec<SubscriptionIntent>>,
    cryptographer: Cryptographer,
    dispatch_locks: Mutex<HashMap<(String, String), DispatchLock>>,
}

impl ConsumerState {
    async fn dispatch_lock(&self, exchange_name: &str, channel_name: &str) -> DispatchLock {
        self.dispatch_locks
            .lock()
            .await
            .entry((exchange_name.to_owned(), channel_name.to_owned()))
            .or_default()
            .clone()
    }

    /// Binds the intent's queue on the current connection and starts
    /// consuming from it. Returns the generation of that connection.
    async fn subscribe(
        &self,
        lifecycle: &ConnectionLifecycle,
        intent: &SubscriptionIntent,
    ) -> Result<u64, AmqpError> {
        let (channel, generation) = lifecycle
            .channel_with_generation(&intent.exchange_name, &intent.channel_name)
            .await?;

        let queue = init_queue(channel.as_ref(), &intent.exchange_name, &intent.topic).await?;
        let mut deliveries = channel.consume(&queue).await?;

        let dispatch = self
            .dispatch_lock(&intent.exchange_name, &intent.channel_name)
            .await;
        let sub = Subscription {
            exchange: intent.exchange_name.clone(),
            channel: intent.channel_name.clone(),
            topic: intent.topic.clone(),
            queue,
            handler: intent.handler.clone(),
            cryptographer: self.cryptographer.clone(),
        };

        info!(
            exchange = %sub.exchange,
            channel = %sub.channel,
            topic = %sub.topic,
            queue = %sub.queue,
            generation,
            "consuming"
        );

        let lifecycle = lifecycle.downgrade();
        tokio::spawn(async move {
            let tracer = global::tracer("amqp consumer");

            while let Some(result) = deliveries.next().await {
                match result {
                    Ok(Incoming::Cancelled) => {
                        if !is_current(&lifecycle, generation).await {
                            debug!(queue = %sub.queue, "ignoring cancellation of a replaced connection");
                            continue;
                        }
                        let _turn = dispatch.lock().await;
                        if let Err(err) = delivery::process(&tracer, Incoming::Cancelled, &sub).await {
                            error!(error = %err, queue = %sub.queue, "error consume msg");
                        }
                    }
                    Ok(incoming) => {
                        let _turn = dispatch.lock().await;
                        if let Err(err) = delivery::process(&tracer, incoming, &sub).await {
                            error!(error = %err, queue = %sub.queue, "error consume msg");
                        }
                    }
                    Err(err) => error!(error = %err, queue = %sub.queue, "errors consume msg"),
                }
            }

            debug!(queue = %sub.queue, "consumer stream ended");
        });

        Ok(generation)
    }
}

/// Whether the lifecycle is still connected on `generation`.
async fn is_current(lifecycle: &Weak<ConnectionLifecycle>, generation: u64) -> bool {
    let Some(lifecycle) = lifecycle.upgrade() else {
        return false;
    };

    lifecycle.is_connected() && lifecycle.active_generation().await == Some(generation)
}

#[async_trait]
impl ReconnectHook for ConsumerState {
    async fn on_reconnected(&self, lifecycle: &ConnectionLifecycle) {
        let current = lifecycle.active_generation().await;
        let mut intents = self.intents.write().await;
        info!(subscriptions = intents.len(), "replaying subscriptions");

        for intent in intents.iter_mut() {
            if Some(intent.generation) == current {
                debug!(topic = %intent.topic, "subscription already on the current connection");
                continue;
            }

            match self.subscribe(lifecycle, intent).await {
                Ok(generation) => intent.generation = generation,
                Err(err) => error!(
                    error = %err,
                    exchange = %intent.exchange_name,
                    channel = %intent.channel_name,
                    topic = %intent.topic,
                    "failure to replay subscription"
                ),
            }
        }
    }
}

/// Consumes encrypted messages and restores its subscriptions after a
/// reconnection.
pub struct AmqpConsumer {
    lifecycle: Arc<ConnectionLifecycle>,
    state: Arc<ConsumerState>,
}

impl AmqpConsumer {
    /// Creates a consumer backed by lapin.
    pub fn new(cfg: &AmqpConfig) -> Result<Self, AmqpError> {
        Self::with_connector(cfg, Arc::new(LapinConnector::new(&cfg.connection_name)))
    }

    /// Creates a consumer on a custom transport.
    pub fn with_connector(cfg: &AmqpConfig, connector: Arc<dyn Connector>) -> Result<Self, AmqpError> {
        cfg.validate()?;

        let state = Arc::new(ConsumerState {
            intents: RwLock::new(vec![]),
            cryptographer: Cryptographer::new(&cfg.cryptographic_key),
            dispatch_locks: Mutex::new(HashMap::new()),
        });

        let lifecycle = ConnectionLifecycle::new(
            &cfg.broker_url,
            connector,
            cfg.retry_policy(),
            Some(state.clone() as Arc<dyn ReconnectHook>),
        );
        if cfg.handle_signals {
            lifecycle.install_shutdown_hooks();
        }

        Ok(AmqpConsumer { lifecycle, state })
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

    /// Number of registered subscription intents.
    pub async fn subscriptions(&self) -> usize {
        self.state.intents.read().await.len()
    }

    /// Registers `handler` for messages matching `topic` and starts consuming.
    ///
    /// `topic` may contain the `*` and `#` wildcards. The intent is recorded
    /// only when the subscription succeeds; after an error nothing is kept and
    /// the caller may register again.
    pub async fn add_handler<H>(
        &self,
        exchange_name: &str,
        channel_name: &str,
        topic: &str,
        handler: H,
    ) -> Result<(), AmqpError>
    where
        H: ConsumerHandler + 'static,
    {
        validate_names(exchange_name, channel_name)?;
        if topic.is_empty() {
            return Err(AmqpError::ValidationError("topic is required".to_owned()));
        }

        let mut intent = SubscriptionIntent {
            exchange_name: exchange_name.to_owned(),
            channel_name: channel_name.to_owned(),
            topic: topic.to_owned(),
            handler: Arc::new(handler),
            generation: 0,
        };

        // Held across the subscription so a concurrent replay sees either
        // nothing or the intent with its generation.
        let mut intents = self.state.intents.write().await;
        intent.generation = self.state.subscribe(&self.lifecycle, &intent).await?;
        intents.push(intent);

        Ok(())
    }
}
