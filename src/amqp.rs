// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Lapin Transport
//!
//! This module backs the transport traits with a real AMQP 0-9-1 connection
//! through lapin. It establishes connections, creates channels, declares
//! exchanges and queues, publishes with JSON content type and a unique
//! message id, and exposes lapin consumers as delivery streams.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
    transport::{
        BrokerChannel, BrokerConnection, BrokerDelivery, CloseListener, CloseReason, Connector,
        DeliveryStream, Headers, Incoming,
    },
};
use async_trait::async_trait;
use futures_util::{future, stream, StreamExt};
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};
use tracing::{debug, error};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Reply code sent when a channel or connection is closed on request.
const REPLY_SUCCESS: u16 = 200;

/// Opens lapin connections.
#[derive(Debug, Clone)]
pub struct LapinConnector {
    connection_name: String,
}

impl LapinConnector {
    /// Creates a connector announcing `connection_name` to the broker.
    pub fn new(connection_name: &str) -> Self {
        LapinConnector {
            connection_name: connection_name.to_owned(),
        }
    }
}

#[async_trait]
impl Connector for LapinConnector {
    async fn connect(&self, url: &str) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.connection_name.clone()));

        match Connection::connect(url, options).await {
            Ok(conn) => {
                debug!("amqp connected");
                Ok(Arc::new(LapinConnection::new(conn)))
            }
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
        }
    }
}

/// A lapin connection with a one-shot close listener slot.
pub struct LapinConnection {
    conn: Connection,
    listener: Arc<Mutex<Option<CloseListener>>>,
}

impl LapinConnection {
    fn new(conn: Connection) -> Self {
        let listener: Arc<Mutex<Option<CloseListener>>> = Arc::new(Mutex::new(None));

        let slot = listener.clone();
        conn.on_error(move |err| {
            let taken = match slot.lock() {
                Ok(mut guard) => guard.take(),
                Err(_) => None,
            };
            if let Some(listener) = taken {
                listener(CloseReason(err.to_string()));
            }
        });

        LapinConnection { conn, listener }
    }
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        debug!("creating amqp channel...");
        match self.conn.create_channel().await {
            Ok(channel) => {
                debug!("channel created");
                Ok(Arc::new(LapinChannel { channel }))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }
    }

    fn on_close(&self, listener: CloseListener) {
        if let Ok(mut guard) = self.listener.lock() {
            *guard = Some(listener);
        }
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.conn
            .close(REPLY_SUCCESS, "closing")
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to close the connection");
                AmqpError::CloseError(err.to_string())
            })
    }
}

/// A lapin channel.
pub struct LapinChannel {
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn assert_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        debug!("creating exchange: {}", def.name);

        match self
            .channel
            .exchange_declare(
                &def.name,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: def.durable,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = %def.name,
                    "error to declare the exchange"
                );
                Err(AmqpError::DeclareExchangeError(def.name.clone()))
            }
            _ => Ok(()),
        }
    }

    async fn assert_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        debug!("creating queue: {}", def.name);

        match self
            .channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    durable: def.durable,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name = %def.name, "error to declare the queue");
                Err(AmqpError::DeclareQueueError(def.name.clone()))
            }
            _ => Ok(()),
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        match self
            .channel
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name.clone(),
                    binding.queue_name.clone(),
                ))
            }
            _ => Ok(()),
        }
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
        headers: Headers,
    ) -> Result<(), AmqpError> {
        let btree: BTreeMap<ShortString, AMQPValue> = headers
            .into_iter()
            .map(|(key, value)| {
                (
                    ShortString::from(key),
                    AMQPValue::LongString(LongString::from(value)),
                )
            })
            .collect();

        match self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                &payload,
                BasicProperties::default()
                    .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
                    .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
                    .with_headers(FieldTable::from(btree)),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError(err.to_string()))
            }
            _ => Ok(()),
        }
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream, AmqpError> {
        let consumer_tag = format!("{}-{}", queue, Uuid::new_v4());

        let consumer = match self
            .channel
            .basic_consume(
                queue,
                &consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::BindingConsumerError(queue.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        // lapin ends the stream both when the broker cancels the consumer and
        // when the channel goes away. Only the former leaves the channel open.
        let channel = self.channel.clone();
        let cancelled = stream::once(async move { channel.status().connected() })
            .filter_map(|open| future::ready(open.then_some(Ok(Incoming::Cancelled))));

        let deliveries = consumer
            .map(|result| match result {
                Ok(delivery) => Ok(Incoming::Delivery(Box::new(LapinDelivery::new(delivery)))),
                Err(err) => Err(AmqpError::ConsumerError(err.to_string())),
            })
            .chain(cancelled);

        Ok(deliveries.boxed())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.channel
            .close(REPLY_SUCCESS, "closing")
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to close the channel");
                AmqpError::CloseError(err.to_string())
            })
    }
}

/// A lapin delivery with its string headers extracted once.
struct LapinDelivery {
    delivery: Delivery,
    headers: Headers,
}

impl LapinDelivery {
    fn new(delivery: Delivery) -> Self {
        let headers = extract_headers(&delivery.properties);
        LapinDelivery { delivery, headers }
    }
}

#[async_trait]
impl BrokerDelivery for LapinDelivery {
    fn data(&self) -> &[u8] {
        &self.delivery.data
    }

    fn routing_key(&self) -> &str {
        self.delivery.routing_key.as_str()
    }

    fn headers(&self) -> Headers {
        self.headers.clone()
    }

    async fn ack(&self) -> Result<(), AmqpError> {
        self.delivery
            .ack(BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }
}

/// Keeps the string-valued headers of a delivery.
fn extract_headers(props: &BasicProperties) -> Headers {
    let Some(table) = props.headers() else {
        return Headers::default();
    };

    table
        .inner()
        .iter()
        .filter_map(|(key, value)| match value {
            AMQPValue::LongString(value) => std::str::from_utf8(value.as_bytes())
                .map_err(|e| error!("Error decoding header value {:?}", e))
                .ok()
                .map(|value| (key.to_string(), value.to_owned())),
            AMQPValue::ShortString(value) => Some((key.to_string(), value.to_string())),
            _ => None,
        })
        .collect()
}
