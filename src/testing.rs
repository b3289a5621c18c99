// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker used by the unit tests.
//!
//! Implements the transport traits with topic routing, durable queues that
//! buffer while nobody consumes, round-robin between consumers of a queue and
//! a log of every primitive call. Connections can be dropped to simulate an
//! unsolicited disconnect.

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
use futures_util::{stream, StreamExt};
use std::{
    collections::{HashMap, HashSet, VecDeque},
    future::Future,
    sync::{Arc, Mutex, Weak},
    time::Duration,
};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Event {
    ConnectAttempt,
    Connect(u64),
    CreateChannel { connection: u64, channel: u64 },
    AssertExchange { channel: u64, definition: ExchangeDefinition },
    AssertQueue { channel: u64, name: String },
    BindQueue { channel: u64, binding: QueueBinding },
    Consume { channel: u64, queue: String },
    Publish { exchange: String, routing_key: String },
    Ack(u64),
    CloseChannel(u64),
    CloseConnection(u64),
}

#[derive(Clone)]
struct Message {
    data: Vec<u8>,
    routing_key: String,
    headers: Headers,
}

struct ConsumerSlot {
    connection: u64,
    channel: u64,
    tx: mpsc::UnboundedSender<Result<Incoming, AmqpError>>,
}

#[derive(Default)]
struct QueueState {
    bindings: Vec<(String, String)>,
    consumers: Vec<ConsumerSlot>,
    next: usize,
    backlog: VecDeque<Message>,
}

#[derive(Default)]
struct BrokerState {
    self_ref: Weak<Mutex<BrokerState>>,
    next_connection: u64,
    next_channel: u64,
    next_tag: u64,
    events: Vec<Event>,
    queues: HashMap<String, QueueState>,
    failing_connects: usize,
    listeners: HashMap<u64, CloseListener>,
    dead_connections: HashSet<u64>,
    closed_channels: HashSet<u64>,
    channel_delay: Duration,
    /// Consumers of dropped connections whose streams were left open.
    orphans: Vec<ConsumerSlot>,
}

impl BrokerState {
    fn route(&mut self, exchange: &str, message: Message) {
        let targets: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, queue)| {
                queue.bindings.iter().any(|(bound, pattern)| {
                    bound == exchange && topic_matches(pattern, &message.routing_key)
                })
            })
            .map(|(name, _)| name.clone())
            .collect();

        for name in targets {
            self.deliver(&name, message.clone());
        }
    }

    fn deliver(&mut self, queue_name: &str, message: Message) {
        self.next_tag += 1;
        let tag = self.next_tag;
        let state = self.self_ref.clone();
        let Some(queue) = self.queues.get_mut(queue_name) else {
            return;
        };

        while !queue.consumers.is_empty() {
            let index = queue.next % queue.consumers.len();
            let delivery = MemoryDelivery {
                tag,
                message: message.clone(),
                state: state.clone(),
            };
            if queue.consumers[index].tx.send(Ok(Incoming::Delivery(Box::new(delivery)))).is_ok() {
                queue.next = index + 1;
                return;
            }
            queue.consumers.remove(index);
        }

        queue.backlog.push_back(message);
    }

    fn drop_consumers(&mut self, keep: impl Fn(&ConsumerSlot) -> bool) {
        self.take_consumers(keep);
    }

    fn take_consumers(&mut self, keep: impl Fn(&ConsumerSlot) -> bool) -> Vec<ConsumerSlot> {
        let mut taken = vec![];
        for queue in self.queues.values_mut() {
            let (kept, removed): (Vec<_>, Vec<_>) =
                queue.consumers.drain(..).partition(|slot| keep(slot));
            queue.consumers = kept;
            taken.extend(removed);
        }
        taken
    }
}

/// Returns whether a topic `pattern` (with `*` and `#`) matches `routing_key`.
pub(crate) fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(word), Some(other)) if word == other => matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}

/// Compares two channel handles by identity.
pub(crate) fn same_channel(a: &Arc<dyn BrokerChannel>, b: &Arc<dyn BrokerChannel>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

/// Polls `condition` until it holds, failing the test after two seconds.
pub(crate) async fn eventually<F>(condition: F)
where
    F: Fn() -> bool,
{
    let waited = tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;

    assert!(waited.is_ok(), "condition not met in time");
}

/// Awaits `future`, failing the test after two seconds.
pub(crate) async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(2), future)
        .await
        .expect("timed out")
}

#[derive(Clone)]
pub(crate) struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub(crate) fn new() -> Self {
        MemoryBroker {
            state: Arc::new_cyclic(|weak| {
                Mutex::new(BrokerState {
                    self_ref: weak.clone(),
                    ..BrokerState::default()
                })
            }),
        }
    }

    pub(crate) fn fail_next_connects(&self, attempts: usize) {
        self.state.lock().unwrap().failing_connects = attempts;
    }

    pub(crate) fn set_channel_delay(&self, delay: Duration) {
        self.state.lock().unwrap().channel_delay = delay;
    }

    pub(crate) fn events(&self) -> Vec<Event> {
        self.state.lock().unwrap().events.clone()
    }

    pub(crate) fn count(&self, predicate: impl Fn(&Event) -> bool) -> usize {
        self.state
            .lock()
            .unwrap()
            .events
            .iter()
            .filter(|e| predicate(e))
            .count()
    }

    /// Events recorded after the `index`-th one.
    pub(crate) fn events_since(&self, index: usize) -> Vec<Event> {
        self.state.lock().unwrap().events[index..].to_vec()
    }

    pub(crate) fn acks(&self) -> usize {
        self.count(|e| matches!(e, Event::Ack(_)))
    }

    pub(crate) fn consumers(&self, queue: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .queues
            .get(queue)
            .map(|q| q.consumers.len())
            .unwrap_or_default()
    }

    pub(crate) fn last_connection(&self) -> u64 {
        self.state.lock().unwrap().next_connection
    }

    /// Publishes as an external producer would, bypassing any client.
    pub(crate) fn publish(&self, exchange: &str, routing_key: &str, data: Vec<u8>) {
        let mut state = self.state.lock().unwrap();
        state.events.push(Event::Publish {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
        });
        state.route(
            exchange,
            Message {
                data,
                routing_key: routing_key.to_owned(),
                headers: Headers::default(),
            },
        );
    }

    /// Simulates the broker dropping `connection`.
    pub(crate) fn drop_connection(&self, connection: u64) {
        self.kill_connection(connection, false);
    }

    /// Drops `connection` but leaves its consumer streams open, so a late
    /// cancellation can still be pushed through them.
    pub(crate) fn drop_connection_leaving_streams(&self, connection: u64) {
        self.kill_connection(connection, true);
    }

    fn kill_connection(&self, connection: u64, leave_streams: bool) {
        let listener = {
            let mut state = self.state.lock().unwrap();
            state.dead_connections.insert(connection);
            let taken = state.take_consumers(|slot| slot.connection != connection);
            if leave_streams {
                state.orphans.extend(taken);
            }
            state.listeners.remove(&connection)
        };

        if let Some(listener) = listener {
            listener(CloseReason("connection reset by peer".to_owned()));
        }
    }

    /// Simulates a broker-side cancel of every consumer of `queue`. Each
    /// stream yields a cancellation and then ends.
    pub(crate) fn cancel_consumers(&self, queue: &str) {
        let mut state = self.state.lock().unwrap();
        let slots = match state.queues.get_mut(queue) {
            Some(queue) => std::mem::take(&mut queue.consumers),
            None => vec![],
        };
        for slot in slots {
            let _ = slot.tx.send(Ok(Incoming::Cancelled));
        }
    }

    /// Pushes a cancellation through the streams left open by
    /// [`MemoryBroker::drop_connection_leaving_streams`] and ends them.
    pub(crate) fn cancel_orphaned_consumers(&self) {
        let orphans = std::mem::take(&mut self.state.lock().unwrap().orphans);
        for slot in orphans {
            let _ = slot.tx.send(Ok(Incoming::Cancelled));
        }
    }

}

#[async_trait]
impl Connector for MemoryBroker {
    async fn connect(&self, _url: &str) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        let mut state = self.state.lock().unwrap();
        state.events.push(Event::ConnectAttempt);
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(AmqpError::ConnectionError("connection refused".to_owned()));
        }

        state.next_connection += 1;
        let id = state.next_connection;
        state.events.push(Event::Connect(id));

        Ok(Arc::new(MemoryConnection {
            id,
            broker: self.clone(),
        }))
    }
}

struct MemoryConnection {
    id: u64,
    broker: MemoryBroker,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let delay = self.broker.state.lock().unwrap().channel_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.broker.state.lock().unwrap();
        if state.dead_connections.contains(&self.id) {
            return Err(AmqpError::ChannelError("connection is closed".to_owned()));
        }

        state.next_channel += 1;
        let id = state.next_channel;
        state.events.push(Event::CreateChannel {
            connection: self.id,
            channel: id,
        });

        Ok(Arc::new(MemoryChannel {
            id,
            connection: self.id,
            broker: self.broker.clone(),
        }))
    }

    fn on_close(&self, listener: CloseListener) {
        self.broker
            .state
            .lock()
            .unwrap()
            .listeners
            .insert(self.id, listener);
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let listener = {
            let mut state = self.broker.state.lock().unwrap();
            if !state.dead_connections.insert(self.id) {
                return Err(AmqpError::CloseError("connection already closed".to_owned()));
            }
            state.events.push(Event::CloseConnection(self.id));
            let id = self.id;
            state.drop_consumers(|slot| slot.connection != id);
            state.listeners.remove(&self.id)
        };

        // Like a real client library, a requested close is still a termination.
        if let Some(listener) = listener {
            listener(CloseReason("closed by client".to_owned()));
        }

        Ok(())
    }
}

struct MemoryChannel {
    id: u64,
    connection: u64,
    broker: MemoryBroker,
}

impl MemoryChannel {
    fn ensure_open(&self, state: &BrokerState) -> Result<(), AmqpError> {
        if state.dead_connections.contains(&self.connection) || state.closed_channels.contains(&self.id) {
            return Err(AmqpError::ChannelError("channel is closed".to_owned()));
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn assert_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        let mut state = self.broker.state.lock().unwrap();
        self.ensure_open(&state)?;
        state.events.push(Event::AssertExchange {
            channel: self.id,
            definition: def.clone(),
        });
        Ok(())
    }

    async fn assert_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        let mut state = self.broker.state.lock().unwrap();
        self.ensure_open(&state)?;
        state.events.push(Event::AssertQueue {
            channel: self.id,
            name: def.name().to_owned(),
        });
        state.queues.entry(def.name().to_owned()).or_default();
        Ok(())
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        let mut state = self.broker.state.lock().unwrap();
        self.ensure_open(&state)?;
        state.events.push(Event::BindQueue {
            channel: self.id,
            binding: binding.clone(),
        });

        let Some(queue) = state.queues.get_mut(binding.queue_name()) else {
            return Err(AmqpError::BindingExchangeToQueueError(
                binding.exchange_name().to_owned(),
                binding.queue_name().to_owned(),
            ));
        };
        let bound = (
            binding.exchange_name().to_owned(),
            binding.key().to_owned(),
        );
        if !queue.bindings.contains(&bound) {
            queue.bindings.push(bound);
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
        headers: Headers,
    ) -> Result<(), AmqpError> {
        let mut state = self.broker.state.lock().unwrap();
        self.ensure_open(&state)?;
        state.events.push(Event::Publish {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
        });
        state.route(
            exchange,
            Message {
                data: payload,
                routing_key: routing_key.to_owned(),
                headers,
            },
        );
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream, AmqpError> {
        let mut state = self.broker.state.lock().unwrap();
        self.ensure_open(&state)?;
        state.events.push(Event::Consume {
            channel: self.id,
            queue: queue.to_owned(),
        });

        let (tx, rx) = mpsc::unbounded_channel();
        let Some(queue_state) = state.queues.get_mut(queue) else {
            return Err(AmqpError::BindingConsumerError(queue.to_owned()));
        };
        queue_state.consumers.push(ConsumerSlot {
            connection: self.connection,
            channel: self.id,
            tx,
        });

        let backlog: Vec<Message> = queue_state.backlog.drain(..).collect();
        for message in backlog {
            state.deliver(queue, message);
        }

        let deliveries = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(deliveries.boxed())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let mut state = self.broker.state.lock().unwrap();
        state.closed_channels.insert(self.id);
        state.events.push(Event::CloseChannel(self.id));
        let id = self.id;
        state.drop_consumers(|slot| slot.channel != id);
        Ok(())
    }
}

struct MemoryDelivery {
    tag: u64,
    message: Message,
    state: Weak<Mutex<BrokerState>>,
}

#[async_trait]
impl BrokerDelivery for MemoryDelivery {
    fn data(&self) -> &[u8] {
        &self.message.data
    }

    fn routing_key(&self) -> &str {
        &self.message.routing_key
    }

    fn headers(&self) -> Headers {
        self.message.headers.clone()
    }

    async fn ack(&self) -> Result<(), AmqpError> {
        let Some(state) = self.state.upgrade() else {
            return Err(AmqpError::AckMessageError);
        };
        state.lock().unwrap().events.push(Event::Ack(self.tag));
        Ok(())
    }
}
