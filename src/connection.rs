// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Lifecycle
//!
//! `ConnectionLifecycle` owns the single broker connection of a client and the
//! channel registry built on top of it. It connects through the retry policy,
//! watches for unsolicited closure and reconnects, then hands control to a
//! [`ReconnectHook`] so producers and consumers can restore their state.
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> (unsolicited close) -> Connecting -> Connected
//!                                   \-> Closing -> Disconnected
//! ```
//!
//! `close()` disables auto-reconnect until the next `connect()`. It also stops
//! a reconnection that is still retrying, and a connection established after
//! the close was requested is closed instead of being kept. Close listeners
//! check the generation of the connection they were installed on, so late
//! notifications from a replaced connection are ignored.

use crate::{
    config::redact_url,
    errors::AmqpError,
    registry::ChannelRegistry,
    retry::RetryPolicy,
    transport::{BrokerChannel, BrokerConnection, CloseReason, Connector},
};
use async_trait::async_trait;
use futures_util::future::join_all;
use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Weak,
    },
};
use tokio::{
    runtime::Handle,
    sync::{watch, Mutex, RwLock},
};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

/// Reacts to a completed reconnection.
///
/// Runs after the new connection is in place and the channel cache has been
/// emptied, so channels requested from `lifecycle` are created on the new
/// connection.
#[async_trait]
pub trait ReconnectHook: Send + Sync {
    async fn on_reconnected(&self, lifecycle: &ConnectionLifecycle);
}

struct ActiveConnection {
    connection: Arc<dyn BrokerConnection>,
    generation: u64,
}

pub struct ConnectionLifecycle {
    url: String,
    connector: Arc<dyn Connector>,
    retry: RetryPolicy,
    hook: Option<Arc<dyn ReconnectHook>>,
    registry: ChannelRegistry,
    connection: RwLock<Option<ActiveConnection>>,
    connect_lock: Mutex<()>,
    generation: AtomicU64,
    /// Set by `close()`, cleared by `connect()`.
    auto_reconnect_disabled: watch::Sender<bool>,
    shutdown_hooks_installed: AtomicBool,
    state: watch::Sender<ConnectionState>,
    reconnections: watch::Sender<u64>,
    me: Weak<ConnectionLifecycle>,
}

impl ConnectionLifecycle {
    pub fn new(
        url: &str,
        connector: Arc<dyn Connector>,
        retry: RetryPolicy,
        hook: Option<Arc<dyn ReconnectHook>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| ConnectionLifecycle {
            url: url.to_owned(),
            connector,
            retry,
            hook,
            registry: ChannelRegistry::new(),
            connection: RwLock::new(None),
            connect_lock: Mutex::new(()),
            generation: AtomicU64::new(0),
            auto_reconnect_disabled: watch::channel(false).0,
            shutdown_hooks_installed: AtomicBool::new(false),
            state: watch::channel(ConnectionState::Disconnected).0,
            reconnections: watch::channel(0).0,
            me: me.clone(),
        })
    }

    /// Connects to the broker, retrying until it succeeds or `close()` is
    /// called.
    ///
    /// Does nothing when a connection is already active.
    pub async fn connect(&self) {
        self.auto_reconnect_disabled.send_replace(false);
        self.establish().await;
    }

    fn is_stopped(&self) -> bool {
        *self.auto_reconnect_disabled.borrow()
    }

    /// Returns whether a connection is active once it completes.
    async fn establish(&self) -> bool {
        let _guard = self.connect_lock.lock().await;
        if self.connection.read().await.is_some() {
            debug!("already connected");
            return true;
        }

        let mut stopped = self.auto_reconnect_disabled.subscribe();
        if self.is_stopped() {
            debug!("close requested, not connecting");
            return false;
        }

        self.state.send_replace(ConnectionState::Connecting);
        let url = redact_url(&self.url);
        info!(url = %url, "connecting");

        let connection = tokio::select! {
            biased;

            connection = self.retry.retry_until_success(|| {
                let connector = self.connector.clone();
                let url = self.url.clone();
                async move { connector.connect(&url).await }
            }) => connection,

            _ = until_stopped(&mut stopped) => {
                info!("close requested, connection attempts stopped");
                self.state.send_replace(ConnectionState::Disconnected);
                return false;
            }
        };

        // Channels of a previous connection are unusable.
        self.registry.reset().await;

        let mut current = self.connection.write().await;
        if self.is_stopped() {
            drop(current);
            info!("close requested while connecting, closing the new connection");
            if let Err(err) = connection.close().await {
                warn!(error = %err, "failure to close the new connection");
            }
            self.state.send_replace(ConnectionState::Disconnected);
            return false;
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.install_close_listener(connection.as_ref(), generation);
        *current = Some(ActiveConnection {
            connection,
            generation,
        });
        drop(current);

        self.state.send_replace(ConnectionState::Connected);
        info!(url = %url, "connected");
        true
    }

    fn install_close_listener(&self, connection: &dyn BrokerConnection, generation: u64) {
        let me = self.me.clone();
        let handle = Handle::current();

        connection.on_close(Box::new(move |reason| {
            if let Some(lifecycle) = me.upgrade() {
                handle.spawn(async move { lifecycle.handle_close(generation, reason).await });
            }
        }));
    }

    async fn handle_close(self: Arc<Self>, generation: u64, reason: CloseReason) {
        if self.is_stopped() {
            debug!(reason = %reason, "connection closed on request");
            return;
        }

        {
            let mut current = self.connection.write().await;
            match current.as_ref() {
                Some(active) if active.generation == generation => {
                    current.take();
                    self.state.send_replace(ConnectionState::Connecting);
                }
                _ => {
                    debug!(reason = %reason, "ignoring close of a replaced connection");
                    return;
                }
            }
        }

        error!(reason = %reason, "disconnected: retry connection until success");
        if !self.establish().await || self.is_stopped() {
            info!("reconnection abandoned, client closed");
            return;
        }

        if let Some(hook) = &self.hook {
            hook.on_reconnected(&self).await;
        }

        self.reconnections.send_modify(|count| *count += 1);
        info!("reconnected");
    }

    /// Returns the channel for `(exchange_name, channel_name)` on the current
    /// connection, creating it on first use.
    ///
    /// Fails with [`AmqpError::NotConnected`] when no connection is active.
    pub async fn get_or_create_channel(
        &self,
        exchange_name: &str,
        channel_name: &str,
    ) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        self.channel_with_generation(exchange_name, channel_name)
            .await
            .map(|(channel, _)| channel)
    }

    /// Like [`Self::get_or_create_channel`], also returning the generation of
    /// the connection the channel belongs to.
    pub(crate) async fn channel_with_generation(
        &self,
        exchange_name: &str,
        channel_name: &str,
    ) -> Result<(Arc<dyn BrokerChannel>, u64), AmqpError> {
        let (connection, generation) = self
            .connection
            .read()
            .await
            .as_ref()
            .map(|active| (active.connection.clone(), active.generation))
            .ok_or(AmqpError::NotConnected)?;

        let channel = self
            .registry
            .get_or_create_channel(&connection, exchange_name, channel_name)
            .await?;

        Ok((channel, generation))
    }

    /// Generation of the active connection. Every established connection
    /// gets a new one.
    pub async fn active_generation(&self) -> Option<u64> {
        self.connection
            .read()
            .await
            .as_ref()
            .map(|active| active.generation)
    }

    /// Closes every open channel, then the connection.
    ///
    /// Also stops a reconnection in progress. Calling it without an active
    /// connection is otherwise a no-op.
    pub async fn close(&self) -> Result<(), AmqpError> {
        self.auto_reconnect_disabled.send_replace(true);

        let Some(active) = self.connection.write().await.take() else {
            self.state.send_replace(ConnectionState::Disconnected);
            debug!("close requested without an active connection");
            return Ok(());
        };

        info!("disconnecting");
        self.state.send_replace(ConnectionState::Closing);

        let channels = self.registry.drain().await;
        let closed = join_all(channels.iter().map(|channel| channel.close())).await;
        for result in closed {
            if let Err(err) = result {
                warn!(error = %err, "failure to close channel");
            }
        }

        let result = active.connection.close().await;

        self.state.send_replace(ConnectionState::Disconnected);
        info!("disconnected");

        result
    }

    /// Closes the client on SIGINT (and SIGTERM on unix).
    ///
    /// Installed at most once per instance; requires a running tokio runtime.
    pub fn install_shutdown_hooks(&self) {
        self.close_on(shutdown_signal());
    }

    /// Closes the client once `shutdown` resolves to `true`. Only the first
    /// call per instance installs a hook.
    pub(crate) fn close_on<F>(&self, shutdown: F)
    where
        F: Future<Output = bool> + Send + 'static,
    {
        if self.shutdown_hooks_installed.swap(true, Ordering::SeqCst) {
            return;
        }

        let Ok(handle) = Handle::try_current() else {
            warn!("no tokio runtime available, shutdown hooks not installed");
            self.shutdown_hooks_installed.store(false, Ordering::SeqCst);
            return;
        };

        handle.spawn(close_when(self.me.clone(), shutdown));
    }

    pub(crate) fn downgrade(&self) -> Weak<ConnectionLifecycle> {
        self.me.clone()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Counts completed reconnections, each including its hook.
    pub fn watch_reconnections(&self) -> watch::Receiver<u64> {
        self.reconnections.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }
}

async fn until_stopped(stopped: &mut watch::Receiver<bool>) {
    loop {
        let is_stopped = *stopped.borrow_and_update();
        if is_stopped || stopped.changed().await.is_err() {
            return;
        }
    }
}

async fn close_when<F>(lifecycle: Weak<ConnectionLifecycle>, shutdown: F)
where
    F: Future<Output = bool>,
{
    if !shutdown.await {
        return;
    }

    if let Some(lifecycle) = lifecycle.upgrade() {
        info!("shutdown signal received");
        if let Err(err) = lifecycle.close().await {
            error!(error = %err, "failure to close on shutdown");
        }
    }
}

/// Resolves `true` once the process is asked to stop.
async fn shutdown_signal() -> bool {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(err) => {
                error!(error = %err, "failure to register SIGTERM handler");
                return false;
            }
        };

        tokio::select! {
            result = tokio::signal::ctrl_c() => result.is_ok(),
            _ = sigterm.recv() => true,
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.is_ok()
    }
}
