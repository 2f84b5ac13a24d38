// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Lifecycle
//!
//! The `ConnectionManager` owns the broker connection and its channel pool.
//!
//! ```text
//! Disconnected -> Connecting -> Connected
//! Connected -> Reconnecting -> Connected       (reconnect succeeded)
//! Reconnecting -> Disconnected                 (backoff budget exhausted)
//! any -> Closed                                (explicit close, terminal)
//! ```
//!
//! When auto-reconnect is enabled a watcher task waits for the connection to
//! fail and drives a bounded exponential-backoff reconnect. Each watcher runs
//! under its own cancellation token, replaced together with the connection.

use crate::{
    backoff::ExponentialBackoff,
    broker::{BrokerConnection, CloseEvent},
    channel::ChannelPool,
    config::Config,
    errors::AmqpError,
    otel::Telemetry,
    strategy::Connector,
};
use parking_lot::RwLock;
use std::{
    fmt,
    sync::{Arc, Weak},
};
use tokio::sync::{watch, Mutex, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

struct Inner {
    state: ConnectionState,
    connection: Option<Arc<dyn BrokerConnection>>,
    pool: Option<Arc<ChannelPool>>,
    watcher: Option<CancellationToken>,
    reconnecting: bool,
}

pub struct ConnectionManager {
    config: Arc<Config>,
    connector: Arc<dyn Connector>,
    telemetry: Telemetry,
    inner: RwLock<Inner>,
    connect_lock: Mutex<()>,
    shutdown: CancellationToken,
    close_once: OnceCell<Result<(), AmqpError>>,
}

impl ConnectionManager {
    pub fn new(
        config: Arc<Config>,
        connector: Arc<dyn Connector>,
        telemetry: Telemetry,
    ) -> Arc<ConnectionManager> {
        Arc::new(ConnectionManager {
            config,
            connector,
            telemetry,
            inner: RwLock::new(Inner {
                state: ConnectionState::Disconnected,
                connection: None,
                pool: None,
                watcher: None,
                reconnecting: false,
            }),
            connect_lock: Mutex::new(()),
            shutdown: CancellationToken::new(),
            close_once: OnceCell::new(),
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.read().state
    }

    /// Connected and the underlying connection still reports open.
    pub fn is_connected(&self) -> bool {
        let inner = self.inner.read();
        inner.state == ConnectionState::Connected
            && inner.connection.as_ref().is_some_and(|conn| conn.is_open())
    }

    /// Establishes the connection. Does nothing when already connected.
    ///
    /// A dial failure is returned as is; retrying the initial connect is up
    /// to the caller.
    pub async fn connect(self: &Arc<Self>) -> Result<(), AmqpError> {
        let _serialized = self.connect_lock.lock().await;

        {
            let mut inner = self.inner.write();
            match inner.state {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Closed => return Err(AmqpError::ClientClosed),
                ConnectionState::Reconnecting => return Err(AmqpError::Reconnecting),
                ConnectionState::Disconnected | ConnectionState::Connecting => {
                    inner.state = ConnectionState::Connecting;
                }
            }
        }

        debug!("connecting to the broker...");
        let (conn, pool) = match self.open().await {
            Ok(opened) => opened,
            Err(err) => {
                let mut inner = self.inner.write();
                if inner.state == ConnectionState::Connecting {
                    inner.state = ConnectionState::Disconnected;
                }
                return Err(err);
            }
        };

        if !self.install(conn.clone(), pool.clone()) {
            discard(pool, conn).await;
            return Err(AmqpError::ClientClosed);
        }

        info!(service = self.config.service_name, "amqp connected");
        Ok(())
    }

    /// Current channel pool, or the reason there is none.
    pub fn channel_pool(&self) -> Result<Arc<ChannelPool>, AmqpError> {
        let inner = self.inner.read();
        Self::check_state(&inner)?;
        inner.pool.clone().ok_or(AmqpError::NoConnection)
    }

    pub fn connection(&self) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        let inner = self.inner.read();
        Self::check_state(&inner)?;
        inner.connection.clone().ok_or(AmqpError::NoConnection)
    }

    fn check_state(inner: &Inner) -> Result<(), AmqpError> {
        match inner.state {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Closed => Err(AmqpError::ClientClosed),
            ConnectionState::Reconnecting => Err(AmqpError::Reconnecting),
            ConnectionState::Disconnected | ConnectionState::Connecting => {
                Err(AmqpError::NoConnection)
            }
        }
    }

    /// Shuts the manager down. Runs once; later calls return the first result.
    pub async fn close(&self) -> Result<(), AmqpError> {
        self.close_once
            .get_or_init(|| async {
                self.shutdown.cancel();

                let (pool, conn) = {
                    let mut inner = self.inner.write();
                    if let Some(watcher) = inner.watcher.take() {
                        watcher.cancel();
                    }
                    inner.state = ConnectionState::Closed;
                    (inner.pool.take(), inner.connection.take())
                };

                let mut first_err = None;
                if let Some(pool) = pool {
                    if let Err(err) = pool.close().await {
                        warn!(error = err.to_string(), "failure to close channel pool");
                        first_err.get_or_insert(err);
                    }
                }
                if let Some(conn) = conn {
                    if let Err(err) = conn.close().await {
                        warn!(error = err.to_string(), "failure to close connection");
                        first_err.get_or_insert(err);
                    }
                }

                info!("amqp connection closed");
                first_err.map_or(Ok(()), Err)
            })
            .await
            .clone()
    }

    async fn open(&self) -> Result<(Arc<dyn BrokerConnection>, Arc<ChannelPool>), AmqpError> {
        let conn = self.connector.dial(&self.config).await?;

        match ChannelPool::new(conn.clone(), self.config.publisher_confirms).await {
            Ok(pool) => Ok((conn, Arc::new(pool))),
            Err(err) => {
                let _ = conn.close().await;
                Err(err)
            }
        }
    }

    /// Swaps in a freshly opened connection and pool and restarts the watcher.
    ///
    /// Ends any reconnect sequence in the same critical section, so a failure
    /// of the new connection always finds the guard released.
    ///
    /// Returns false, leaving the caller to discard them, when the manager
    /// was closed in the meantime.
    fn install(
        self: &Arc<Self>,
        conn: Arc<dyn BrokerConnection>,
        pool: Arc<ChannelPool>,
    ) -> bool {
        let (old_pool, old_conn) = {
            let mut inner = self.inner.write();
            if inner.state == ConnectionState::Closed || self.shutdown.is_cancelled() {
                return false;
            }

            if let Some(watcher) = inner.watcher.take() {
                watcher.cancel();
            }

            let old_pool = inner.pool.replace(pool);
            let old_conn = inner.connection.replace(conn.clone());
            inner.state = ConnectionState::Connected;
            inner.reconnecting = false;

            if self.config.auto_reconnect {
                let token = self.shutdown.child_token();
                inner.watcher = Some(token.clone());
                self.spawn_watcher(conn, token);
            }

            (old_pool, old_conn)
        };

        if let (Some(pool), Some(conn)) = (old_pool, old_conn) {
            tokio::spawn(discard(pool, conn));
        }

        true
    }

    fn spawn_watcher(self: &Arc<Self>, conn: Arc<dyn BrokerConnection>, token: CancellationToken) {
        let manager = Arc::downgrade(self);
        let mut events = conn.close_events();

        tokio::spawn(async move {
            let event = tokio::select! {
                _ = token.cancelled() => return,
                event = next_close_event(&mut events) => event,
            };

            match event {
                CloseEvent::Graceful => debug!("connection closed gracefully, watcher exiting"),
                CloseEvent::Failed(reason) => {
                    warn!(reason, "connection lost");
                    if let Some(manager) = manager.upgrade() {
                        manager.trigger_reconnect();
                    }
                }
            }
        });
    }

    /// Starts a reconnect sequence unless one is already running.
    fn trigger_reconnect(self: &Arc<Self>) {
        {
            let mut inner = self.inner.write();
            if inner.reconnecting || inner.state == ConnectionState::Closed {
                return;
            }
            inner.reconnecting = true;
            inner.state = ConnectionState::Reconnecting;
        }

        let manager = Arc::downgrade(self);
        let cancel = self.shutdown.child_token();
        let backoff = ExponentialBackoff::new(
            self.config.reconnect_initial_interval,
            self.config.reconnect_max_interval,
            self.config.reconnect_timeout,
        );

        tokio::spawn(reconnect(manager, cancel, backoff));
    }

    async fn attempt_reconnect(self: &Arc<Self>) -> Result<(), AmqpError> {
        let (conn, pool) = self.open().await?;

        if !self.install(conn.clone(), pool.clone()) {
            discard(pool, conn).await;
            return Err(AmqpError::ClientClosed);
        }

        Ok(())
    }

    fn give_up(&self) -> Option<(Arc<ChannelPool>, Arc<dyn BrokerConnection>)> {
        let mut inner = self.inner.write();
        inner.reconnecting = false;
        if inner.state == ConnectionState::Closed {
            return None;
        }

        inner.state = ConnectionState::Disconnected;
        inner.watcher = None;
        inner.pool.take().zip(inner.connection.take())
    }

    fn finish_reconnect(&self) {
        self.inner.write().reconnecting = false;
    }
}

async fn reconnect(
    manager: Weak<ConnectionManager>,
    cancel: CancellationToken,
    mut backoff: ExponentialBackoff,
) {
    let mut attempt: u32 = 0;

    loop {
        let Some(strong) = manager.upgrade() else {
            return;
        };
        if cancel.is_cancelled() {
            strong.finish_reconnect();
            return;
        }

        attempt += 1;
        debug!(attempt, "reconnecting...");

        let err = match strong.attempt_reconnect().await {
            Ok(()) => {
                info!(attempt, "amqp reconnected");
                strong.telemetry.reconnected();
                return;
            }
            Err(AmqpError::ClientClosed) => {
                strong.finish_reconnect();
                return;
            }
            Err(err) => err,
        };

        warn!(attempt, error = err.to_string(), "reconnect attempt failed");

        let Some(delay) = backoff.next_delay() else {
            error!(
                attempt,
                elapsed_ms = backoff.elapsed().as_millis() as u64,
                "reconnect budget exhausted, giving up"
            );
            if let Some((pool, conn)) = strong.give_up() {
                discard(pool, conn).await;
            }
            return;
        };
        drop(strong);

        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("reconnect cancelled");
                if let Some(manager) = manager.upgrade() {
                    manager.finish_reconnect();
                }
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Waits for a close event; a dropped sender counts as a graceful close.
async fn next_close_event(events: &mut watch::Receiver<Option<CloseEvent>>) -> CloseEvent {
    loop {
        let current = events.borrow_and_update().clone();
        if let Some(event) = current {
            return event;
        }
        if events.changed().await.is_err() {
            return CloseEvent::Graceful;
        }
    }
}

async fn discard(pool: Arc<ChannelPool>, conn: Arc<dyn BrokerConnection>) {
    if let Err(err) = pool.close().await {
        debug!(error = err.to_string(), "failure to close stale channel pool");
    }
    if let Err(err) = conn.close().await {
        debug!(error = err.to_string(), "failure to close stale connection");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeBroker;
    use std::time::Duration;

    fn manager(broker: &FakeBroker, config: Config) -> Arc<ConnectionManager> {
        ConnectionManager::new(
            Arc::new(config),
            Arc::new(broker.clone()),
            Telemetry::global("connection-tests"),
        )
    }

    async fn wait_for_state(manager: &ConnectionManager, expected: ConnectionState) {
        for _ in 0..400 {
            if manager.state() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("state never became {expected}, still {}", manager.state());
    }

    async fn wait_for_dials(broker: &FakeBroker, manager: &ConnectionManager, dials: usize) {
        for _ in 0..400 {
            if broker.dials() == dials && manager.is_connected() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!(
            "expected {dials} live dials, got {} in state {}",
            broker.dials(),
            manager.state()
        );
    }

    #[tokio::test]
    async fn starts_disconnected() {
        let broker = FakeBroker::new();
        let manager = manager(&broker, FakeBroker::config());

        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(matches!(manager.channel_pool(), Err(AmqpError::NoConnection)));
        assert!(matches!(manager.connection(), Err(AmqpError::NoConnection)));
    }

    #[tokio::test]
    async fn connect_is_idempotent() {
        let broker = FakeBroker::new();
        let manager = manager(&broker, FakeBroker::config());

        manager.connect().await.unwrap();
        manager.connect().await.unwrap();

        assert_eq!(manager.state(), ConnectionState::Connected);
        assert!(manager.is_connected());
        assert_eq!(broker.dials(), 1);
        assert!(manager.channel_pool().is_ok());
    }

    #[tokio::test]
    async fn dial_failure_is_returned_without_retry() {
        let broker = FakeBroker::new();
        broker.fail_next_dials(1);
        let manager = manager(&broker, FakeBroker::config());

        let err = manager.connect().await.unwrap_err();
        assert!(matches!(err, AmqpError::ConnectionError(_)));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(broker.dials(), 0);

        manager.connect().await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn reconnects_after_connection_failure() {
        let broker = FakeBroker::new();
        let manager = manager(&broker, FakeBroker::config());
        manager.connect().await.unwrap();
        let first_pool = manager.channel_pool().unwrap();

        broker.fail_next_dials(2);
        broker.kill_connection();

        wait_for_dials(&broker, &manager, 2).await;
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert!(!manager.inner.read().reconnecting);

        let second_pool = manager.channel_pool().unwrap();
        assert!(!Arc::ptr_eq(&first_pool, &second_pool));
        assert!(second_pool.publisher_channel().is_ok());
    }

    #[tokio::test]
    async fn replacement_connection_failing_at_once_reconnects_again() {
        let broker = FakeBroker::new();
        let manager = manager(&broker, FakeBroker::config());
        manager.connect().await.unwrap();

        // a reconnect sequence is in flight when its replacement gets installed
        {
            let mut inner = manager.inner.write();
            inner.reconnecting = true;
            inner.state = ConnectionState::Reconnecting;
        }
        manager.attempt_reconnect().await.unwrap();
        assert_eq!(broker.dials(), 2);

        broker.kill_connection();

        wait_for_dials(&broker, &manager, 3).await;
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn repeated_failures_keep_reconnecting() {
        let broker = FakeBroker::new();
        let manager = manager(&broker, FakeBroker::config());
        manager.connect().await.unwrap();

        for dials in 2..=4 {
            broker.kill_connection();
            wait_for_dials(&broker, &manager, dials).await;
        }
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn reports_reconnecting_while_attempting() {
        let broker = FakeBroker::new();
        let config = Config {
            reconnect_initial_interval: Duration::from_millis(200),
            reconnect_max_interval: Duration::from_millis(200),
            ..FakeBroker::config()
        };
        let manager = manager(&broker, config);
        manager.connect().await.unwrap();

        broker.fail_next_dials(1);
        broker.kill_connection();

        wait_for_state(&manager, ConnectionState::Reconnecting).await;
        assert!(matches!(manager.channel_pool(), Err(AmqpError::Reconnecting)));
        assert!(matches!(manager.connect().await, Err(AmqpError::Reconnecting)));

        wait_for_state(&manager, ConnectionState::Connected).await;
    }

    #[tokio::test]
    async fn gives_up_when_budget_is_exhausted() {
        let broker = FakeBroker::new();
        let config = Config {
            reconnect_timeout: Duration::from_millis(100),
            ..FakeBroker::config()
        };
        let manager = manager(&broker, config);
        manager.connect().await.unwrap();

        broker.refuse_dials(true);
        broker.kill_connection();

        wait_for_state(&manager, ConnectionState::Disconnected).await;
        assert!(matches!(manager.channel_pool(), Err(AmqpError::NoConnection)));
        assert!(matches!(manager.connection(), Err(AmqpError::NoConnection)));

        broker.refuse_dials(false);
        manager.connect().await.unwrap();
        assert!(manager.is_connected());
    }

    #[tokio::test]
    async fn no_reconnect_when_disabled() {
        let broker = FakeBroker::new();
        let config = Config {
            auto_reconnect: false,
            ..FakeBroker::config()
        };
        let manager = manager(&broker, config);
        manager.connect().await.unwrap();

        broker.kill_connection();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(broker.dials(), 1);
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert!(!manager.is_connected());
    }

    #[tokio::test]
    async fn close_is_idempotent_and_terminal() {
        let broker = FakeBroker::new();
        let manager = manager(&broker, FakeBroker::config());
        manager.connect().await.unwrap();
        let pool = manager.channel_pool().unwrap();

        assert_eq!(manager.close().await, Ok(()));
        assert_eq!(manager.close().await, Ok(()));

        assert_eq!(manager.state(), ConnectionState::Closed);
        assert!(pool.is_closed());
        assert!(matches!(manager.channel_pool(), Err(AmqpError::ClientClosed)));
        assert!(matches!(manager.connect().await, Err(AmqpError::ClientClosed)));
    }

    #[tokio::test]
    async fn close_stops_reconnect_sequence() {
        let broker = FakeBroker::new();
        let manager = manager(&broker, FakeBroker::config());
        manager.connect().await.unwrap();

        broker.refuse_dials(true);
        broker.kill_connection();
        wait_for_state(&manager, ConnectionState::Reconnecting).await;

        manager.close().await.unwrap();
        broker.refuse_dials(false);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(manager.state(), ConnectionState::Closed);
        assert_eq!(broker.dials(), 1);
    }

    #[tokio::test]
    async fn graceful_close_does_not_reconnect() {
        let broker = FakeBroker::new();
        let manager = manager(&broker, FakeBroker::config());
        manager.connect().await.unwrap();

        manager.connection().unwrap().close().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(broker.dials(), 1);
        assert_eq!(manager.state(), ConnectionState::Connected);
    }
}
