// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Client
//!
//! The `Client` is the entry point of the crate. It validates the
//! configuration, selects the connection strategy, connects, and exposes the
//! channel pool to the [`Publisher`](crate::publisher::Publisher) and
//! [`Consumer`](crate::dispatcher::Consumer).
//!
//! Topology helpers run on a short-lived channel that is closed afterwards,
//! so a failed declaration never poisons the publisher or consumer channels.

use crate::{
    broker::{BrokerChannel, BrokerConnection},
    channel::ChannelPool,
    config::Config,
    connection::{ConnectionManager, ConnectionState},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    otel::Telemetry,
    queue::{QueueBinding, QueueDefinition},
    strategy::{ConnectionStrategy, Connector},
    topology::{self, AmqpTopology, DelayedRetryTopology, DlqConfig, Topology},
};
use std::{sync::Arc, time::Duration};
use tracing::{debug, info};

/// Connected AMQP client shared by publishers and consumers.
///
/// # Example
/// ```no_run
/// use rabbitmq::{Client, Config, Telemetry};
/// use std::time::Duration;
///
/// # async fn run() -> Result<(), rabbitmq::AmqpError> {
/// let config = Config::builder("amqp://localhost:5672/%2f")
///     .service_name("billing")
///     .build()?;
/// let client = Client::new(config, Telemetry::global("billing")).await?;
///
/// client
///     .setup_delayed_retry_queue("invoices", Duration::from_secs(30))
///     .await?;
/// client.ping()?;
/// client.close().await
/// # }
/// ```
pub struct Client {
    config: Arc<Config>,
    manager: Arc<ConnectionManager>,
    telemetry: Telemetry,
}

impl Client {
    /// Validates `config`, prepares its connection strategy and connects.
    ///
    /// Certificates of the TLS strategy are read here, so a bad path fails
    /// before any dial.
    ///
    /// # Parameters
    /// * `config` - Connection, reconnect and consumer defaults
    /// * `telemetry` - Tracer and counters used by every component
    ///
    /// # Returns
    /// The connected client, or the validation, certificate or dial error
    pub async fn new(config: Config, telemetry: Telemetry) -> Result<Arc<Client>, AmqpError> {
        config.validate()?;
        let strategy = ConnectionStrategy::from_config(&config)?;
        Client::start(config, Arc::new(strategy), telemetry).await
    }

    /// Same as [`Client::new`] with a caller supplied connector.
    ///
    /// # Parameters
    /// * `config` - Connection, reconnect and consumer defaults
    /// * `connector` - Dials the broker, on connect and on every reconnect
    /// * `telemetry` - Tracer and counters used by every component
    ///
    /// # Returns
    /// The connected client, or the validation or dial error
    pub async fn with_connector(
        config: Config,
        connector: Arc<dyn Connector>,
        telemetry: Telemetry,
    ) -> Result<Arc<Client>, AmqpError> {
        config.validate()?;
        Client::start(config, connector, telemetry).await
    }

    async fn start(
        config: Config,
        connector: Arc<dyn Connector>,
        telemetry: Telemetry,
    ) -> Result<Arc<Client>, AmqpError> {
        let config = Arc::new(config);
        let manager = ConnectionManager::new(config.clone(), connector, telemetry.clone());
        manager.connect().await?;

        info!(
            service = config.service_name,
            version = config.service_version,
            environment = config.environment,
            "amqp client ready"
        );

        Ok(Arc::new(Client {
            config,
            manager,
            telemetry,
        }))
    }

    /// Configuration the client was built with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    /// Current lifecycle state of the connection.
    pub fn state(&self) -> ConnectionState {
        self.manager.state()
    }

    /// Connects again after the reconnect budget ran out. No-op when connected.
    pub async fn connect(&self) -> Result<(), AmqpError> {
        self.manager.connect().await
    }

    /// Live connection.
    ///
    /// # Returns
    /// `Reconnecting`, `ClientClosed` or `NoConnection` unless connected
    pub fn connection(&self) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        self.manager.connection()
    }

    /// Channel pool of the live connection.
    ///
    /// The pool is replaced on every reconnect; hold it only for one operation.
    ///
    /// # Returns
    /// `Reconnecting`, `ClientClosed` or `NoConnection` unless connected
    pub fn channel_pool(&self) -> Result<Arc<ChannelPool>, AmqpError> {
        self.manager.channel_pool()
    }

    /// Opens a channel owned by the caller.
    pub async fn channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        self.channel_pool()?.generic_channel().await
    }

    /// Succeeds iff the client is connected and the connection is still open.
    pub fn ping(&self) -> Result<(), AmqpError> {
        let conn = self.manager.connection()?;
        if conn.is_open() {
            Ok(())
        } else {
            Err(AmqpError::ConnectionClosed)
        }
    }

    /// Declares an exchange on a short-lived channel.
    pub async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        let channel = self.channel().await?;
        let result = topology::declare_exchange(channel.as_ref(), def).await;
        release(channel).await;
        result
    }

    /// Declares a queue on a short-lived channel.
    pub async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        let channel = self.channel().await?;
        let result = topology::declare_queue(channel.as_ref(), def).await;
        release(channel).await;
        result
    }

    /// Binds a queue on a short-lived channel.
    pub async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        let channel = self.channel().await?;
        let result = topology::bind_queue(channel.as_ref(), binding).await;
        release(channel).await;
        result
    }

    /// See [`topology::setup_dlq`].
    pub async fn setup_dlq(&self, cfg: &DlqConfig) -> Result<(), AmqpError> {
        let channel = self.channel().await?;
        let result = topology::setup_dlq(channel.as_ref(), cfg).await;
        release(channel).await;
        result
    }

    /// See [`topology::declare_queue_with_dlq`].
    pub async fn declare_queue_with_dlq(
        &self,
        queue: &str,
        dlx: &str,
        dlq_routing_key: Option<&str>,
    ) -> Result<(), AmqpError> {
        let channel = self.channel().await?;
        let result =
            topology::declare_queue_with_dlq(channel.as_ref(), queue, dlx, dlq_routing_key).await;
        release(channel).await;
        result
    }

    /// See [`topology::declare_queue_with_dlq_and_ttl`].
    pub async fn declare_queue_with_dlq_and_ttl(
        &self,
        queue: &str,
        dlx: &str,
        dlq_routing_key: Option<&str>,
        ttl: Duration,
    ) -> Result<(), AmqpError> {
        let channel = self.channel().await?;
        let result = topology::declare_queue_with_dlq_and_ttl(
            channel.as_ref(),
            queue,
            dlx,
            dlq_routing_key,
            ttl,
        )
        .await;
        release(channel).await;
        result
    }

    /// See [`topology::setup_delayed_retry_queue`].
    pub async fn setup_delayed_retry_queue(
        &self,
        queue: &str,
        delay: Duration,
    ) -> Result<DelayedRetryTopology, AmqpError> {
        let channel = self.channel().await?;
        let result = topology::setup_delayed_retry_queue(channel.as_ref(), queue, delay).await;
        release(channel).await;
        result
    }

    /// Starts a topology batch on a fresh channel; see [`Client::install`].
    pub async fn topology(&self) -> Result<AmqpTopology, AmqpError> {
        Ok(AmqpTopology::new(self.channel().await?))
    }

    /// Installs the batch and closes its channel.
    pub async fn install(&self, topology: AmqpTopology) -> Result<(), AmqpError> {
        let result = topology.install().await;
        release(topology.channel()).await;
        result
    }

    /// Closes the connection manager. Later calls return the first result.
    pub async fn close(&self) -> Result<(), AmqpError> {
        self.manager.close().await
    }
}

async fn release(channel: Arc<dyn BrokerChannel>) {
    if let Err(err) = channel.close().await {
        debug!(error = err.to_string(), "failure to close topology channel");
    }
}
