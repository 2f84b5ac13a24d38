// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Dispatcher
//!
//! This module provides the `Consumer`, which subscribes to one queue and
//! routes every delivery to the handler registered for its routing key.
//!
//! Deliveries are processed sequentially on the consumer's dedicated channel;
//! callers wanting parallelism run several consumers with distinct tags.

use crate::{client::Client, consumer::consume, errors::AmqpError, handler::ConsumerHandler};
use futures_util::StreamExt;
use std::{collections::HashMap, sync::Arc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Settings of one consumer.
///
/// `prefetch` and `max_retries` fall back to the client configuration when unset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    /// Queue to subscribe to.
    pub queue: String,
    /// Consumer tag, also the key of the dedicated channel in the pool.
    pub tag: String,
    /// Unacknowledged deliveries the broker may push at once.
    pub prefetch: Option<u16>,
    /// Failed attempts before a delivery goes to the DLQ.
    pub max_retries: Option<u32>,
    /// Exchange receiving exhausted deliveries.
    pub dlq_exchange: String,
}

impl ConsumerConfig {
    /// Settings for consuming `queue` with conventional names.
    ///
    /// The tag is `<queue>-consumer` and exhausted messages go to
    /// `<queue>.dlq.exchange`, the DLQ exchange declared by
    /// [`setup_delayed_retry_queue`](crate::topology::setup_delayed_retry_queue).
    ///
    /// # Parameters
    /// * `queue` - Name of the queue to consume
    ///
    /// # Returns
    /// The settings, ready for chaining
    pub fn new(queue: &str) -> ConsumerConfig {
        ConsumerConfig {
            queue: queue.to_owned(),
            tag: format!("{queue}-consumer"),
            prefetch: None,
            max_retries: None,
            dlq_exchange: format!("{queue}.dlq.exchange"),
        }
    }

    /// Overrides the consumer tag.
    ///
    /// Two consumers of one client need distinct tags, as each tag owns a channel.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn tag(mut self, tag: &str) -> Self {
        self.tag = tag.to_owned();
        self
    }

    /// Overrides the client-wide prefetch count for this consumer.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = Some(prefetch);
        self
    }

    /// Overrides the client-wide retry threshold for this consumer.
    ///
    /// # Parameters
    /// * `retries` - Failed attempts, counted from `x-death`, tolerated before the DLQ
    ///
    /// # Returns
    /// Self for method chaining
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    /// Exchange exhausted deliveries are republished to.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn dlq_exchange(mut self, exchange: &str) -> Self {
        self.dlq_exchange = exchange.to_owned();
        self
    }
}

/// Queue consumer dispatching deliveries by routing key.
///
/// # Example
/// ```no_run
/// use rabbitmq::{Client, Config, Consumer, ConsumerConfig, ConsumerHandler, Telemetry};
/// use std::sync::Arc;
/// use tokio_util::sync::CancellationToken;
///
/// # async fn run(handler: Arc<dyn ConsumerHandler>) -> Result<(), rabbitmq::AmqpError> {
/// let config = Config::builder("amqp://localhost:5672/%2f").build()?;
/// let client = Client::new(config, Telemetry::global("orders")).await?;
///
/// let consumer = Consumer::new(client, ConsumerConfig::new("orders").prefetch(20))
///     .register_handler("order.created", handler);
/// consumer.run(CancellationToken::new()).await
/// # }
/// ```
pub struct Consumer {
    client: Arc<Client>,
    config: ConsumerConfig,
    handlers: HashMap<String, Arc<dyn ConsumerHandler>>,
}

impl Consumer {
    /// Creates a consumer without handlers.
    ///
    /// # Parameters
    /// * `client` - Client owning the connection and channel pool
    /// * `config` - Queue, tag and retry settings
    ///
    /// # Returns
    /// A consumer to register handlers on
    pub fn new(client: Arc<Client>, config: ConsumerConfig) -> Consumer {
        Consumer {
            client,
            config,
            handlers: HashMap::new(),
        }
    }

    /// Settings the consumer was created with.
    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Registers the handler of `routing_key`.
    ///
    /// A later registration for the same key replaces it. Deliveries whose
    /// key has no handler are acknowledged and dropped.
    ///
    /// # Parameters
    /// * `routing_key` - Exact routing key of the deliveries to handle
    /// * `handler` - Handler invoked for each of them
    ///
    /// # Returns
    /// Self for method chaining
    pub fn register_handler(
        mut self,
        routing_key: &str,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Self {
        if self
            .handlers
            .insert(routing_key.to_owned(), handler)
            .is_some()
        {
            debug!(routing_key, "replacing handler");
        }
        self
    }

    /// Subscribes to the queue and processes deliveries until `cancel` fires.
    ///
    /// Cancellation releases the consumer channel and returns Ok. A delivery
    /// stream that ends on its own (channel or connection loss) is an error;
    /// [`Consumer::run`] resubscribes in that case.
    pub async fn consume(&self, cancel: CancellationToken) -> Result<(), AmqpError> {
        if self.handlers.is_empty() {
            return Err(AmqpError::NoHandlers(self.config.queue.clone()));
        }

        let client_cfg = self.client.config();
        let prefetch = self.config.prefetch.unwrap_or(client_cfg.prefetch_count);
        let max_retries = self.config.max_retries.unwrap_or(client_cfg.max_retries);
        let queue = &self.config.queue;
        let tag = &self.config.tag;

        let pool = self.client.channel_pool()?;
        let channel = pool.consumer_channel(tag).await?.channel();

        channel.qos(prefetch).await.map_err(|err| {
            error!(error = err.to_string(), queue, "failure to configure qos");
            AmqpError::QoSDeclarationError(queue.clone())
        })?;

        let mut deliveries = channel.consume(queue, tag).await.map_err(|err| {
            error!(error = err.to_string(), queue, "failure to create the consumer");
            AmqpError::ConsumerDeclarationError(queue.clone())
        })?;

        info!(queue, tag, prefetch, "consumer started");

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(queue, tag, "consumer cancelled");
                    if let Err(err) = pool.release_consumer_channel(tag).await {
                        warn!(error = err.to_string(), tag, "failure to release consumer channel");
                    }
                    return Ok(());
                }
                next = deliveries.next() => next,
            };

            match next {
                Some(Ok(delivery)) => {
                    let handler = self.handlers.get(&delivery.routing_key).cloned();
                    match consume(
                        &self.client,
                        &self.config,
                        max_retries,
                        handler,
                        channel.as_ref(),
                        &delivery,
                    )
                    .await
                    {
                        Ok(outcome) => debug!(
                            queue,
                            delivery_tag = delivery.delivery_tag,
                            ?outcome,
                            "delivery settled"
                        ),
                        Err(err) => error!(error = err.to_string(), queue, "error consume msg"),
                    }
                }
                Some(Err(err)) => error!(error = err.to_string(), queue, "errors consume msg"),
                None => {
                    warn!(queue, tag, "delivery stream closed");
                    return Err(AmqpError::ConsumerError(format!(
                        "delivery stream of `{queue}` closed"
                    )));
                }
            }
        }
    }

    /// Like [`Consumer::consume`], but subscribes again whenever the stream is lost.
    ///
    /// Ends on cancellation, once the client is closed, or when no handler
    /// is registered.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), AmqpError> {
        let pause = self.client.config().reconnect_initial_interval;

        loop {
            match self.consume(cancel.clone()).await {
                Ok(()) => return Ok(()),
                Err(err @ (AmqpError::ClientClosed | AmqpError::NoHandlers(_))) => return Err(err),
                Err(err) => warn!(
                    error = err.to_string(),
                    queue = self.config.queue,
                    "consumer interrupted, resubscribing"
                ),
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    /// Runs the consumer on its own task.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<Result<(), AmqpError>> {
        tokio::spawn(async move { self.run(cancel).await })
    }
}
