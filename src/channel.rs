// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! The `ChannelPool` multiplexes channels over one live connection:
//!
//! - one publisher channel, in confirm mode when publisher confirms are on,
//! - one dedicated channel per consumer tag, so a slow consumer never shares
//!   flow-control state with another,
//! - short-lived generic channels for one-off operations such as topology
//!   declaration.
//!
//! A pool belongs to exactly one connection. On reconnect the connection
//! manager builds a fresh pool instead of patching the old one.

use crate::{
    broker::{BrokerChannel, BrokerConnection, Confirmation},
    errors::AmqpError,
};
use lapin::BasicProperties;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::{Mutex, OnceCell, RwLock};
use tracing::{debug, error, warn};

/// The single channel used for publishing.
pub struct PublisherChannel {
    channel: Arc<dyn BrokerChannel>,
    confirms: bool,
    lock: Mutex<()>,
}

impl PublisherChannel {
    pub fn is_open(&self) -> bool {
        self.channel.is_open()
    }

    pub fn confirms(&self) -> bool {
        self.confirms
    }

    pub fn id(&self) -> u16 {
        self.channel.id()
    }

    /// Publishes and waits for the broker confirmation, at most `timeout`.
    ///
    /// A nack yields `PublishConfirmFailed`, an expired wait `PublishTimeout`.
    pub async fn publish_with_confirm(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: BasicProperties,
        timeout: Duration,
    ) -> Result<(), AmqpError> {
        let waiting = async {
            let confirm = {
                let _guard = self.lock.lock().await;
                self.channel
                    .publish(exchange, routing_key, body, properties)
                    .await?
            };
            confirm.await
        };

        match tokio::time::timeout(timeout, waiting).await {
            Err(_) => {
                warn!(exchange, routing_key, "publish confirmation timed out");
                Err(AmqpError::PublishTimeout)
            }
            Ok(Err(err)) => Err(err),
            Ok(Ok(Confirmation::Nack)) => {
                error!(exchange, routing_key, "publish nacked by the broker");
                Err(AmqpError::PublishConfirmFailed)
            }
            Ok(Ok(_)) => Ok(()),
        }
    }

    /// Publishes without waiting for a confirmation.
    pub async fn publish_without_confirm(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        let _guard = self.lock.lock().await;
        self.channel
            .publish(exchange, routing_key, body, properties)
            .await
            .map(|_| ())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let _guard = self.lock.lock().await;
        self.channel.close().await
    }
}

/// A channel dedicated to one consumer tag.
pub struct ConsumerChannel {
    tag: String,
    channel: Arc<dyn BrokerChannel>,
}

impl ConsumerChannel {
    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn channel(&self) -> Arc<dyn BrokerChannel> {
        self.channel.clone()
    }

    pub fn is_open(&self) -> bool {
        self.channel.is_open()
    }
}

pub struct ChannelPool {
    connection: Arc<dyn BrokerConnection>,
    publisher: Arc<PublisherChannel>,
    consumers: RwLock<HashMap<String, Arc<ConsumerChannel>>>,
    closed: AtomicBool,
    close_once: OnceCell<Result<(), AmqpError>>,
}

impl ChannelPool {
    /// Builds a pool over `connection`, opening the publisher channel eagerly.
    ///
    /// Failing to open the publisher channel or to enable confirm mode fails
    /// the whole construction.
    pub async fn new(
        connection: Arc<dyn BrokerConnection>,
        confirms: bool,
    ) -> Result<ChannelPool, AmqpError> {
        let channel = connection.open_channel().await?;

        if confirms {
            if let Err(err) = channel.confirm_select().await {
                error!(error = err.to_string(), "failure to enable publisher confirms");
                let _ = channel.close().await;
                return Err(err);
            }
        }

        debug!(channel = channel.id(), confirms, "publisher channel ready");

        Ok(ChannelPool {
            connection,
            publisher: Arc::new(PublisherChannel {
                channel,
                confirms,
                lock: Mutex::new(()),
            }),
            consumers: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
            close_once: OnceCell::new(),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn publisher_channel(&self) -> Result<Arc<PublisherChannel>, AmqpError> {
        if self.is_closed() {
            return Err(AmqpError::ClientClosed);
        }
        if !self.publisher.is_open() {
            return Err(AmqpError::ChannelClosed);
        }
        Ok(self.publisher.clone())
    }

    /// Returns the live channel of `tag`, opening one when absent or stale.
    pub async fn consumer_channel(&self, tag: &str) -> Result<Arc<ConsumerChannel>, AmqpError> {
        if self.is_closed() {
            return Err(AmqpError::ClientClosed);
        }

        if let Some(entry) = self.consumers.read().await.get(tag) {
            if entry.is_open() {
                return Ok(entry.clone());
            }
        }

        let mut consumers = self.consumers.write().await;
        if self.is_closed() {
            return Err(AmqpError::ClientClosed);
        }

        if let Some(entry) = consumers.get(tag) {
            if entry.is_open() {
                return Ok(entry.clone());
            }
            debug!(tag, "discarding stale consumer channel");
            consumers.remove(tag);
        }

        let channel = self.connection.open_channel().await?;
        let entry = Arc::new(ConsumerChannel {
            tag: tag.to_owned(),
            channel,
        });
        consumers.insert(tag.to_owned(), entry.clone());
        debug!(tag, channel = entry.channel.id(), "consumer channel created");

        Ok(entry)
    }

    /// Closes and forgets the channel of `tag`. Releasing twice is a no-op.
    pub async fn release_consumer_channel(&self, tag: &str) -> Result<(), AmqpError> {
        let entry = self.consumers.write().await.remove(tag);
        match entry {
            Some(entry) => entry.channel.close().await,
            None => Ok(()),
        }
    }

    /// Opens a channel owned by the caller, who must close it.
    pub async fn generic_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        if self.is_closed() {
            return Err(AmqpError::ClientClosed);
        }
        self.connection.open_channel().await
    }

    pub async fn consumer_count(&self) -> usize {
        self.consumers.read().await.len()
    }

    /// Closes the publisher and every consumer channel.
    ///
    /// Every channel is closed even when one fails; the first error is
    /// returned, and repeated calls return the same result.
    pub async fn close(&self) -> Result<(), AmqpError> {
        self.close_once
            .get_or_init(|| async {
                self.closed.store(true, Ordering::Release);
                let mut first_err = None;

                if let Err(err) = self.publisher.close().await {
                    warn!(error = err.to_string(), "failure to close publisher channel");
                    first_err.get_or_insert(err);
                }

                let consumers: Vec<_> = self.consumers.write().await.drain().collect();
                for (tag, entry) in consumers {
                    if let Err(err) = entry.channel.close().await {
                        warn!(error = err.to_string(), tag, "failure to close consumer channel");
                        first_err.get_or_insert(err);
                    }
                }

                first_err.map_or(Ok(()), Err)
            })
            .await
            .clone()
    }
}
