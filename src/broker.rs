// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Capabilities
//!
//! The connection manager, channel pool, publisher and consumer only talk to
//! the broker through the traits in this module. `lapin_broker` provides the
//! production implementation; tests substitute an in-memory broker.

use crate::errors::AmqpError;
use async_trait::async_trait;
use futures_util::{future::BoxFuture, stream::BoxStream};
use lapin::{
    options::{ExchangeDeclareOptions, QueueDeclareOptions},
    types::FieldTable,
    BasicProperties, ExchangeKind,
};
use std::sync::Arc;
use tokio::sync::watch;

/// Broker answer to a published message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Ack,
    Nack,
    /// The channel is not in confirm mode.
    NotRequested,
}

/// Pending confirmation of a publish.
pub type ConfirmFuture = BoxFuture<'static, Result<Confirmation, AmqpError>>;

/// Stream of deliveries for one consumer tag. Ends when the channel closes.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

/// Reason a connection stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseEvent {
    /// Closed on request of the application.
    Graceful,
    /// Closed by the broker or the network.
    Failed(String),
}

/// A message handed to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: BasicProperties,
    pub data: Vec<u8>,
}

/// One live broker connection.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Opens a new channel multiplexed over this connection.
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError>;

    fn is_open(&self) -> bool;

    /// Close notifications. The value stays `None` while the connection is alive.
    fn close_events(&self) -> watch::Receiver<Option<CloseEvent>>;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// One AMQP channel.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    fn id(&self) -> u16;

    fn is_open(&self) -> bool;

    /// Puts the channel in publisher confirm mode.
    async fn confirm_select(&self) -> Result<(), AmqpError>;

    async fn qos(&self, prefetch: u16) -> Result<(), AmqpError>;

    async fn exchange_declare(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        args: FieldTable,
    ) -> Result<(), AmqpError>;

    async fn queue_declare(
        &self,
        name: &str,
        options: QueueDeclareOptions,
        args: FieldTable,
    ) -> Result<(), AmqpError>;

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        args: FieldTable,
    ) -> Result<(), AmqpError>;

    /// Sends a message and returns the pending broker confirmation.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: BasicProperties,
    ) -> Result<ConfirmFuture, AmqpError>;

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}
