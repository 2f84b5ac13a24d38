// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Handlers
//!
//! Handlers are registered on a [`Consumer`](crate::dispatcher::Consumer) per
//! routing key and receive every delivery routed with that key.

use async_trait::async_trait;
use lapin::types::FieldTable;
use opentelemetry::Context;

/// Error returned by a handler; any failure sends the delivery down the retry path.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Message passed to a handler.
#[derive(Debug, Clone)]
pub struct ConsumerMessage {
    pub queue: String,
    pub routing_key: String,
    pub data: Vec<u8>,
    pub headers: FieldTable,
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    /// Number of times the message was already dead-lettered.
    pub retry_count: i64,
    pub redelivered: bool,
}

impl ConsumerMessage {
    /// Deserializes the JSON body.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.data)
    }
}

/// Application logic run for each delivery of one routing key.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    /// Handles one delivery.
    ///
    /// # Parameters
    /// * `ctx` - Context carrying the consumer span, child of the publisher's trace
    /// * `msg` - The delivery
    ///
    /// # Returns
    /// Ok to acknowledge, an error to retry or dead letter the delivery
    async fn exec(&self, ctx: &Context, msg: &ConsumerMessage) -> Result<(), HandlerError>;
}
