// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! This module provides functionality for publishing messages to RabbitMQ exchanges.
//! Every message is persistent, carries a message id and timestamp, and
//! propagates the OpenTelemetry context of the caller in its headers.
//!
//! With publisher confirms enabled a publish only succeeds once the broker
//! acknowledged it. A negative acknowledgment (`PublishConfirmFailed`) and an
//! expired wait (`PublishTimeout`) are reported as distinct errors.

use crate::{client::Client, errors::AmqpError, otel};
use lapin::{
    types::{
        AMQPValue, FieldTable, LongInt, LongLongInt, LongString, LongUInt, ShortInt, ShortString,
    },
    BasicProperties,
};
use opentelemetry::Context;
use serde::Serialize;
use std::{
    collections::BTreeMap,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tracing::{debug, error};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// AMQP delivery mode of messages that survive a broker restart
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// A header value attached to a published message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    ShortString(String),
    LongString(String),
    Int(i16),
    LongInt(i32),
    LongLongInt(i64),
    LongUint(u32),
    Bool(bool),
}

impl From<HeaderValue> for AMQPValue {
    fn from(value: HeaderValue) -> AMQPValue {
        match value {
            HeaderValue::ShortString(v) => AMQPValue::ShortString(ShortString::from(v)),
            HeaderValue::LongString(v) => AMQPValue::LongString(LongString::from(v)),
            HeaderValue::Int(v) => AMQPValue::ShortInt(ShortInt::from(v)),
            HeaderValue::LongInt(v) => AMQPValue::LongInt(LongInt::from(v)),
            HeaderValue::LongLongInt(v) => AMQPValue::LongLongInt(LongLongInt::from(v)),
            HeaderValue::LongUint(v) => AMQPValue::LongUInt(LongUInt::from(v)),
            HeaderValue::Bool(v) => AMQPValue::Boolean(v),
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> HeaderValue {
        HeaderValue::LongString(value.to_owned())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> HeaderValue {
        HeaderValue::LongString(value)
    }
}

impl From<i32> for HeaderValue {
    fn from(value: i32) -> HeaderValue {
        HeaderValue::LongInt(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> HeaderValue {
        HeaderValue::LongLongInt(value)
    }
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> HeaderValue {
        HeaderValue::Bool(value)
    }
}

/// Per-message publish settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishOptions {
    pub headers: BTreeMap<String, HeaderValue>,
    pub priority: Option<u8>,
    pub correlation_id: Option<String>,
    /// Generated (UUID v4) when unset.
    pub message_id: Option<String>,
    /// `application/json` when unset.
    pub content_type: Option<String>,
    pub kind: Option<String>,
    pub expiration: Option<Duration>,
    /// Overrides the configured publish timeout.
    pub timeout: Option<Duration>,
}

impl PublishOptions {
    /// Options publishing a persistent JSON message with generated id.
    pub fn new() -> PublishOptions {
        PublishOptions::default()
    }

    /// Adds an application header, replacing any previous value of `key`.
    ///
    /// Trace context headers are injected after these and win on conflict.
    ///
    /// # Parameters
    /// * `key` - Header name
    /// * `value` - Any type convertible into [`HeaderValue`]
    ///
    /// # Returns
    /// Self for method chaining
    pub fn header(mut self, key: &str, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(key.to_owned(), value.into());
        self
    }

    /// Message priority, honoured by queues declared with `x-max-priority`.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Correlation id linking a reply to its request.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn correlation_id(mut self, id: &str) -> Self {
        self.correlation_id = Some(id.to_owned());
        self
    }

    /// Fixed message id, for example to let consumers deduplicate.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn message_id(mut self, id: &str) -> Self {
        self.message_id = Some(id.to_owned());
        self
    }

    /// Content type of the body.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_owned());
        self
    }

    /// Sets the AMQP `type` property.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn kind(mut self, kind: &str) -> Self {
        self.kind = Some(kind.to_owned());
        self
    }

    /// Per-message TTL, sent as the `expiration` property in milliseconds.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn expiration(mut self, ttl: Duration) -> Self {
        self.expiration = Some(ttl);
        self
    }

    /// Upper bound for the publish, confirmation included.
    ///
    /// # Parameters
    /// * `timeout` - Replaces the configured publish timeout for this message
    ///
    /// # Returns
    /// Self for method chaining
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Publishes through the publisher channel of the client's current pool.
///
/// The channel is looked up on every publish, so a publisher keeps working
/// across reconnects; publishes issued while reconnecting fail with
/// [`AmqpError::Reconnecting`].
///
/// # Example
/// ```no_run
/// use opentelemetry::Context;
/// use rabbitmq::{Client, PublishOptions, Publisher};
/// use std::sync::Arc;
///
/// # async fn run(client: Arc<Client>) -> Result<(), rabbitmq::AmqpError> {
/// let publisher = Publisher::new(client);
/// let opts = PublishOptions::new().header("tenant", "acme").priority(5);
///
/// publisher
///     .publish(&Context::current(), "orders.exchange", "order.created", b"{}", &opts)
///     .await
/// # }
/// ```
pub struct Publisher {
    client: Arc<Client>,
}

impl Publisher {
    /// Creates a publisher on `client`.
    ///
    /// # Parameters
    /// * `client` - Client owning the connection and channel pool
    ///
    /// # Returns
    /// A new publisher; cheap to create, one per client is enough
    pub fn new(client: Arc<Client>) -> Publisher {
        Publisher { client }
    }

    /// Publishes `body` to `exchange` with `routing_key`.
    ///
    /// The message is persistent, carries the trace context of `ctx` in its
    /// headers and, with publisher confirms enabled, is only reported sent
    /// once the broker acknowledged it. Bounded by `opts.timeout`, or the
    /// configured publish timeout.
    ///
    /// # Parameters
    /// * `ctx` - Trace context propagated to consumers
    /// * `exchange` - Target exchange, empty for the default exchange
    /// * `routing_key` - Routing key of the message
    /// * `body` - Raw payload
    /// * `opts` - Per-message properties
    ///
    /// # Returns
    /// Ok once sent (and confirmed), or the error of the failed stage
    pub async fn publish(
        &self,
        ctx: &Context,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        opts: &PublishOptions,
    ) -> Result<(), AmqpError> {
        let telemetry = self.client.telemetry();

        match self.send(ctx, exchange, routing_key, body, opts).await {
            Ok(()) => {
                debug!(exchange, routing_key, "message published");
                telemetry.published(exchange);
                Ok(())
            }
            Err(err) => {
                error!(
                    error = err.to_string(),
                    exchange, routing_key, "error publishing message"
                );
                telemetry.publish_failed(exchange);
                Err(err)
            }
        }
    }

    /// Serializes `payload` as JSON and publishes it.
    pub async fn publish_json<T: Serialize + ?Sized>(
        &self,
        ctx: &Context,
        exchange: &str,
        routing_key: &str,
        payload: &T,
        opts: &PublishOptions,
    ) -> Result<(), AmqpError> {
        let body = serde_json::to_vec(payload).map_err(|err| {
            error!(error = err.to_string(), "failure to serialize payload");
            AmqpError::SerializePayloadError(err.to_string())
        })?;

        self.publish(ctx, exchange, routing_key, &body, opts).await
    }

    /// Publishes `bodies` in order and stops at the first failure.
    ///
    /// Returns the number of published messages. On failure the error carries
    /// the zero-based index of the failed body; every body before it was sent.
    pub async fn publish_batch<B: AsRef<[u8]>>(
        &self,
        ctx: &Context,
        exchange: &str,
        routing_key: &str,
        bodies: &[B],
        opts: &PublishOptions,
    ) -> Result<usize, AmqpError> {
        for (index, body) in bodies.iter().enumerate() {
            if let Err(err) = self
                .publish(ctx, exchange, routing_key, body.as_ref(), opts)
                .await
            {
                return Err(AmqpError::BatchPublishError {
                    index,
                    published: index,
                    source: Box::new(err),
                });
            }
        }

        Ok(bodies.len())
    }

    async fn send(
        &self,
        ctx: &Context,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        opts: &PublishOptions,
    ) -> Result<(), AmqpError> {
        let channel = self.client.channel_pool()?.publisher_channel()?;
        let properties = self.properties(ctx, opts);
        let timeout = opts.timeout.unwrap_or(self.client.config().publish_timeout);

        if channel.confirms() {
            return channel
                .publish_with_confirm(exchange, routing_key, body, properties, timeout)
                .await;
        }

        tokio::time::timeout(
            timeout,
            channel.publish_without_confirm(exchange, routing_key, body, properties),
        )
        .await
        .map_err(|_| AmqpError::PublishTimeout)?
    }

    fn properties(&self, ctx: &Context, opts: &PublishOptions) -> BasicProperties {
        let mut headers = BTreeMap::<ShortString, AMQPValue>::default();
        otel::inject_context(ctx, &mut headers);

        for (key, value) in &opts.headers {
            headers.insert(ShortString::from(key.clone()), value.clone().into());
        }

        let mut props = BasicProperties::default()
            .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
            .with_content_type(ShortString::from(
                opts.content_type
                    .clone()
                    .unwrap_or_else(|| JSON_CONTENT_TYPE.to_owned()),
            ))
            .with_message_id(ShortString::from(
                opts.message_id
                    .clone()
                    .unwrap_or_else(|| Uuid::new_v4().to_string()),
            ))
            .with_timestamp(unix_timestamp())
            .with_app_id(ShortString::from(self.client.config().service_name.clone()))
            .with_headers(FieldTable::from(headers));

        if let Some(priority) = opts.priority {
            props = props.with_priority(priority);
        }
        if let Some(id) = &opts.correlation_id {
            props = props.with_correlation_id(ShortString::from(id.clone()));
        }
        if let Some(kind) = &opts.kind {
            props = props.with_type(ShortString::from(kind.clone()));
        }
        if let Some(ttl) = opts.expiration {
            props = props.with_expiration(ShortString::from(ttl.as_millis().to_string()));
        }

        props
    }
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}
