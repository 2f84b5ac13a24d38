// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! Builders for queue declarations and queue-to-exchange bindings. Dead
//! lettering, message TTL and length limits become `x-` arguments of the
//! declaration.

use crate::topology::{
    AMQP_HEADERS_DEAD_LETTER_EXCHANGE, AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY,
    AMQP_HEADERS_MAX_LENGTH, AMQP_HEADERS_MAX_LENGTH_BYTES, AMQP_HEADERS_MESSAGE_TTL,
};
use lapin::{
    options::QueueDeclareOptions,
    types::{AMQPValue, FieldTable, LongLongInt, LongString, ShortString},
};
use std::time::Duration;

/// A queue to declare. Non-durable and without arguments unless configured.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    options: QueueDeclareOptions,
    pub(crate) ttl: Option<Duration>,
    pub(crate) max_length: Option<u32>,
    pub(crate) max_length_bytes: Option<u64>,
    pub(crate) dead_letter_exchange: Option<String>,
    pub(crate) dead_letter_routing_key: Option<String>,
}

impl QueueDefinition {
    /// Starts the definition of queue `name`.
    ///
    /// Without further configuration the queue is neither durable, exclusive
    /// nor auto-deleted, and is declared without `x-` arguments.
    ///
    /// # Parameters
    /// * `name` - Queue name as known by the broker
    ///
    /// # Returns
    /// The definition, ready for chaining
    ///
    /// # Example
    /// ```
    /// use rabbitmq::queue::QueueDefinition;
    /// use std::time::Duration;
    ///
    /// let orders = QueueDefinition::new("orders")
    ///     .durable()
    ///     .dead_letter_exchange("orders.dlx")
    ///     .ttl(Duration::from_secs(30));
    /// assert_eq!(orders.name(), "orders");
    /// ```
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            ..QueueDefinition::default()
        }
    }

    /// Name the queue is declared with.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Keeps the queue and its persistent messages across broker restarts.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn durable(mut self) -> Self {
        self.options.durable = true;
        self
    }

    /// Lets the broker remove the queue once its last consumer is gone.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn auto_delete(mut self) -> Self {
        self.options.auto_delete = true;
        self
    }

    /// Restricts the queue to the declaring connection.
    ///
    /// The broker deletes it when that connection closes, so it does not
    /// survive a reconnect.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn exclusive(mut self) -> Self {
        self.options.exclusive = true;
        self
    }

    /// Turns the declaration into an existence check.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn passive(mut self) -> Self {
        self.options.passive = true;
        self
    }

    /// Sends the declaration without waiting for `declare-ok`.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn no_wait(mut self) -> Self {
        self.options.nowait = true;
        self
    }

    /// Sets the message TTL of the queue (`x-message-ttl`).
    ///
    /// Expired messages are dropped, or dead lettered when a dead letter
    /// exchange is configured.
    ///
    /// # Parameters
    /// * `ttl` - Lifetime of a message in the queue, sent in milliseconds
    ///
    /// # Returns
    /// Self for method chaining
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Caps the number of ready messages (`x-max-length`).
    ///
    /// Past the cap the broker drops or dead letters from the head.
    ///
    /// # Parameters
    /// * `messages` - Maximum message count
    ///
    /// # Returns
    /// Self for method chaining
    pub fn max_length(mut self, messages: u32) -> Self {
        self.max_length = Some(messages);
        self
    }

    /// Caps the total body size of ready messages (`x-max-length-bytes`).
    ///
    /// # Parameters
    /// * `bytes` - Maximum size in bytes
    ///
    /// # Returns
    /// Self for method chaining
    pub fn max_length_bytes(mut self, bytes: u64) -> Self {
        self.max_length_bytes = Some(bytes);
        self
    }

    /// Routes rejected and expired messages to `exchange` (`x-dead-letter-exchange`).
    ///
    /// # Parameters
    /// * `exchange` - Name of the dead letter exchange
    ///
    /// # Returns
    /// Self for method chaining
    pub fn dead_letter_exchange(mut self, exchange: &str) -> Self {
        self.dead_letter_exchange = Some(exchange.to_owned());
        self
    }

    /// Replaces the routing key of dead lettered messages.
    ///
    /// Unset, they keep the key they were published with.
    ///
    /// # Parameters
    /// * `key` - Routing key used by the dead letter exchange
    ///
    /// # Returns
    /// Self for method chaining
    pub fn dead_letter_routing_key(mut self, key: &str) -> Self {
        self.dead_letter_routing_key = Some(key.to_owned());
        self
    }

    pub(crate) fn options(&self) -> QueueDeclareOptions {
        self.options
    }

    /// The `x-` arguments sent with the declaration.
    pub fn arguments(&self) -> FieldTable {
        let mut args = FieldTable::default();
        let mut put = |key: &str, value: AMQPValue| args.insert(ShortString::from(key), value);

        if let Some(exchange) = &self.dead_letter_exchange {
            put(
                AMQP_HEADERS_DEAD_LETTER_EXCHANGE,
                AMQPValue::LongString(LongString::from(exchange.as_str())),
            );
        }
        if let Some(key) = &self.dead_letter_routing_key {
            put(
                AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY,
                AMQPValue::LongString(LongString::from(key.as_str())),
            );
        }
        if let Some(ttl) = self.ttl {
            put(
                AMQP_HEADERS_MESSAGE_TTL,
                AMQPValue::LongLongInt(ttl.as_millis() as LongLongInt),
            );
        }
        if let Some(messages) = self.max_length {
            put(
                AMQP_HEADERS_MAX_LENGTH,
                AMQPValue::LongLongInt(LongLongInt::from(messages)),
            );
        }
        if let Some(bytes) = self.max_length_bytes {
            put(
                AMQP_HEADERS_MAX_LENGTH_BYTES,
                AMQPValue::LongLongInt(bytes as LongLongInt),
            );
        }

        args
    }
}

/// Routes messages of `exchange_name` matching `routing_key` into `queue_name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
}

impl QueueBinding {
    /// Starts a binding of `queue`.
    ///
    /// Exchange and routing key are empty until set.
    ///
    /// # Parameters
    /// * `queue` - Name of the bound queue
    ///
    /// # Returns
    /// The binding, ready for chaining
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            exchange_name: String::new(),
            routing_key: String::new(),
        }
    }

    /// Source exchange of the binding.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    /// Routing key or pattern the exchange matches against.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }
}
