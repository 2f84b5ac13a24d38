// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Definitions
//!
//! Builder for exchange declarations. Declaring is done by
//! [`topology::declare_exchange`](crate::topology::declare_exchange) or
//! through the client.

use lapin::{
    options::ExchangeDeclareOptions,
    types::{AMQPValue, FieldTable, LongString, ShortString},
};

/// Argument naming the exchange that receives messages this one cannot route
pub const AMQP_ARGS_ALTERNATE_EXCHANGE: &str = "alternate-exchange";

/// Routing behavior of an exchange.
///
/// `Topic` is what the retry and DLQ topology uses: bindings with `#` match
/// every routing key while keeping the key on the message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Exact routing key match.
    #[default]
    Direct,
    /// Every bound queue, routing key ignored.
    Fanout,
    /// Dotted pattern match with `*` and `#`.
    Topic,
    /// Match on message headers.
    Headers,
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> lapin::ExchangeKind {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
        }
    }
}

/// An exchange to declare. Non-durable direct exchange unless configured otherwise.
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) kind: ExchangeKind,
    options: ExchangeDeclareOptions,
    arguments: FieldTable,
}

impl ExchangeDefinition {
    /// Starts the definition of exchange `name`.
    ///
    /// The exchange is a non-durable `direct` exchange without arguments
    /// until the builder methods say otherwise.
    ///
    /// # Parameters
    /// * `name` - Exchange name as known by the broker
    ///
    /// # Returns
    /// The definition, ready for chaining
    ///
    /// # Example
    /// ```
    /// use rabbitmq::exchange::ExchangeDefinition;
    ///
    /// let events = ExchangeDefinition::new("events").topic().durable();
    /// assert_eq!(events.name(), "events");
    /// ```
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            kind: ExchangeKind::default(),
            options: ExchangeDeclareOptions::default(),
            arguments: FieldTable::default(),
        }
    }

    /// Name the exchange is declared with.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Selects the routing behavior of the exchange.
    ///
    /// # Parameters
    /// * `kind` - One of the [`ExchangeKind`] variants
    ///
    /// # Returns
    /// Self for method chaining
    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    /// Shorthand for `kind(ExchangeKind::Direct)`.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn direct(self) -> Self {
        self.kind(ExchangeKind::Direct)
    }

    /// Shorthand for `kind(ExchangeKind::Fanout)`.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn fanout(self) -> Self {
        self.kind(ExchangeKind::Fanout)
    }

    /// Shorthand for `kind(ExchangeKind::Topic)`.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn topic(self) -> Self {
        self.kind(ExchangeKind::Topic)
    }

    /// Shorthand for `kind(ExchangeKind::Headers)`.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn headers(self) -> Self {
        self.kind(ExchangeKind::Headers)
    }

    /// Keeps the exchange across broker restarts.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn durable(mut self) -> Self {
        self.options.durable = true;
        self
    }

    /// Lets the broker remove the exchange once its last binding is gone.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn auto_delete(mut self) -> Self {
        self.options.auto_delete = true;
        self
    }

    /// Turns the declaration into an existence check.
    ///
    /// The broker answers with a channel error when the exchange is missing
    /// and never creates it.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn passive(mut self) -> Self {
        self.options.passive = true;
        self
    }

    /// Hides the exchange from publishers.
    ///
    /// Only exchange-to-exchange bindings can route into it.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn internal(mut self) -> Self {
        self.options.internal = true;
        self
    }

    /// Sends the declaration without waiting for `declare-ok`.
    ///
    /// Errors then surface later as a channel close.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn no_wait(mut self) -> Self {
        self.options.nowait = true;
        self
    }

    /// Adds a raw declaration argument, replacing any previous value of `key`.
    ///
    /// # Parameters
    /// * `key` - Argument name
    /// * `value` - Argument value
    ///
    /// # Returns
    /// Self for method chaining
    pub fn argument(mut self, key: &str, value: AMQPValue) -> Self {
        self.arguments.insert(ShortString::from(key), value);
        self
    }

    /// Forwards messages matching no binding to `exchange`.
    ///
    /// # Parameters
    /// * `exchange` - Name of the alternate exchange
    ///
    /// # Returns
    /// Self for method chaining
    pub fn alternate_exchange(self, exchange: &str) -> Self {
        self.argument(
            AMQP_ARGS_ALTERNATE_EXCHANGE,
            AMQPValue::LongString(LongString::from(exchange)),
        )
    }

    pub(crate) fn options(&self) -> ExchangeDeclareOptions {
        self.options
    }

    pub(crate) fn arguments(&self) -> FieldTable {
        self.arguments.clone()
    }
}
