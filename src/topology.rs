// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology
//!
//! Declares exchanges, queues and the bindings between them.
//! Every declaration is idempotent and safe to run on every startup.
//!
//! Besides plain declarations it provides:
//! - `setup_dlq`: a dead letter exchange + queue pair,
//! - `declare_queue_with_dlq` / `declare_queue_with_dlq_and_ttl`: primary
//!   queues carrying dead letter (and TTL) arguments,
//! - `setup_delayed_retry_queue`: delayed redelivery without a broker plugin:
//!
//! ```text
//! <q>.exchange --#--> <q> --(reject)--> <q>.retry.exchange --#--> <q>.retry
//!      ^                                                             |
//!      +---------------------(ttl expired, same routing key)---------+
//! <q>.dlq.exchange --#--> <q>.dlq      (exhausted messages)
//! ```

use crate::{
    broker::BrokerChannel,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use lapin::types::FieldTable;
use std::{sync::Arc, time::Duration};
use tracing::debug;

// Queue declaration arguments understood by RabbitMQ.
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Milliseconds.
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
pub const AMQP_HEADERS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";

/// Binding key matching every routing key on a topic exchange.
pub const MATCH_ALL: &str = "#";

/// Declares one exchange.
///
/// Redeclaring an exchange with the same settings is a no-op on the broker;
/// different settings make it close the channel.
///
/// # Parameters
/// * `channel` - Channel the declaration is sent on
/// * `def` - Exchange to declare
///
/// # Returns
/// Ok once the broker acknowledged the declaration
pub async fn declare_exchange(
    channel: &dyn BrokerChannel,
    def: &ExchangeDefinition,
) -> Result<(), AmqpError> {
    debug!("creating exchange: {}", def.name);
    channel
        .exchange_declare(&def.name, def.kind.into(), def.options(), def.arguments())
        .await?;
    debug!("exchange: {} was created", def.name);
    Ok(())
}

/// Declares one queue with the `x-` arguments of its definition.
///
/// # Parameters
/// * `channel` - Channel the declaration is sent on
/// * `def` - Queue to declare
///
/// # Returns
/// Ok once the broker acknowledged the declaration
pub async fn declare_queue(
    channel: &dyn BrokerChannel,
    def: &QueueDefinition,
) -> Result<(), AmqpError> {
    debug!("creating queue: {}", def.name);
    channel
        .queue_declare(&def.name, def.options(), def.arguments())
        .await?;
    debug!("queue: {} was created", def.name);
    Ok(())
}

/// Binds a queue to an exchange.
///
/// # Parameters
/// * `channel` - Channel the binding is sent on
/// * `binding` - Queue, exchange and routing key to bind
///
/// # Returns
/// Ok once the broker acknowledged the binding
pub async fn bind_queue(
    channel: &dyn BrokerChannel,
    binding: &QueueBinding,
) -> Result<(), AmqpError> {
    debug!(
        "binding queue: {} to the exchange: {} with the key: {}",
        binding.queue_name, binding.exchange_name, binding.routing_key
    );
    channel
        .queue_bind(
            &binding.queue_name,
            &binding.exchange_name,
            &binding.routing_key,
            FieldTable::default(),
        )
        .await
}

/// Describes a dead letter exchange and the queue collecting its messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DlqConfig {
    /// Topic exchange receiving the dead letters.
    pub exchange: String,
    pub queue: String,
    /// Binding key between `exchange` and `queue`.
    pub routing_key: String,
    /// How long dead letters are kept, forever when unset.
    pub ttl: Option<Duration>,
    pub max_length: Option<u32>,
    pub durable: bool,
}

impl DlqConfig {
    /// Conventional `<queue>.dlx` / `<queue>.dlq` names, durable, catch-all binding.
    pub fn for_queue(queue: &str) -> DlqConfig {
        DlqConfig {
            exchange: format!("{queue}.dlx"),
            queue: dlq_name(queue),
            routing_key: MATCH_ALL.to_owned(),
            ttl: None,
            max_length: None,
            durable: true,
        }
    }
}

/// `<queue>.dlq`
pub fn dlq_name(queue: &str) -> String {
    format!("{queue}.dlq")
}

/// `<queue>.retry`
pub fn retry_name(queue: &str) -> String {
    format!("{queue}.retry")
}

/// Declares the DLQ exchange (topic), the DLQ queue and binds them.
///
/// # Parameters
/// * `channel` - Channel the declarations are sent on
/// * `cfg` - Names and limits of the pair, see [`DlqConfig::for_queue`]
///
/// # Returns
/// Ok once exchange, queue and binding exist
pub async fn setup_dlq(channel: &dyn BrokerChannel, cfg: &DlqConfig) -> Result<(), AmqpError> {
    let mut exchange = ExchangeDefinition::new(&cfg.exchange).topic();
    let mut queue = QueueDefinition::new(&cfg.queue);
    if cfg.durable {
        exchange = exchange.durable();
        queue = queue.durable();
    }
    if let Some(ttl) = cfg.ttl {
        queue = queue.ttl(ttl);
    }
    if let Some(max) = cfg.max_length {
        queue = queue.max_length(max);
    }

    declare_exchange(channel, &exchange).await?;
    declare_queue(channel, &queue).await?;
    bind_queue(
        channel,
        &QueueBinding::new(&cfg.queue)
            .exchange(&cfg.exchange)
            .routing_key(&cfg.routing_key),
    )
    .await
}

/// Declares a durable queue whose rejected messages go to `dlx`.
///
/// # Parameters
/// * `channel` - Channel the declaration is sent on
/// * `queue` - Name of the queue
/// * `dlx` - Dead letter exchange
/// * `dlq_routing_key` - Routing key of dead letters, the message's own key when `None`
pub async fn declare_queue_with_dlq(
    channel: &dyn BrokerChannel,
    queue: &str,
    dlx: &str,
    dlq_routing_key: Option<&str>,
) -> Result<(), AmqpError> {
    declare_queue(channel, &dead_lettered(queue, dlx, dlq_routing_key)).await
}

/// Same as [`declare_queue_with_dlq`], messages also expire to `dlx` after `ttl`.
pub async fn declare_queue_with_dlq_and_ttl(
    channel: &dyn BrokerChannel,
    queue: &str,
    dlx: &str,
    dlq_routing_key: Option<&str>,
    ttl: Duration,
) -> Result<(), AmqpError> {
    declare_queue(channel, &dead_lettered(queue, dlx, dlq_routing_key).ttl(ttl)).await
}

fn dead_lettered(queue: &str, dlx: &str, dlq_routing_key: Option<&str>) -> QueueDefinition {
    let def = QueueDefinition::new(queue)
        .durable()
        .dead_letter_exchange(dlx);
    match dlq_routing_key {
        Some(key) => def.dead_letter_routing_key(key),
        None => def,
    }
}

/// Names produced by [`setup_delayed_retry_queue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelayedRetryTopology {
    pub queue: String,
    pub exchange: String,
    pub retry_queue: String,
    pub retry_exchange: String,
    pub dlq: String,
    pub dlq_exchange: String,
    pub delay: Duration,
}

impl DelayedRetryTopology {
    /// Derives every name of the pattern from `queue`.
    pub fn new(queue: &str, delay: Duration) -> DelayedRetryTopology {
        DelayedRetryTopology {
            queue: queue.to_owned(),
            exchange: format!("{queue}.exchange"),
            retry_queue: retry_name(queue),
            retry_exchange: format!("{}.exchange", retry_name(queue)),
            dlq: dlq_name(queue),
            dlq_exchange: format!("{}.exchange", dlq_name(queue)),
            delay,
        }
    }
}

/// Wires the three-exchange delayed retry pattern for `queue`.
///
/// Rejected messages wait `delay` in `<queue>.retry` and come back to
/// `<queue>` with their publish routing key. Consumers publish exhausted
/// messages to `<queue>.dlq.exchange`, which feeds `<queue>.dlq`.
///
/// # Parameters
/// * `channel` - Channel the declarations are sent on
/// * `queue` - Name of the primary queue
/// * `delay` - Time a rejected message waits before redelivery
///
/// # Returns
/// The names of everything declared
pub async fn setup_delayed_retry_queue(
    channel: &dyn BrokerChannel,
    queue: &str,
    delay: Duration,
) -> Result<DelayedRetryTopology, AmqpError> {
    let topology = DelayedRetryTopology::new(queue, delay);

    for exchange in [
        &topology.exchange,
        &topology.retry_exchange,
        &topology.dlq_exchange,
    ] {
        declare_exchange(channel, &ExchangeDefinition::new(exchange).topic().durable()).await?;
    }

    declare_queue(
        channel,
        &QueueDefinition::new(&topology.queue)
            .durable()
            .dead_letter_exchange(&topology.retry_exchange),
    )
    .await?;
    declare_queue(
        channel,
        &QueueDefinition::new(&topology.retry_queue)
            .durable()
            .ttl(delay)
            .dead_letter_exchange(&topology.exchange),
    )
    .await?;
    declare_queue(channel, &QueueDefinition::new(&topology.dlq).durable()).await?;

    for (queue, exchange) in [
        (&topology.queue, &topology.exchange),
        (&topology.retry_queue, &topology.retry_exchange),
        (&topology.dlq, &topology.dlq_exchange),
    ] {
        bind_queue(
            channel,
            &QueueBinding::new(queue)
                .exchange(exchange)
                .routing_key(MATCH_ALL),
        )
        .await?;
    }

    debug!(queue, delay_ms = delay.as_millis() as u64, "delayed retry topology ready");
    Ok(topology)
}

/// A batch of declarations installed in one go.
#[async_trait]
pub trait Topology {
    /// Adds an exchange to declare.
    ///
    /// # Returns
    /// Self for method chaining
    fn exchange(self, def: ExchangeDefinition) -> Self;

    /// Adds a queue to declare.
    ///
    /// # Returns
    /// Self for method chaining
    fn queue(self, def: QueueDefinition) -> Self;

    /// Adds a binding, created after every exchange and queue exists.
    ///
    /// # Returns
    /// Self for method chaining
    fn queue_binding(self, binding: QueueBinding) -> Self;

    /// Declares every exchange, then every queue, then every binding.
    async fn install(&self) -> Result<(), AmqpError>;
}

/// [`Topology`] declared over one channel.
///
/// Usually obtained from [`Client::topology`](crate::client::Client::topology)
/// and handed back to [`Client::install`](crate::client::Client::install).
pub struct AmqpTopology {
    channel: Arc<dyn BrokerChannel>,
    exchanges: Vec<ExchangeDefinition>,
    queues: Vec<QueueDefinition>,
    bindings: Vec<QueueBinding>,
}

impl AmqpTopology {
    /// Empty batch declaring on `channel`.
    pub fn new(channel: Arc<dyn BrokerChannel>) -> AmqpTopology {
        AmqpTopology {
            channel,
            exchanges: Vec::new(),
            queues: Vec::new(),
            bindings: Vec::new(),
        }
    }

    pub(crate) fn channel(&self) -> Arc<dyn BrokerChannel> {
        self.channel.clone()
    }
}

#[async_trait]
impl Topology for AmqpTopology {
    fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    /// A later definition with the same name replaces the earlier one.
    fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.retain(|queue| queue.name != def.name);
        self.queues.push(def);
        self
    }

    fn queue_binding(mut self, binding: QueueBinding) -> Self {
        self.bindings.push(binding);
        self
    }

    async fn install(&self) -> Result<(), AmqpError> {
        for exchange in &self.exchanges {
            declare_exchange(self.channel.as_ref(), exchange).await?;
        }
        for queue in &self.queues {
            declare_queue(self.channel.as_ref(), queue).await?;
        }
        for binding in &self.bindings {
            bind_queue(self.channel.as_ref(), binding).await?;
        }

        debug!("topology installed");
        Ok(())
    }
}
