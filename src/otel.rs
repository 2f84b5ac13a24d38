// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration for RabbitMQ
//!
//! This module provides the telemetry capabilities injected into the client:
//! a tracer for consumer spans, counters for the publish/consume/reconnect
//! paths, and an adapter that propagates trace context through AMQP headers.

use lapin::{
    protocol::basic::AMQPProperties,
    types::{AMQPValue, ShortString},
};
use opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    metrics::{Counter, Meter},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context, KeyValue,
};
use std::{borrow::Cow, collections::BTreeMap, fmt, sync::Arc};
use tracing::warn;

/// Tracer and counters handed to the client at construction.
#[derive(Clone)]
pub struct Telemetry {
    tracer: Arc<BoxedTracer>,
    counters: Arc<Counters>,
}

struct Counters {
    published: Counter<u64>,
    publish_failed: Counter<u64>,
    consumed: Counter<u64>,
    retried: Counter<u64>,
    dead_lettered: Counter<u64>,
    unroutable: Counter<u64>,
    reconnects: Counter<u64>,
}

impl Telemetry {
    /// Creates the counters on `meter` and keeps `tracer` for consumer spans.
    ///
    /// # Parameters
    /// * `tracer` - Tracer starting one span per consumed delivery
    /// * `meter` - Meter the `amqp.*` counters are registered on
    ///
    /// # Returns
    /// Telemetry to hand to [`Client::new`](crate::client::Client::new)
    pub fn new(tracer: BoxedTracer, meter: &Meter) -> Telemetry {
        Telemetry {
            tracer: Arc::new(tracer),
            counters: Arc::new(Counters {
                published: meter
                    .u64_counter("amqp.messages.published")
                    .with_description("messages accepted by the broker")
                    .build(),
                publish_failed: meter
                    .u64_counter("amqp.messages.publish_failed")
                    .with_description("publishes that failed, timed out or were nacked")
                    .build(),
                consumed: meter
                    .u64_counter("amqp.messages.consumed")
                    .with_description("deliveries handled successfully")
                    .build(),
                retried: meter
                    .u64_counter("amqp.messages.retried")
                    .with_description("deliveries sent back through the dead letter chain")
                    .build(),
                dead_lettered: meter
                    .u64_counter("amqp.messages.dead_lettered")
                    .with_description("deliveries republished to a dlq")
                    .build(),
                unroutable: meter
                    .u64_counter("amqp.messages.unroutable")
                    .with_description("deliveries dropped without a handler")
                    .build(),
                reconnects: meter
                    .u64_counter("amqp.connection.reconnects")
                    .with_description("successful reconnections")
                    .build(),
            }),
        }
    }

    /// Builds telemetry from the globally installed providers (no-op when none).
    pub fn global(name: &'static str) -> Telemetry {
        Telemetry::new(global::tracer(name), &global::meter(name))
    }

    /// Tracer used for consumer spans.
    pub fn tracer(&self) -> &BoxedTracer {
        &self.tracer
    }

    pub(crate) fn published(&self, exchange: &str) {
        self.counters
            .published
            .add(1, &[KeyValue::new("exchange", exchange.to_owned())]);
    }

    pub(crate) fn publish_failed(&self, exchange: &str) {
        self.counters
            .publish_failed
            .add(1, &[KeyValue::new("exchange", exchange.to_owned())]);
    }

    pub(crate) fn consumed(&self, queue: &str) {
        self.counters
            .consumed
            .add(1, &[KeyValue::new("queue", queue.to_owned())]);
    }

    pub(crate) fn retried(&self, queue: &str) {
        self.counters
            .retried
            .add(1, &[KeyValue::new("queue", queue.to_owned())]);
    }

    pub(crate) fn dead_lettered(&self, queue: &str) {
        self.counters
            .dead_lettered
            .add(1, &[KeyValue::new("queue", queue.to_owned())]);
    }

    pub(crate) fn unroutable(&self, queue: &str) {
        self.counters
            .unroutable
            .add(1, &[KeyValue::new("queue", queue.to_owned())]);
    }

    pub(crate) fn reconnected(&self) {
        self.counters.reconnects.add(1, &[]);
    }
}

impl fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Telemetry").finish_non_exhaustive()
    }
}

/// An adapter for injecting and extracting OpenTelemetry context from RabbitMQ headers.
pub(crate) struct RabbitMQTracePropagator<'a> {
    headers: &'a mut BTreeMap<ShortString, AMQPValue>,
}

impl<'a> RabbitMQTracePropagator<'a> {
    pub(crate) fn new(headers: &'a mut BTreeMap<ShortString, AMQPValue>) -> Self {
        Self { headers }
    }
}

impl Injector for RabbitMQTracePropagator<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(
            key.to_lowercase().into(),
            AMQPValue::LongString(value.into()),
        );
    }
}

impl Extractor for RabbitMQTracePropagator<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        match self.headers.get(key)? {
            AMQPValue::LongString(value) => std::str::from_utf8(value.as_bytes())
                .map_err(|err| warn!(error = err.to_string(), key, "undecodable trace header"))
                .ok(),
            AMQPValue::ShortString(value) => Some(value.as_str()),
            _ => None,
        }
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(|header| header.as_str()).collect()
    }
}

/// Writes the trace context of `ctx` into outgoing message headers.
pub(crate) fn inject_context(ctx: &Context, headers: &mut BTreeMap<ShortString, AMQPValue>) {
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut RabbitMQTracePropagator::new(headers))
    });
}

/// Creates a consumer span whose parent is the context carried by the delivery headers.
pub(crate) fn new_span(
    props: &AMQPProperties,
    tracer: &BoxedTracer,
    name: &str,
) -> (Context, BoxedSpan) {
    let mut headers = props
        .headers()
        .clone()
        .unwrap_or_default()
        .inner()
        .clone();

    let ctx = global::get_text_map_propagator(|propagator| {
        propagator.extract(&RabbitMQTracePropagator::new(&mut headers))
    });

    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    (ctx, span)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::types::LongString;

    #[test]
    fn propagator_lowercases_injected_keys() {
        let mut headers = BTreeMap::new();
        let mut propagator = RabbitMQTracePropagator::new(&mut headers);
        propagator.set("TraceParent", "00-abc-def-01".to_owned());

        assert_eq!(
            headers.get(&ShortString::from("traceparent")),
            Some(&AMQPValue::LongString(LongString::from("00-abc-def-01")))
        );
    }

    #[test]
    fn extractor_ignores_non_string_values() {
        let mut headers = BTreeMap::new();
        headers.insert(ShortString::from("count"), AMQPValue::LongLongInt(3));
        headers.insert(
            ShortString::from("traceparent"),
            AMQPValue::LongString(LongString::from("00-abc-def-01")),
        );
        let propagator = RabbitMQTracePropagator::new(&mut headers);

        assert_eq!(propagator.get("count"), None);
        assert_eq!(propagator.get("traceparent"), Some("00-abc-def-01"));
        assert_eq!(propagator.keys().len(), 2);
    }
}
