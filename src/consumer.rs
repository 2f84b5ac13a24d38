// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! This module processes a single delivery: handler lookup, acknowledgment,
//! retry accounting and the Dead Letter Queue (DLQ) escape hatch.
//!
//! The retry count is read from the broker-maintained `x-death` header, so it
//! survives consumer restarts and holds across several consumer instances.
//! Below `max_retries` a failed delivery is rejected without requeue and the
//! queue's dead letter exchange routes it through the delayed retry chain. At
//! or above the threshold it is republished to the DLQ exchange and only then
//! acknowledged.

use crate::{
    broker::{BrokerChannel, Delivery},
    client::Client,
    dispatcher::ConsumerConfig,
    errors::AmqpError,
    handler::{ConsumerHandler, ConsumerMessage},
    otel,
};
use lapin::{
    types::{AMQPValue, FieldTable},
    BasicProperties,
};
use opentelemetry::{
    global::BoxedSpan,
    trace::{Span, Status},
};
use std::{borrow::Cow, sync::Arc};
use tracing::{debug, error, warn};

/// Constant for the x-death header used in RabbitMQ's dead-lettering mechanism
pub const AMQP_HEADERS_X_DEATH: &str = "x-death";
/// Constant for the count field in the x-death header
pub const AMQP_HEADERS_COUNT: &str = "count";

/// Suffix appended to the routing key of messages republished to the DLQ.
pub const DLQ_ROUTING_SUFFIX: &str = ".dlq";

/// What happened to a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Acked,
    Unroutable,
    Retried,
    DeadLettered,
}

/// Processes one delivery received on `channel`.
///
/// The delivery is always settled (ack or nack) unless the settle call itself
/// fails, in which case the broker redelivers it once the channel closes.
pub(crate) async fn consume(
    client: &Client,
    cfg: &ConsumerConfig,
    max_retries: u32,
    handler: Option<Arc<dyn ConsumerHandler>>,
    channel: &dyn BrokerChannel,
    delivery: &Delivery,
) -> Result<Outcome, AmqpError> {
    let telemetry = client.telemetry();
    let count = retry_count(&delivery.properties);

    let (ctx, mut span) = otel::new_span(
        &delivery.properties,
        telemetry.tracer(),
        &format!("{} receive", cfg.queue),
    );

    debug!(
        queue = cfg.queue,
        routing_key = delivery.routing_key,
        retry_count = count,
        "message received"
    );

    let Some(handler) = handler else {
        let msg = "removing message from queue - reason: no handler for routing key";
        warn!(queue = cfg.queue, routing_key = delivery.routing_key, "{}", msg);
        mark_failed(&mut span, msg);

        telemetry.unroutable(&cfg.queue);
        return ack(channel, delivery, &mut span)
            .await
            .map(|_| Outcome::Unroutable);
    };

    let msg = ConsumerMessage {
        queue: cfg.queue.clone(),
        routing_key: delivery.routing_key.clone(),
        data: delivery.data.clone(),
        headers: delivery.properties.headers().clone().unwrap_or_default(),
        message_id: delivery.properties.message_id().as_ref().map(|id| id.to_string()),
        correlation_id: delivery
            .properties
            .correlation_id()
            .as_ref()
            .map(|id| id.to_string()),
        retry_count: count,
        redelivered: delivery.redelivered,
    };

    let err = match handler.exec(&ctx, &msg).await {
        Ok(()) => {
            debug!(queue = cfg.queue, "message successfully processed");
            ack(channel, delivery, &mut span).await?;
            span.set_status(Status::Ok);
            telemetry.consumed(&cfg.queue);
            return Ok(Outcome::Acked);
        }
        Err(err) => err,
    };

    span.set_status(Status::Error {
        description: Cow::from(err.to_string()),
    });

    if count < i64::from(max_retries) {
        warn!(
            queue = cfg.queue,
            retry_count = count,
            error = err.to_string(),
            "error whiling handling msg, sending to retry"
        );

        if let Err(e) = channel.nack(delivery.delivery_tag, false).await {
            error!(error = e.to_string(), "error whiling nack msg");
            mark_failed(&mut span, "error to nack msg");
            return Err(AmqpError::NackMessageError);
        }

        telemetry.retried(&cfg.queue);
        return Ok(Outcome::Retried);
    }

    error!(
        queue = cfg.queue,
        retry_count = count,
        error = err.to_string(),
        "too many attempts, sending to dlq"
    );

    if let Err(e) = send_dlq(client, cfg, delivery).await {
        error!(error = e.to_string(), "error whiling sending to dlq");
        mark_failed(&mut span, "error to send msg to dlq");

        // keep the message in the primary queue so it is not lost
        if let Err(e) = channel.nack(delivery.delivery_tag, true).await {
            error!(error = e.to_string(), "error whiling requeuing msg");
        }
        return Err(AmqpError::PublishingToDLQError(e.to_string()));
    }

    ack(channel, delivery, &mut span).await?;
    telemetry.dead_lettered(&cfg.queue);
    Ok(Outcome::DeadLettered)
}

/// Republishes the delivery to the DLQ exchange, without its `x-death` history.
async fn send_dlq(
    client: &Client,
    cfg: &ConsumerConfig,
    delivery: &Delivery,
) -> Result<(), AmqpError> {
    let publisher = client.channel_pool()?.publisher_channel()?;
    let routing_key = format!("{}{}", delivery.routing_key, DLQ_ROUTING_SUFFIX);
    let properties = strip_x_death(&delivery.properties);

    if publisher.confirms() {
        publisher
            .publish_with_confirm(
                &cfg.dlq_exchange,
                &routing_key,
                &delivery.data,
                properties,
                client.config().publish_timeout,
            )
            .await
    } else {
        publisher
            .publish_without_confirm(&cfg.dlq_exchange, &routing_key, &delivery.data, properties)
            .await
    }
}

async fn ack(
    channel: &dyn BrokerChannel,
    delivery: &Delivery,
    span: &mut BoxedSpan,
) -> Result<(), AmqpError> {
    channel.ack(delivery.delivery_tag).await.map_err(|e| {
        error!(error = e.to_string(), "error whiling ack msg");
        mark_failed(span, "error to ack msg");
        AmqpError::AckMessageError
    })
}

fn mark_failed(span: &mut BoxedSpan, description: &'static str) {
    span.record_error(&AmqpError::ConsumerError(description.to_owned()));
    span.set_status(Status::Error {
        description: Cow::from(description),
    });
}

/// Number of times the message was dead-lettered, from the `x-death` header.
///
/// Takes the highest `count` across entries; a missing or malformed header
/// means the message was never dead-lettered.
pub fn retry_count(props: &BasicProperties) -> i64 {
    let Some(headers) = props.headers() else {
        return 0;
    };
    let Some(AMQPValue::FieldArray(deaths)) = headers.inner().get(AMQP_HEADERS_X_DEATH) else {
        return 0;
    };

    deaths
        .as_slice()
        .iter()
        .filter_map(|death| match death {
            AMQPValue::FieldTable(table) => table.inner().get(AMQP_HEADERS_COUNT),
            _ => None,
        })
        .filter_map(as_integer)
        .max()
        .unwrap_or_default()
}

fn as_integer(value: &AMQPValue) -> Option<i64> {
    match value {
        AMQPValue::ShortShortInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortShortUInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortUInt(v) => Some(i64::from(*v)),
        AMQPValue::LongInt(v) => Some(i64::from(*v)),
        AMQPValue::LongUInt(v) => Some(i64::from(*v)),
        AMQPValue::LongLongInt(v) => Some(*v),
        _ => None,
    }
}

fn strip_x_death(props: &BasicProperties) -> BasicProperties {
    let mut headers = props.headers().clone().unwrap_or_default().inner().clone();
    headers.remove(AMQP_HEADERS_X_DEATH);
    props.clone().with_headers(FieldTable::from(headers))
}
