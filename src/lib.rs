// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Resilient RabbitMQ client: managed reconnection, a channel pool with
//! publisher confirms, header-based retry accounting with dead lettering,
//! and declarative retry topology.

mod lapin_broker;
mod otel;
#[cfg(test)]
pub(crate) mod testing;

pub mod backoff;
pub mod broker;
pub mod channel;
pub mod client;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod publisher;
pub mod queue;
pub mod strategy;
pub mod topology;

pub use client::Client;
pub use config::{Config, StrategyKind, TlsConfig};
pub use connection::ConnectionState;
pub use dispatcher::{Consumer, ConsumerConfig};
pub use errors::AmqpError;
pub use handler::{ConsumerHandler, ConsumerMessage, HandlerError};
pub use otel::Telemetry;
pub use publisher::{PublishOptions, Publisher};
