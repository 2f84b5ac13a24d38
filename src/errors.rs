// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for RabbitMQ Implementation
//!
//! This module provides the error taxonomy shared by every component of the
//! client. The `AmqpError` enum separates three families of failures:
//!
//! - configuration errors, returned once at construction and never retried,
//! - lifecycle errors (`ClientClosed`, `NoConnection`, `Reconnecting`, ...)
//!   that tell the caller about the current connection state,
//! - operational errors produced while talking to the broker.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Each variant identifies the stage that failed, so callers can tell a
/// channel acquisition problem from a broker rejection or a confirm timeout.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// The client, manager or pool was explicitly closed
    #[error("client closed")]
    ClientClosed,

    /// The broker connection was closed underneath the operation
    #[error("connection closed")]
    ConnectionClosed,

    /// The channel used by the operation is closed
    #[error("channel closed")]
    ChannelClosed,

    /// There is no live connection and none is being re-established
    #[error("no active connection")]
    NoConnection,

    /// A reconnect sequence is in progress
    #[error("reconnecting")]
    Reconnecting,

    /// The broker did not confirm a publish within the deadline
    #[error("publish confirmation timed out")]
    PublishTimeout,

    /// The broker negatively acknowledged a publish
    #[error("publish was negatively acknowledged by the broker")]
    PublishConfirmFailed,

    /// The configured connection strategy cannot be used
    #[error("invalid connection strategy `{0}`")]
    InvalidStrategy(String),

    /// The broker URL is missing
    #[error("missing broker url")]
    MissingUrl,

    /// A TLS strategy was selected without the TLS settings it needs
    #[error("missing tls config: {0}")]
    MissingTlsConfig(String),

    /// A certificate or identity file could not be read or parsed
    #[error("invalid certificate `{0}`")]
    InvalidCertificate(String),

    /// A configuration field holds an invalid value
    #[error("invalid config `{field}`: {reason}")]
    InvalidConfig {
        field: &'static str,
        reason: &'static str,
    },

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error publishing a message
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// Error publishing a message of a batch, `published` messages went out before it
    #[error("failure to publish batch message at index {index}")]
    BatchPublishError {
        index: usize,
        published: usize,
        #[source]
        source: Box<AmqpError>,
    },

    /// Error serializing a message payload
    #[error("failure to serialize payload: {0}")]
    SerializePayloadError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error publishing a message to the Dead Letter Queue (DLQ)
    #[error("failure to publish to dlq: {0}")]
    PublishingToDLQError(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring a consumer
    #[error("consumer declaration error `{0}`")]
    ConsumerDeclarationError(String),

    /// A consumer was started without any registered handler
    #[error("no handlers registered for consumer `{0}`")]
    NoHandlers(String),

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),
}

impl AmqpError {
    /// Whether the failure is transient and the operation may succeed if retried.
    ///
    /// `ClientClosed` is terminal. Confirm failures are not retryable here:
    /// a nack means the broker refused the message and needs investigation.
    pub fn is_retryable(&self) -> bool {
        match self {
            AmqpError::NoConnection
            | AmqpError::Reconnecting
            | AmqpError::ConnectionClosed
            | AmqpError::ChannelClosed
            | AmqpError::PublishTimeout => true,
            AmqpError::BatchPublishError { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// Whether the error was raised while validating configuration.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            AmqpError::InvalidStrategy(_)
                | AmqpError::MissingUrl
                | AmqpError::MissingTlsConfig(_)
                | AmqpError::InvalidCertificate(_)
                | AmqpError::InvalidConfig { .. }
        )
    }
}
