// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types
//!
//! This module provides the error type for all AMQP operations in this crate.
//! The `AmqpError` enum covers connection, channel, subscription, topology
//! and acknowledgement failures.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos for queue `{0}`")]
    QoSDeclarationError(String),

    /// Error registering a consumer on a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind queue `{1}` to exchange `{0}`")]
    BindingExchangeToQueueError(String, String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error serializing a message payload
    #[error("failure to parse payload")]
    ParsePayloadError,

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// The broker refused to confirm a published message
    #[error("publish was not confirmed by the broker")]
    PublishConfirmationError,

    /// Publish was attempted without an exchange or routing key
    #[error("exchange or routing key must be provided")]
    MissingRouteError,

    /// No registered handler accepted the configured queue
    #[error("no handler registered for queue `{0}`")]
    MissingHandlerError(String),

    /// Required configuration was absent at startup
    #[error("missing required configuration `{0}`")]
    MissingConfigurationError(String),

    /// The subscriber or publisher was already disposed
    #[error("already closed")]
    ClosedError,
}
