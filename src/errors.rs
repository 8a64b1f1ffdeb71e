// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Pub/Sub Session Manager
//!
//! This module provides the error taxonomy used across the session manager.
//! Every variant names the protocol step that failed. None of them is fatal to
//! the publisher or subscriber loops: connection and setup errors are answered
//! with a new session, publish errors with a replay of the pending message.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Connection, channel and declaration failures come out of the session
/// factory; publishing and confirm failures out of the publisher; queue,
/// binding and consumer failures out of the subscriber setup.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error starting a consumer on a queue
    #[error("failure to consume `{0}`")]
    ConsumerError(String),

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// The publish or its confirm did not complete before the deadline
    #[error("publish deadline exceeded")]
    PublishTimeout,

    /// The channel refused to enter confirm mode
    #[error("publisher confirms not supported")]
    ConfirmsNotSupported,

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Configuration rejected before any connection attempt
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The receiving side of a channel went away
    #[error("channel closed")]
    Closed,
}
