// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Transport Session Seams
//!
//! A transport session is one live connection plus channel to the broker. The
//! loops never talk to lapin directly; they go through these traits so the
//! redial, publish and subscribe logic stays independent of the wire client.
//!
//! A session is owned by exactly one loop at a time and is closed as soon as
//! that loop gives up on it.

use crate::{
    errors::AmqpError,
    message::{Confirmation, Delivery, OutboundMessage},
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;

/// Stream of deliveries opened by [`SubscribeSession::consume`].
pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

/// Produces one transport session per call.
///
/// Any failure is final for that call. Retrying is the caller's business.
#[async_trait]
pub trait SessionFactory: Send + Sync + 'static {
    type Session: Send + 'static;

    async fn create(&self) -> Result<Self::Session, AmqpError>;

    /// Tears down a session that was created but never handed to a loop.
    async fn discard(&self, session: Self::Session);
}

/// Operations the publisher needs from a session.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PublishSession: Send {
    /// Puts the channel in confirm mode.
    async fn enable_confirms(&mut self) -> Result<(), AmqpError>;

    /// Publishes one message on the given exchange.
    async fn publish(&mut self, exchange: &str, message: &OutboundMessage)
        -> Result<(), AmqpError>;

    /// Waits for the next broker confirm, in publish order.
    ///
    /// `None` means the confirm feed is gone and the session is unusable.
    async fn next_confirm(&mut self) -> Option<Confirmation>;

    async fn close(&mut self);
}

/// Operations the subscriber needs from a session.
#[async_trait]
pub trait SubscribeSession: Send {
    async fn declare_queue(&mut self, queue: &QueueDefinition) -> Result<(), AmqpError>;

    async fn bind_queue(&mut self, binding: &QueueBinding<'_>) -> Result<(), AmqpError>;

    async fn consume(&mut self, queue: &str) -> Result<DeliveryStream, AmqpError>;

    async fn ack(&mut self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn close(&mut self);
}
