// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Messages
//!
//! Values that travel between the application and the loops: outbound
//! messages, broker confirms, inbound deliveries and publish outcomes.

use lapin::types::{AMQPValue, ShortString};
use std::collections::BTreeMap;

/// A message handed to the publisher by the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    routing_key: String,
    body: Vec<u8>,
}

impl OutboundMessage {
    pub fn new(routing_key: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        OutboundMessage {
            routing_key: routing_key.into(),
            body: body.into(),
        }
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }
}

/// Broker answer to the most recently published message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Confirmation {
    pub delivery_tag: u64,
    pub acknowledged: bool,
}

impl Confirmation {
    pub fn ack(delivery_tag: u64) -> Self {
        Confirmation {
            delivery_tag,
            acknowledged: true,
        }
    }

    pub fn nack(delivery_tag: u64) -> Self {
        Confirmation {
            delivery_tag,
            acknowledged: false,
        }
    }
}

/// A message received by the subscriber, before it is handed downstream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub headers: BTreeMap<ShortString, AMQPValue>,
}

impl Delivery {
    pub fn new(delivery_tag: u64, body: impl Into<Vec<u8>>) -> Self {
        Delivery {
            delivery_tag,
            body: body.into(),
            ..Delivery::default()
        }
    }
}

/// Final state of a message once the broker has confirmed or rejected it.
///
/// Only reported when the publisher was given an outcome channel; otherwise
/// nacks are logged and the message is dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishOutcome {
    pub message: OutboundMessage,
    pub delivery_tag: u64,
    pub acknowledged: bool,
}
