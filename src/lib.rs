// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Resilient RabbitMQ Publish/Subscribe
//!
//! Keeps a logical publisher and a logical subscriber alive across broker
//! reconnects. The publisher holds at most one unconfirmed message and
//! replays it on a fresh session after any transport failure; the
//! subscriber acknowledges a delivery only once the application took it.

mod otel;

pub mod channel;
pub mod config;
pub mod errors;
pub mod exchange;
pub mod identity;
pub mod message;
pub mod publisher;
pub mod pubsub;
pub mod queue;
pub mod redial;
pub mod session;
pub mod subscriber;

#[cfg(test)]
mod testing;
