// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Subscriber Loop
//!
//! Consumes the shared exchange through its own queue and forwards every
//! payload to the application.
//!
//! On every session the queue is declared (exclusive, non-durable,
//! auto-deleted), bound to the exchange, and consumed with manual acks. A
//! delivery is acknowledged only after the application sink accepted it, so
//! a crash in between leads to redelivery rather than loss.
//!
//! Any setup failure abandons the session, and the next one is requested from
//! the redial loop after a backoff delay. A subscriber that keeps failing to
//! declare or bind its queue therefore does not hammer the broker. When the
//! delivery feed ends or an ack fails, the next session is requested right
//! away.

use crate::{
    errors::AmqpError,
    message::Delivery,
    otel,
    queue::{QueueBinding, QueueDefinition},
    redial::{Backoff, Sessions},
    session::{DeliveryStream, SubscribeSession},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use opentelemetry::{
    global::{self, BoxedTracer},
    trace::{Span, Status},
};
use std::borrow::Cow;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Where delivered payloads go.
#[async_trait]
pub trait MessageSink: Send {
    /// Hands one payload to the application. An error means the application
    /// stopped listening.
    async fn deliver(&mut self, body: Vec<u8>) -> Result<(), AmqpError>;
}

#[async_trait]
impl MessageSink for mpsc::Sender<Vec<u8>> {
    async fn deliver(&mut self, body: Vec<u8>) -> Result<(), AmqpError> {
        self.send(body).await.map_err(|_| AmqpError::Closed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    /// Get a new session and subscribe again.
    Resubscribe,
    /// Subscribing failed; wait before the next session.
    BackOff,
    Stop,
}

pub struct SubscriberLoop {
    queue: QueueDefinition,
    exchange: String,
    routing_key: String,
    backoff: Backoff,
    token: CancellationToken,
}

impl SubscriberLoop {
    /// Subscriber on `exchange` through `queue`.
    pub fn new(
        queue: QueueDefinition,
        exchange: &str,
        routing_key: &str,
        token: CancellationToken,
    ) -> Self {
        SubscriberLoop {
            queue,
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            backoff: Backoff::default(),
            token,
        }
    }

    /// Delay policy between sessions on which subscribing failed.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn queue(&self) -> &QueueDefinition {
        &self.queue
    }

    /// Runs until the session sequence ends, the sink is closed, or the token
    /// is cancelled.
    pub async fn run<S, K>(mut self, mut sessions: Sessions<S>, mut sink: K)
    where
        S: SubscribeSession,
        K: MessageSink,
    {
        let tracer = global::tracer("amqp subscriber");

        loop {
            let mut session = tokio::select! {
                biased;
                _ = self.token.cancelled() => {
                    debug!("subscriber cancelled");
                    return;
                }
                next = sessions.next_session() => match next {
                    Some(session) => session,
                    None => {
                        debug!("session sequence closed, stopping subscriber");
                        return;
                    }
                },
            };

            let flow = match self.subscribe(&mut session).await {
                Ok(mut deliveries) => {
                    debug!(queue = self.queue.name(), "subscribed...");
                    self.backoff.reset();
                    self.forward(&mut session, &mut deliveries, &mut sink, &tracer)
                        .await
                }
                Err(err) => {
                    error!(
                        error = err.to_string(),
                        queue = self.queue.name(),
                        "cannot subscribe, abandoning session"
                    );
                    Flow::BackOff
                }
            };

            session.close().await;

            match flow {
                Flow::Resubscribe => {}
                Flow::Stop => return,
                Flow::BackOff => {
                    let delay = self.backoff.next_delay();
                    debug!(delay_ms = delay.as_millis() as u64, "waiting before resubscribing");

                    tokio::select! {
                        biased;
                        _ = self.token.cancelled() => {
                            debug!("subscriber cancelled");
                            return;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn subscribe<S>(&self, session: &mut S) -> Result<DeliveryStream, AmqpError>
    where
        S: SubscribeSession,
    {
        session.declare_queue(&self.queue).await?;

        let binding = QueueBinding::new(self.queue.name())
            .exchange(&self.exchange)
            .routing_key(&self.routing_key);
        session.bind_queue(&binding).await?;

        session.consume(self.queue.name()).await
    }

    async fn forward<S, K>(
        &self,
        session: &mut S,
        deliveries: &mut DeliveryStream,
        sink: &mut K,
        tracer: &BoxedTracer,
    ) -> Flow
    where
        S: SubscribeSession,
        K: MessageSink,
    {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.token.cancelled() => {
                    debug!("subscriber cancelled");
                    return Flow::Stop;
                }
                next = deliveries.next() => next,
            };

            let delivery: Delivery = match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(err)) => {
                    warn!(error = err.to_string(), "delivery feed failed, resubscribing");
                    return Flow::Resubscribe;
                }
                None => {
                    warn!("delivery feed closed, resubscribing");
                    return Flow::Resubscribe;
                }
            };

            let (_ctx, mut span) = otel::new_span(&delivery.headers, tracer, &delivery.routing_key);
            let tag = delivery.delivery_tag;

            if let Err(err) = sink.deliver(delivery.body).await {
                debug!(error = err.to_string(), "application stopped listening");
                span.set_status(Status::Error {
                    description: Cow::from("downstream closed"),
                });
                return Flow::Stop;
            }

            if let Err(err) = session.ack(tag).await {
                error!(error = err.to_string(), delivery_tag = tag, "error whiling ack msg");
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from("error to ack msg"),
                });
                return Flow::Resubscribe;
            }

            span.set_status(Status::Ok);
        }
    }
}
