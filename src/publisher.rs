// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Publisher State Machine
//!
//! Drains the application's outbound channel into whatever session the redial
//! loop currently provides, one message at a time.
//!
//! The publisher alternates between two states:
//! - **reading**: the pending slot is empty and the next message is pulled
//!   from the outbound channel;
//! - **awaiting confirm**: one message sits in the pending slot until the
//!   broker confirms or rejects it.
//!
//! A transport failure (publish error, publish deadline, confirm deadline,
//! confirm feed gone) keeps the message in the pending slot, closes the
//! session and asks for a new one. The pending message is always the next one
//! attempted, so nothing is skipped. A broker nack is final for that message:
//! it is logged, optionally reported, and the publisher moves on.
//!
//! Sessions that refuse confirm mode cannot prove delivery, so they are
//! replaced before anything is published on them.

use crate::{
    config::PubSubConfig,
    errors::AmqpError,
    message::{Confirmation, OutboundMessage, PublishOutcome},
    redial::Sessions,
    session::PublishSession,
};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How a session's run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    /// The outbound channel is closed and nothing is pending.
    Exhausted,
    Cancelled,
    /// The session is unusable; the pending slot may hold a message to replay.
    Failed,
}

pub struct PublisherLoop {
    exchange: String,
    publish_timeout: Duration,
    confirm_timeout: Duration,
    token: CancellationToken,
    outcomes: Option<mpsc::UnboundedSender<PublishOutcome>>,
}

impl PublisherLoop {
    pub fn new(cfg: &PubSubConfig, token: CancellationToken) -> Self {
        PublisherLoop {
            exchange: cfg.exchange.name.clone(),
            publish_timeout: cfg.publish_timeout(),
            confirm_timeout: cfg.confirm_timeout(),
            token,
            outcomes: None,
        }
    }

    /// Reports every confirmed or rejected message on `outcomes`.
    pub fn with_outcomes(mut self, outcomes: mpsc::UnboundedSender<PublishOutcome>) -> Self {
        self.outcomes = Some(outcomes);
        self
    }

    /// Runs until the outbound channel is drained and closed, the session
    /// sequence ends, or the token is cancelled.
    pub async fn run<S>(
        self,
        mut outbound: mpsc::Receiver<OutboundMessage>,
        mut sessions: Sessions<S>,
    ) where
        S: PublishSession,
    {
        let mut pending: Option<OutboundMessage> = None;

        loop {
            let mut session = tokio::select! {
                biased;
                _ = self.token.cancelled() => {
                    debug!("publisher cancelled");
                    return;
                }
                next = sessions.next_session() => match next {
                    Some(session) => session,
                    None => {
                        debug!("session sequence closed, stopping publisher");
                        return;
                    }
                },
            };

            let end = match session.enable_confirms().await {
                Ok(()) => {
                    debug!("publishing...");
                    self.publish_on(&mut session, &mut outbound, &mut pending)
                        .await
                }
                Err(err) => {
                    warn!(
                        error = err.to_string(),
                        "publisher confirms not supported, replacing session"
                    );
                    SessionEnd::Failed
                }
            };

            session.close().await;

            match end {
                SessionEnd::Failed => continue,
                SessionEnd::Exhausted => {
                    debug!("all messages consumed, stopping publisher");
                    return;
                }
                SessionEnd::Cancelled => {
                    debug!("publisher cancelled");
                    return;
                }
            }
        }
    }

    async fn publish_on<S>(
        &self,
        session: &mut S,
        outbound: &mut mpsc::Receiver<OutboundMessage>,
        pending: &mut Option<OutboundMessage>,
    ) -> SessionEnd
    where
        S: PublishSession,
    {
        loop {
            let message = match pending.take() {
                Some(message) => message,
                None => tokio::select! {
                    biased;
                    _ = self.token.cancelled() => return SessionEnd::Cancelled,
                    next = outbound.recv() => match next {
                        Some(message) => message,
                        None => return SessionEnd::Exhausted,
                    },
                },
            };

            let published = tokio::time::timeout(
                self.publish_timeout,
                session.publish(&self.exchange, &message),
            )
            .await
            .unwrap_or(Err(AmqpError::PublishTimeout));
            if let Err(err) = published {
                warn!(
                    error = err.to_string(),
                    routing_key = message.routing_key(),
                    "publish failed, retrying on the next session"
                );
                *pending = Some(message);
                return SessionEnd::Failed;
            }

            let confirmed = tokio::select! {
                biased;
                _ = self.token.cancelled() => return SessionEnd::Cancelled,
                confirmed = tokio::time::timeout(
                    self.confirm_timeout,
                    session.next_confirm(),
                ) => confirmed,
            };
            match confirmed {
                Ok(Some(confirmation)) => self.resolve(message, confirmation),
                Ok(None) => {
                    warn!("confirm feed closed, retrying on the next session");
                    *pending = Some(message);
                    return SessionEnd::Failed;
                }
                Err(_) => {
                    warn!(
                        error = AmqpError::PublishTimeout.to_string(),
                        "confirm deadline exceeded, retrying on the next session"
                    );
                    *pending = Some(message);
                    return SessionEnd::Failed;
                }
            }
        }
    }

    fn resolve(&self, message: OutboundMessage, confirmation: Confirmation) {
        if confirmation.acknowledged {
            debug!(delivery_tag = confirmation.delivery_tag, "message confirmed");
        } else {
            warn!(
                delivery_tag = confirmation.delivery_tag,
                body = %String::from_utf8_lossy(message.body()),
                "nack message"
            );
        }

        if let Some(outcomes) = &self.outcomes {
            let _ = outcomes.send(PublishOutcome {
                message,
                delivery_tag: confirmation.delivery_tag,
                acknowledged: confirmation.acknowledged,
            });
        }
    }
}
