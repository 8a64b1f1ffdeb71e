// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Redial Loop
//!
//! Keeps handing out fresh transport sessions to one consumer loop.
//!
//! Sessions travel through a two-level handshake. The loop offers a
//! [`SessionSlot`] on the outer channel; nothing is dialed until the consumer
//! claims that slot. Only then does the loop call the session factory and
//! resolve the slot with the result. This keeps at most one factory call in
//! flight and never builds a session nobody asked for.
//!
//! Factory failures are retried on the same claimed slot with a bounded
//! exponential [`Backoff`]. Cancellation is observed while offering, while
//! waiting for the claim and while backing off. A factory call already in
//! flight runs to completion. Its session goes back to the factory to be
//! closed if cancellation won the race or the claimant stopped waiting.

use crate::{config::PubSubConfig, session::SessionFactory};
use std::{sync::Arc, time::Duration};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Delay policy between failed session-factory calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Backoff {
            initial,
            max,
            current: initial,
        }
    }

    /// Retry immediately.
    pub fn none() -> Self {
        Backoff::new(Duration::ZERO, Duration::ZERO)
    }

    /// Returns the delay to apply now and doubles the next one, up to `max`.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::from(&PubSubConfig::default())
    }
}

impl From<&PubSubConfig> for Backoff {
    fn from(cfg: &PubSubConfig) -> Self {
        Backoff::new(cfg.reconnect_initial_backoff(), cfg.reconnect_max_backoff())
    }
}

/// A single-use promise of one session.
///
/// Claiming the slot is what triggers the factory call.
pub struct SessionSlot<S> {
    claim: oneshot::Sender<oneshot::Sender<S>>,
}

impl<S> SessionSlot<S> {
    /// Claims the slot and waits for the session behind it.
    ///
    /// Returns `None` once the redial loop has shut down.
    pub async fn session(self) -> Option<S> {
        let (reply, session) = oneshot::channel();
        self.claim.send(reply).ok()?;
        session.await.ok()
    }
}

/// Consumer side of a redial loop.
pub struct Sessions<S> {
    slots: mpsc::Receiver<SessionSlot<S>>,
}

impl<S> Sessions<S> {
    /// Next offered slot, or `None` when the loop is gone.
    pub async fn next_slot(&mut self) -> Option<SessionSlot<S>> {
        self.slots.recv().await
    }

    /// Claims the next slot and waits for its session.
    pub async fn next_session(&mut self) -> Option<S> {
        self.next_slot().await?.session().await
    }
}

/// Starts a redial loop on the current runtime.
///
/// The loop stops when `token` is cancelled or when the returned
/// [`Sessions`] is dropped.
pub fn redial<F>(
    token: CancellationToken,
    factory: Arc<F>,
    backoff: Backoff,
) -> Sessions<F::Session>
where
    F: SessionFactory,
{
    let (slots_tx, slots) = mpsc::channel(1);
    tokio::spawn(run(token, factory, backoff, slots_tx));
    Sessions { slots }
}

async fn run<F>(
    token: CancellationToken,
    factory: Arc<F>,
    mut backoff: Backoff,
    slots: mpsc::Sender<SessionSlot<F::Session>>,
) where
    F: SessionFactory,
{
    loop {
        let (claim, claimed) = oneshot::channel();

        tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!("shutting down session factory");
                return;
            }
            sent = slots.send(SessionSlot { claim }) => {
                if sent.is_err() {
                    debug!("session consumer gone, stopping redial");
                    return;
                }
            }
        }

        let reply = tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!("shutting down session factory");
                return;
            }
            reply = claimed => match reply {
                Ok(reply) => reply,
                // slot dropped unclaimed, offer another one
                Err(_) => continue,
            },
        };

        let session = loop {
            match factory.create().await {
                Ok(session) => {
                    backoff.reset();
                    break session;
                }
                Err(err) => {
                    let delay = backoff.next_delay();
                    warn!(
                        error = err.to_string(),
                        delay_ms = delay.as_millis() as u64,
                        "cannot (re)dial, retrying"
                    );

                    tokio::select! {
                        biased;
                        _ = token.cancelled() => {
                            debug!("shutting down session factory");
                            return;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        };

        if token.is_cancelled() {
            debug!("shutting down new session");
            factory.discard(session).await;
            return;
        }

        if let Err(session) = reply.send(session) {
            debug!("session slot abandoned, closing session");
            factory.discard(session).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        errors::AmqpError,
        testing::{FakeFactory, FakeSession, SharedLog},
    };
    use tokio::sync::Notify;

    fn session() -> Result<FakeSession, AmqpError> {
        Ok(FakeSession::publisher(SharedLog::default()))
    }

    #[test]
    fn backoff_doubles_up_to_max() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(350));
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(350));
        assert_eq!(backoff.next_delay(), Duration::from_millis(350));

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn sessions_are_created_only_when_claimed() {
        let factory = Arc::new(FakeFactory::new(vec![session(), session()]));
        let token = CancellationToken::new();
        let mut sessions = redial(token.clone(), factory.clone(), Backoff::none());

        let slot = sessions.next_slot().await.unwrap();
        tokio::task::yield_now().await;
        assert_eq!(factory.created(), 0);

        assert!(slot.session().await.is_some());
        assert_eq!(factory.created(), 1);

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(factory.created(), 1);

        token.cancel();
    }

    #[tokio::test]
    async fn cancellation_while_offering_stops_the_loop() {
        let factory = Arc::new(FakeFactory::new(vec![session()]));
        let token = CancellationToken::new();
        let mut sessions = redial(token.clone(), factory.clone(), Backoff::none());

        tokio::task::yield_now().await;
        token.cancel();

        assert!(sessions.next_session().await.is_none());
        assert!(sessions.next_slot().await.is_none());
        assert_eq!(factory.created(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn factory_failures_are_retried_on_the_same_slot() {
        let factory = Arc::new(FakeFactory::new(vec![
            Err(AmqpError::ConnectionError),
            Err(AmqpError::DeclareExchangeError("pubsub".to_owned())),
            session(),
        ]));
        let token = CancellationToken::new();
        let backoff = Backoff::new(Duration::from_millis(10), Duration::from_millis(40));
        let mut sessions = redial(token.clone(), factory.clone(), backoff);

        assert!(sessions.next_session().await.is_some());
        assert_eq!(factory.created(), 3);

        token.cancel();
    }

    #[tokio::test]
    async fn in_flight_session_is_discarded_after_cancellation() {
        let gate = Arc::new(Notify::new());
        let factory = Arc::new(FakeFactory::gated(vec![session()], gate.clone()));
        let token = CancellationToken::new();
        let mut sessions = redial(token.clone(), factory.clone(), Backoff::none());

        let waiting = tokio::spawn(async move { sessions.next_session().await });
        while factory.created() == 0 {
            tokio::task::yield_now().await;
        }

        token.cancel();
        gate.notify_one();

        assert!(waiting.await.unwrap().is_none());
        assert_eq!(factory.created(), 1);

        // the loop closes the session before it exits
        while factory.discarded() == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(factory.discarded(), 1);
    }

    #[tokio::test]
    async fn session_of_an_abandoned_slot_is_closed() {
        let gate = Arc::new(Notify::new());
        let factory = Arc::new(FakeFactory::gated(vec![session(), session()], gate.clone()));
        let token = CancellationToken::new();
        let mut sessions = redial(token.clone(), factory.clone(), Backoff::none());

        let slot = sessions.next_slot().await.unwrap();
        let waiting = tokio::spawn(slot.session());
        while factory.created() == 0 {
            tokio::task::yield_now().await;
        }

        waiting.abort();
        let _ = waiting.await;
        gate.notify_one();

        while factory.discarded() == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(factory.discarded(), 1);
        assert!(!token.is_cancelled());

        token.cancel();
    }
}
