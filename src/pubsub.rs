// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Pub/Sub Facade
//!
//! Wires the loops together for an application: one redial loop and one
//! publisher task behind [`PubSub::publish`], plus one redial loop and one
//! subscriber task per [`PubSub::subscribe`] call. Publisher and subscribers
//! never share a session.
//!
//! Every subscriber consumes from its own exclusive queue. The first one in
//! the process uses the process identity as queue name, later ones append a
//! sequence number to it. Dropping a [`PubSub`] cancels all of its tasks.
//!
//! ```no_run
//! use rabbitmq_pubsub::{config::PubSubConfig, message::OutboundMessage, pubsub::PubSub};
//!
//! # async fn run() -> Result<(), rabbitmq_pubsub::errors::AmqpError> {
//! let mut pubsub = PubSub::connect(PubSubConfig::from_env()?)?;
//! let mut inbox = pubsub.subscribe()?;
//!
//! pubsub.publish(OutboundMessage::new("greetings", "hello"));
//! let body = inbox.recv().await;
//!
//! pubsub.close().await;
//! # Ok(())
//! # }
//! ```

use crate::{
    channel::AmqpSessionFactory,
    config::PubSubConfig,
    errors::AmqpError,
    identity::identity,
    message::{OutboundMessage, PublishOutcome},
    publisher::PublisherLoop,
    queue::QueueDefinition,
    redial::{redial, Backoff},
    session::{PublishSession, SessionFactory, SubscribeSession},
    subscriber::SubscriberLoop,
};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, warn};

/// Subscriber queues named by this process so far.
static SUBSCRIBER_QUEUES: AtomicUsize = AtomicUsize::new(0);

/// Name of the next subscriber queue of this process.
///
/// An exclusive queue belongs to the one connection that declared it, so two
/// subscribers can never share a name.
fn next_queue_name() -> String {
    match SUBSCRIBER_QUEUES.fetch_add(1, Ordering::Relaxed) {
        0 => identity(),
        n => format!("{}.{n}", identity()),
    }
}

pub struct PubSub<F: SessionFactory> {
    config: PubSubConfig,
    factory: Arc<F>,
    token: CancellationToken,
    outbound: mpsc::Sender<OutboundMessage>,
    publisher: JoinHandle<()>,
    subscribers: Vec<JoinHandle<()>>,
    _cancel_on_drop: DropGuard,
}

impl PubSub<AmqpSessionFactory> {
    /// Starts a publisher against the broker described by `config`.
    ///
    /// Must be called from within a tokio runtime. Connecting happens lazily
    /// in the background; this never fails on an unreachable broker.
    pub fn connect(config: PubSubConfig) -> Result<Self, AmqpError> {
        config.validate()?;
        let factory = Arc::new(AmqpSessionFactory::new(&config));
        PubSub::start(config, factory, None)
    }
}

impl<F> PubSub<F>
where
    F: SessionFactory,
    F::Session: PublishSession,
{
    /// Starts a publisher on sessions produced by `factory`.
    ///
    /// When `outcomes` is given, every confirmed or nacked message is
    /// reported there.
    pub fn start(
        config: PubSubConfig,
        factory: Arc<F>,
        outcomes: Option<mpsc::UnboundedSender<PublishOutcome>>,
    ) -> Result<Self, AmqpError> {
        config.validate()?;

        let token = CancellationToken::new();
        let (outbound, outbound_rx) = mpsc::channel(config.outbound_capacity);

        let sessions = redial(token.clone(), factory.clone(), Backoff::from(&config));
        let mut publisher = PublisherLoop::new(&config, token.clone());
        if let Some(outcomes) = outcomes {
            publisher = publisher.with_outcomes(outcomes);
        }
        let publisher = tokio::spawn(publisher.run(outbound_rx, sessions));

        Ok(PubSub {
            config,
            factory,
            _cancel_on_drop: token.clone().drop_guard(),
            token,
            outbound,
            publisher,
            subscribers: vec![],
        })
    }

    /// Enqueues a message without waiting.
    ///
    /// When the outbound channel is full the send is handed to a background
    /// task, so messages enqueued under pressure may overtake each other.
    pub fn publish(&self, message: OutboundMessage) {
        match self.outbound.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(message)) => {
                let outbound = self.outbound.clone();
                tokio::spawn(async move {
                    if outbound.send(message).await.is_err() {
                        warn!("publisher stopped, message dropped");
                    }
                });
            }
            Err(TrySendError::Closed(_)) => warn!("publisher stopped, message dropped"),
        }
    }

    /// Stops accepting messages, waits until everything enqueued so far was
    /// resolved, then stops every task.
    pub async fn close(self) {
        let PubSub {
            token,
            outbound,
            publisher,
            subscribers,
            ..
        } = self;

        drop(outbound);
        if let Err(err) = publisher.await {
            warn!(error = err.to_string(), "publisher task failed");
        }

        token.cancel();
        for subscriber in subscribers {
            let _ = subscriber.await;
        }
        debug!("pubsub closed");
    }

    /// Cancels every task without draining pending messages.
    pub async fn shutdown(self) {
        self.token.cancel();
        let _ = self.publisher.await;
        for subscriber in self.subscribers {
            let _ = subscriber.await;
        }
        debug!("pubsub shut down");
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl<F> PubSub<F>
where
    F: SessionFactory,
    F::Session: PublishSession + SubscribeSession,
{
    /// Starts a subscriber on its own sessions and returns the payloads it
    /// receives.
    pub fn subscribe(&mut self) -> Result<mpsc::Receiver<Vec<u8>>, AmqpError> {
        if self.token.is_cancelled() {
            return Err(AmqpError::Closed);
        }

        let (deliveries, inbox) = mpsc::channel(self.config.delivery_capacity);
        let sessions = redial(
            self.token.clone(),
            self.factory.clone(),
            Backoff::from(&self.config),
        );
        let subscriber = SubscriberLoop::new(
            QueueDefinition::subscriber(&next_queue_name()),
            &self.config.exchange.name,
            &self.config.routing_key,
            self.token.clone(),
        )
        .with_backoff(Backoff::from(&self.config));
        debug!(queue = subscriber.queue().name(), "starting subscriber");

        self.subscribers
            .push(tokio::spawn(subscriber.run(sessions, deliveries)));
        Ok(inbox)
    }
}
