// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Scripted broker doubles shared by the unit tests.

use crate::{
    errors::AmqpError,
    message::{Confirmation, Delivery, OutboundMessage},
    queue::{QueueBinding, QueueDefinition},
    session::{DeliveryStream, PublishSession, SessionFactory, SubscribeSession},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};
use tokio::sync::Notify;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Event {
    HandedOff(u64),
    Acked(u64),
}

/// What the fake broker saw, shared by every session of a test.
#[derive(Debug, Default)]
pub(crate) struct BrokerLog {
    pub published: Vec<OutboundMessage>,
    pub max_in_flight: usize,
    pub closed: usize,
    pub declared: Vec<QueueDefinition>,
    pub bindings: Vec<(String, String, String)>,
    pub events: Vec<Event>,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct SharedLog(Arc<Mutex<BrokerLog>>);

impl SharedLog {
    pub fn with<R>(&self, f: impl FnOnce(&mut BrokerLog) -> R) -> R {
        let mut log = self.0.lock().unwrap();
        f(&mut log)
    }

    pub fn published_bodies(&self) -> Vec<Vec<u8>> {
        self.with(|log| log.published.iter().map(|m| m.body().to_vec()).collect())
    }

    pub fn events(&self) -> Vec<Event> {
        self.with(|log| log.events.clone())
    }

    pub fn closed(&self) -> usize {
        self.with(|log| log.closed)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) enum PublishBehavior {
    #[default]
    Confirm,
    FailPublish,
    Nack,
    NoConfirms,
    ConfirmFeedClosed,
    Hang,
}

pub(crate) struct FakeSession {
    log: SharedLog,
    behavior: PublishBehavior,
    confirms: VecDeque<Confirmation>,
    next_tag: u64,
    deliveries: Vec<Delivery>,
    hold_feed: bool,
    setup_failure: Option<AmqpError>,
}

impl FakeSession {
    pub fn publisher(log: SharedLog) -> Self {
        FakeSession::publishing(log, PublishBehavior::Confirm)
    }

    pub fn publishing(log: SharedLog, behavior: PublishBehavior) -> Self {
        FakeSession {
            log,
            behavior,
            confirms: VecDeque::new(),
            next_tag: 1,
            deliveries: vec![],
            hold_feed: false,
            setup_failure: None,
        }
    }

    pub fn subscriber(log: SharedLog, deliveries: Vec<Delivery>) -> Self {
        FakeSession {
            deliveries,
            ..FakeSession::publisher(log)
        }
    }

    /// Subscribes fine and then waits for deliveries that never come.
    pub fn listening(log: SharedLog) -> Self {
        FakeSession {
            hold_feed: true,
            ..FakeSession::publisher(log)
        }
    }

    pub fn failing_setup(log: SharedLog, err: AmqpError) -> Self {
        FakeSession {
            setup_failure: Some(err),
            ..FakeSession::publisher(log)
        }
    }
}

#[async_trait]
impl PublishSession for FakeSession {
    async fn enable_confirms(&mut self) -> Result<(), AmqpError> {
        match self.behavior {
            PublishBehavior::NoConfirms => Err(AmqpError::ConfirmsNotSupported),
            _ => Ok(()),
        }
    }

    async fn publish(
        &mut self,
        _exchange: &str,
        message: &OutboundMessage,
    ) -> Result<(), AmqpError> {
        match self.behavior {
            PublishBehavior::FailPublish => return Err(AmqpError::PublishingError),
            PublishBehavior::Hang => std::future::pending::<()>().await,
            _ => {}
        }

        let in_flight = self.confirms.len() + 1;
        self.log.with(|log| {
            log.published.push(message.clone());
            log.max_in_flight = log.max_in_flight.max(in_flight);
        });

        let tag = self.next_tag;
        self.next_tag += 1;
        match self.behavior {
            PublishBehavior::Nack => self.confirms.push_back(Confirmation::nack(tag)),
            _ => self.confirms.push_back(Confirmation::ack(tag)),
        }
        Ok(())
    }

    async fn next_confirm(&mut self) -> Option<Confirmation> {
        if self.behavior == PublishBehavior::ConfirmFeedClosed {
            return None;
        }
        self.confirms.pop_front()
    }

    async fn close(&mut self) {
        self.log.with(|log| log.closed += 1);
    }
}

#[async_trait]
impl SubscribeSession for FakeSession {
    async fn declare_queue(&mut self, queue: &QueueDefinition) -> Result<(), AmqpError> {
        if let Some(err) = self.setup_failure.clone() {
            return Err(err);
        }
        self.log.with(|log| log.declared.push(queue.clone()));
        Ok(())
    }

    async fn bind_queue(&mut self, binding: &QueueBinding<'_>) -> Result<(), AmqpError> {
        self.log.with(|log| {
            log.bindings.push((
                binding.queue_name.to_owned(),
                binding.exchange_name.to_owned(),
                binding.routing_key.to_owned(),
            ))
        });
        Ok(())
    }

    async fn consume(&mut self, _queue: &str) -> Result<DeliveryStream, AmqpError> {
        let deliveries = std::mem::take(&mut self.deliveries);
        let feed = futures_util::stream::iter(deliveries.into_iter().map(Ok));
        if self.hold_feed {
            Ok(feed.chain(futures_util::stream::pending()).boxed())
        } else {
            Ok(feed.boxed())
        }
    }

    async fn ack(&mut self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.log.with(|log| log.events.push(Event::Acked(delivery_tag)));
        Ok(())
    }

    async fn close(&mut self) {
        self.log.with(|log| log.closed += 1);
    }
}

/// Hands out scripted results, one per `create` call, then blocks forever.
pub(crate) struct FakeFactory<S> {
    created: AtomicUsize,
    discarded: AtomicUsize,
    script: Mutex<VecDeque<Result<S, AmqpError>>>,
    gate: Option<Arc<Notify>>,
}

impl<S> FakeFactory<S> {
    pub fn new(script: Vec<Result<S, AmqpError>>) -> Self {
        FakeFactory {
            created: AtomicUsize::new(0),
            discarded: AtomicUsize::new(0),
            script: Mutex::new(script.into()),
            gate: None,
        }
    }

    /// Every `create` call waits on `gate` before answering.
    pub fn gated(script: Vec<Result<S, AmqpError>>, gate: Arc<Notify>) -> Self {
        FakeFactory {
            gate: Some(gate),
            ..FakeFactory::new(script)
        }
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Sessions handed back through `discard`.
    pub fn discarded(&self) -> usize {
        self.discarded.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<S: Send + 'static> SessionFactory for FakeFactory<S> {
    type Session = S;

    async fn create(&self) -> Result<S, AmqpError> {
        self.created.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }

        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(result) => result,
            None => std::future::pending().await,
        }
    }

    async fn discard(&self, session: S) {
        self.discarded.fetch_add(1, Ordering::SeqCst);
        drop(session);
    }
}
