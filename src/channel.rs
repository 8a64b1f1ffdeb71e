// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Sessions
//!
//! The lapin-backed transport session and its factory.
//!
//! [`AmqpSessionFactory::create`] dials the broker, opens a channel and
//! declares the shared exchange. Any failure along the way is returned as is:
//! the factory never retries, the redial loop does.

use crate::{
    config::PubSubConfig,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    message::{Confirmation, Delivery, OutboundMessage},
    otel,
    queue::{QueueBinding, QueueDefinition},
    session::{DeliveryStream, PublishSession, SessionFactory, SubscribeSession},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, ConfirmSelectOptions},
    publisher_confirm::{Confirmation as LapinConfirmation, PublisherConfirm},
    types::{FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Reply code sent when a session is closed on purpose.
const REPLY_SUCCESS: u16 = 200;

/// Creates AMQP sessions bound to one broker and one exchange.
#[derive(Debug, Clone)]
pub struct AmqpSessionFactory {
    uri: String,
    connection_name: String,
    exchange: ExchangeDefinition,
}

impl AmqpSessionFactory {
    pub fn new(cfg: &PubSubConfig) -> Self {
        AmqpSessionFactory {
            uri: cfg.url.clone(),
            connection_name: cfg.connection_name.clone(),
            exchange: ExchangeDefinition::from(&cfg.exchange),
        }
    }
}

#[async_trait]
impl SessionFactory for AmqpSessionFactory {
    type Session = AmqpSession;

    async fn create(&self) -> Result<AmqpSession, AmqpError> {
        let (connection, channel) = new_amqp_channel(&self.uri, &self.connection_name).await?;

        debug!("creating exchange: {}", self.exchange.name());
        if let Err(err) = channel
            .exchange_declare(
                self.exchange.name(),
                self.exchange.kind.into(),
                self.exchange.declare_options(),
                self.exchange.arguments(),
            )
            .await
        {
            error!(
                error = err.to_string(),
                name = self.exchange.name(),
                "error to declare the exchange"
            );
            close_connection(&connection).await;
            return Err(AmqpError::DeclareExchangeError(
                self.exchange.name().to_owned(),
            ));
        }
        debug!("exchange: {} was created", self.exchange.name());

        Ok(AmqpSession::new(connection, channel))
    }

    async fn discard(&self, mut session: AmqpSession) {
        debug!("closing unused session");
        session.shutdown().await;
    }
}

/// Connects to the broker and opens a channel on the new connection.
pub async fn new_amqp_channel(
    uri: &str,
    connection_name: &str,
) -> Result<(Connection, Channel), AmqpError> {
    debug!("creating amqp connection...");
    let options = ConnectionProperties::default()
        .with_connection_name(LongString::from(connection_name.to_owned()));

    let conn = match Connection::connect(uri, options).await {
        Ok(c) => Ok(c),
        Err(err) => {
            error!(error = err.to_string(), "failure to connect");
            Err(AmqpError::ConnectionError)
        }
    }?;
    debug!("amqp connected");

    debug!("creating amqp channel...");
    match conn.create_channel().await {
        Ok(c) => {
            debug!("channel created");
            Ok((conn, c))
        }
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            close_connection(&conn).await;
            Err(AmqpError::ChannelError)
        }
    }
}

async fn close_connection(connection: &Connection) {
    if let Err(err) = connection.close(REPLY_SUCCESS, "bye").await {
        debug!(error = err.to_string(), "connection already closed");
    }
}

/// One live connection plus channel.
pub struct AmqpSession {
    connection: Connection,
    channel: Channel,
    confirm_mode: bool,
    next_tag: u64,
    confirms: VecDeque<(u64, PublisherConfirm)>,
    closed: bool,
}

impl AmqpSession {
    fn new(connection: Connection, channel: Channel) -> Self {
        AmqpSession {
            connection,
            channel,
            confirm_mode: false,
            next_tag: 1,
            confirms: VecDeque::new(),
            closed: false,
        }
    }

    async fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.confirms.clear();
        close_connection(&self.connection).await;
    }
}

#[async_trait]
impl PublishSession for AmqpSession {
    async fn enable_confirms(&mut self) -> Result<(), AmqpError> {
        match self
            .channel
            .confirm_select(ConfirmSelectOptions { nowait: false })
            .await
        {
            Ok(()) => {
                self.confirm_mode = true;
                Ok(())
            }
            Err(err) => {
                warn!(error = err.to_string(), "failure to enable publisher confirms");
                Err(AmqpError::ConfirmsNotSupported)
            }
        }
    }

    async fn publish(
        &mut self,
        exchange: &str,
        message: &OutboundMessage,
    ) -> Result<(), AmqpError> {
        let mut headers = BTreeMap::new();
        otel::inject_current(&mut headers);

        let confirm = match self
            .channel
            .basic_publish(
                exchange,
                message.routing_key(),
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                message.body(),
                BasicProperties::default()
                    .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
                    .with_headers(FieldTable::from(headers)),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError)
            }
            Ok(confirm) => Ok(confirm),
        }?;

        let tag = self.next_tag;
        self.next_tag += 1;
        if self.confirm_mode {
            self.confirms.push_back((tag, confirm));
        }

        Ok(())
    }

    async fn next_confirm(&mut self) -> Option<Confirmation> {
        let (tag, confirm) = self.confirms.pop_front()?;

        match confirm.await {
            Ok(LapinConfirmation::Ack(_)) => Some(Confirmation::ack(tag)),
            Ok(LapinConfirmation::Nack(_)) => Some(Confirmation::nack(tag)),
            Ok(LapinConfirmation::NotRequested) => None,
            Err(err) => {
                error!(error = err.to_string(), delivery_tag = tag, "confirm lost");
                None
            }
        }
    }

    async fn close(&mut self) {
        self.shutdown().await;
    }
}

#[async_trait]
impl SubscribeSession for AmqpSession {
    async fn declare_queue(&mut self, queue: &QueueDefinition) -> Result<(), AmqpError> {
        debug!("creating queue: {}", queue.name());

        match self
            .channel
            .queue_declare(queue.name(), queue.declare_options(), FieldTable::default())
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "cannot declare queue");
                Err(AmqpError::DeclareQueueError(queue.name().to_owned()))
            }
            _ => {
                debug!("queue: {} was created", queue.name());
                Ok(())
            }
        }
    }

    async fn bind_queue(&mut self, binding: &QueueBinding<'_>) -> Result<(), AmqpError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            binding.queue_name, binding.exchange_name, binding.routing_key
        );

        match self
            .channel
            .queue_bind(
                binding.queue_name,
                binding.exchange_name,
                binding.routing_key,
                binding.bind_options(),
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name.to_owned(),
                    binding.queue_name.to_owned(),
                ))
            }
            _ => Ok(()),
        }
    }

    async fn consume(&mut self, queue: &str) -> Result<DeliveryStream, AmqpError> {
        let consumer = match self
            .channel
            .basic_consume(
                queue,
                &Uuid::new_v4().to_string(),
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: true,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::ConsumerError(queue.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        Ok(consumer
            .map(|result| match result {
                Ok(delivery) => Ok(Delivery {
                    delivery_tag: delivery.delivery_tag,
                    routing_key: delivery.routing_key.to_string(),
                    headers: delivery
                        .properties
                        .headers()
                        .as_ref()
                        .map(|table| table.inner().clone())
                        .unwrap_or_default(),
                    body: delivery.data,
                }),
                Err(err) => {
                    error!(error = err.to_string(), "errors consume msg");
                    Err(AmqpError::ConsumerError(err.to_string()))
                }
            })
            .boxed())
    }

    async fn ack(&mut self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn close(&mut self) {
        self.shutdown().await;
    }
}
