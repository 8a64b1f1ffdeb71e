// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Pub/Sub Configuration
//!
//! Connection parameters and exchange topology for the session manager.
//! Values come from code, from any serde source, or from `RABBITMQ_*`
//! environment variables layered over the defaults.

use crate::{errors::AmqpError, exchange::ExchangeKind};
use config::{Config, Environment, Map};
use serde::Deserialize;
use std::time::Duration;

const ENV_PREFIX: &str = "RABBITMQ";

pub const DEFAULT_URL: &str = "amqp://localhost:5672/%2f";
pub const DEFAULT_EXCHANGE: &str = "pubsub";
pub const DEFAULT_CONNECTION_NAME: &str = "rabbitmq-pubsub";

/// Exchange shared by the publisher and the subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ExchangeConfig {
    #[serde(default = "default_exchange")]
    pub name: String,

    #[serde(default)]
    pub kind: ExchangeKind,

    #[serde(default)]
    pub durable: bool,

    #[serde(default)]
    pub auto_delete: bool,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        ExchangeConfig {
            name: default_exchange(),
            kind: ExchangeKind::Fanout,
            durable: false,
            auto_delete: false,
        }
    }
}

/// Configuration of a publisher/subscriber pair.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PubSubConfig {
    /// AMQP URI of the broker.
    #[serde(default = "default_url")]
    pub url: String,

    /// Name reported to the broker for every connection.
    #[serde(default = "default_connection_name")]
    pub connection_name: String,

    #[serde(default)]
    pub exchange: ExchangeConfig,

    /// Routing key used when binding the subscriber queue.
    #[serde(default)]
    pub routing_key: String,

    /// Deadline for a single publish call.
    #[serde(default = "default_publish_timeout")]
    pub publish_timeout_ms: u64,

    /// Deadline for the broker confirm of a published message.
    #[serde(default = "default_confirm_timeout")]
    pub confirm_timeout_ms: u64,

    #[serde(default = "default_initial_backoff")]
    pub reconnect_initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff")]
    pub reconnect_max_backoff_ms: u64,

    /// Capacity of the outbound message channel.
    #[serde(default = "default_capacity")]
    pub outbound_capacity: usize,

    /// Capacity of the channel handing deliveries to the application.
    #[serde(default = "default_capacity")]
    pub delivery_capacity: usize,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        PubSubConfig {
            url: default_url(),
            connection_name: default_connection_name(),
            exchange: ExchangeConfig::default(),
            routing_key: String::new(),
            publish_timeout_ms: default_publish_timeout(),
            confirm_timeout_ms: default_confirm_timeout(),
            reconnect_initial_backoff_ms: default_initial_backoff(),
            reconnect_max_backoff_ms: default_max_backoff(),
            outbound_capacity: default_capacity(),
            delivery_capacity: default_capacity(),
        }
    }
}

impl PubSubConfig {
    /// Reads the configuration from `RABBITMQ_*` environment variables,
    /// falling back to the defaults for anything unset.
    ///
    /// Nested exchange fields use a double underscore, e.g.
    /// `RABBITMQ_EXCHANGE__KIND=topic`.
    pub fn from_env() -> Result<Self, AmqpError> {
        Self::load(environment())
    }

    /// Same as [`PubSubConfig::from_env`] over the given variables instead of
    /// the process environment.
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self, AmqpError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars: Map<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self::load(environment().source(Some(vars)))
    }

    fn load(source: Environment) -> Result<Self, AmqpError> {
        let cfg: PubSubConfig = Config::builder()
            .add_source(source)
            .build()
            .and_then(|config| config.try_deserialize())
            .map_err(|err| AmqpError::InvalidConfig(err.to_string()))?;

        cfg.validate()?;
        Ok(cfg)
    }

    /// Rejects values the loops cannot run with.
    pub fn validate(&self) -> Result<(), AmqpError> {
        if self.url.trim().is_empty() {
            return Err(AmqpError::InvalidConfig("url must not be empty".to_owned()));
        }
        if self.exchange.name.trim().is_empty() {
            return Err(AmqpError::InvalidConfig(
                "exchange name must not be empty".to_owned(),
            ));
        }
        if self.publish_timeout_ms == 0 || self.confirm_timeout_ms == 0 {
            return Err(AmqpError::InvalidConfig(
                "publish and confirm timeouts must be positive".to_owned(),
            ));
        }
        if self.outbound_capacity == 0 || self.delivery_capacity == 0 {
            return Err(AmqpError::InvalidConfig(
                "channel capacities must be positive".to_owned(),
            ));
        }
        if self.reconnect_max_backoff_ms < self.reconnect_initial_backoff_ms {
            return Err(AmqpError::InvalidConfig(
                "max reconnect backoff is below the initial backoff".to_owned(),
            ));
        }
        Ok(())
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_millis(self.confirm_timeout_ms)
    }

    pub fn reconnect_initial_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_backoff_ms)
    }

    pub fn reconnect_max_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_backoff_ms)
    }
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
        .ignore_empty(true)
}

fn default_url() -> String {
    DEFAULT_URL.to_owned()
}

fn default_connection_name() -> String {
    DEFAULT_CONNECTION_NAME.to_owned()
}

fn default_exchange() -> String {
    DEFAULT_EXCHANGE.to_owned()
}

fn default_publish_timeout() -> u64 {
    3_000
}

fn default_confirm_timeout() -> u64 {
    5_000
}

fn default_initial_backoff() -> u64 {
    100
}

fn default_max_backoff() -> u64 {
    10_000
}

fn default_capacity() -> usize {
    64
}
