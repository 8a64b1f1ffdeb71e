// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Definitions
//!
//! The publisher and the subscriber meet on a single exchange. This module
//! describes that exchange: its routing kind and the flags used when the
//! session factory declares it on every new session.

use crate::config::ExchangeConfig;
use lapin::{options::ExchangeDeclareOptions, types::FieldTable};
use serde::Deserialize;
use std::fmt;

/// Represents the types of exchanges available in RabbitMQ.
///
/// Each exchange type has specific routing behavior:
/// - Direct: Routes messages to queues based on an exact match of routing keys
/// - Fanout: Broadcasts messages to all bound queues regardless of routing keys
/// - Topic: Routes messages based on wildcard pattern matching of routing keys
/// - Headers: Routes based on message header values instead of routing keys
///
/// Names are matched case-insensitively, from code and from configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum ExchangeKind {
    Direct,
    #[default]
    Fanout,
    Topic,
    Headers,
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> lapin::ExchangeKind {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        }
    }
}

impl std::str::FromStr for ExchangeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "direct" => Ok(ExchangeKind::Direct),
            "fanout" => Ok(ExchangeKind::Fanout),
            "topic" => Ok(ExchangeKind::Topic),
            "headers" => Ok(ExchangeKind::Headers),
            other => Err(format!("unknown exchange kind `{other}`")),
        }
    }
}

impl TryFrom<String> for ExchangeKind {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Headers => "headers",
        };
        f.write_str(name)
    }
}

/// Definition of a RabbitMQ exchange with its configuration parameters.
///
/// Built either with the builder methods or straight from an
/// [`ExchangeConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) kind: ExchangeKind,
    pub(crate) delete: bool,
    pub(crate) durable: bool,
}

impl ExchangeDefinition {
    /// Creates a new exchange definition with the given name.
    ///
    /// By default, the exchange is a non-durable fanout exchange.
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            kind: ExchangeKind::Fanout,
            delete: false,
            durable: false,
        }
    }

    /// Sets the exchange type.
    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    /// Sets the exchange to auto-delete when no longer used.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Makes the exchange durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn declare_options(&self) -> ExchangeDeclareOptions {
        ExchangeDeclareOptions {
            passive: false,
            durable: self.durable,
            auto_delete: self.delete,
            internal: false,
            nowait: false,
        }
    }

    pub(crate) fn arguments(&self) -> FieldTable {
        FieldTable::default()
    }
}

impl From<&ExchangeConfig> for ExchangeDefinition {
    fn from(cfg: &ExchangeConfig) -> Self {
        let mut def = ExchangeDefinition::new(&cfg.name).kind(cfg.kind);
        if cfg.durable {
            def = def.durable();
        }
        if cfg.auto_delete {
            def = def.delete();
        }
        def
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn definition_from_config_carries_flags() {
        let cfg = ExchangeConfig {
            name: "events".to_owned(),
            kind: ExchangeKind::Topic,
            durable: true,
            auto_delete: true,
        };

        let def = ExchangeDefinition::from(&cfg);
        assert_eq!(def.name(), "events");
        assert_eq!(def.kind, ExchangeKind::Topic);

        let opts = def.declare_options();
        assert!(opts.durable);
        assert!(opts.auto_delete);
        assert!(!opts.passive);
        assert!(!opts.internal);
    }

    #[test]
    fn kind_parses_case_insensitively() {
        assert_eq!("FANOUT".parse::<ExchangeKind>(), Ok(ExchangeKind::Fanout));
        assert_eq!("direct".parse::<ExchangeKind>(), Ok(ExchangeKind::Direct));
        assert!("x-delayed-message".parse::<ExchangeKind>().is_err());
    }

    #[test]
    fn kind_maps_to_lapin() {
        assert_eq!(
            lapin::ExchangeKind::from(ExchangeKind::Fanout),
            lapin::ExchangeKind::Fanout
        );
        assert_eq!(
            lapin::ExchangeKind::from(ExchangeKind::Headers),
            lapin::ExchangeKind::Headers
        );
    }
}
