// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Configuration
//!
//! Connection parameters for the RabbitMQ broker. Values can be deserialized from
//! any serde source or read from the process environment.

use serde::Deserialize;
use std::env;

/// RabbitMQ connection settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AmqpConfigs {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
    /// Name reported to the broker in the connection properties
    pub connection_name: String,
}

impl Default for AmqpConfigs {
    fn default() -> Self {
        Self {
            host: "localhost".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: "/".to_owned(),
            connection_name: "rabbitmq-bridge".to_owned(),
        }
    }
}

impl AmqpConfigs {
    /// Builds the configuration from `RABBITMQ_*` environment variables.
    ///
    /// Unset or unparsable variables fall back to the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            host: env::var("RABBITMQ_HOST").unwrap_or(defaults.host),
            port: env::var("RABBITMQ_PORT")
                .ok()
                .and_then(|port| port.parse().ok())
                .unwrap_or(defaults.port),
            user: env::var("RABBITMQ_USER").unwrap_or(defaults.user),
            password: env::var("RABBITMQ_PASSWORD").unwrap_or(defaults.password),
            vhost: env::var("RABBITMQ_VHOST").unwrap_or(defaults.vhost),
            connection_name: env::var("APP_NAME").unwrap_or(defaults.connection_name),
        }
    }

    /// Renders the AMQP URI for these settings.
    pub fn uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.user,
            self.password,
            self.host,
            self.port,
            self.vhost.replace('/', "%2f")
        )
    }
}
