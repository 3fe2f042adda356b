// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Configuration
//!
//! [`AppConfig`] is read from an optional `config/default` file (any format
//! the `config` crate understands) and from environment variables prefixed
//! with `TRACKER_`, nested sections separated by `__`:
//!
//! ```text
//! TRACKER_RABBITMQ__HOST=broker
//! TRACKER_WORKER__CONCURRENCY=8
//! TRACKER_RETRY__INTERVAL_START=500
//! ```
//!
//! Durations are given in milliseconds. Every field has a default.

use crate::{
    exchange::ExchangeDefinition,
    pool::ConnectionPool,
    retry::{millis, RetryPolicy},
    rpc::ReplyCleanupPolicy,
    transport::{amqp::AmqpTransport, Transport},
    worker::WorkerOptions,
};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::{sync::Arc, time::Duration};

pub const ENV_PREFIX: &str = "TRACKER";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub rabbitmq: RabbitMQConfig,
    pub pool: PoolConfig,
    pub retry: RetryPolicy,
    pub worker: WorkerOptions,
    pub rpc: RpcConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AppSection {
    /// Reported to the broker as the connection name.
    pub name: String,
}

impl Default for AppSection {
    fn default() -> Self {
        AppSection {
            name: "tracker-mq".to_owned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RabbitMQConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
    /// Full `amqp://` uri; takes precedence over the other fields.
    pub url: Option<String>,
}

impl Default for RabbitMQConfig {
    fn default() -> Self {
        RabbitMQConfig {
            host: "localhost".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: String::new(),
            url: None,
        }
    }
}

impl RabbitMQConfig {
    pub fn uri(&self) -> String {
        if let Some(url) = self.url.as_ref().filter(|url| !url.is_empty()) {
            return url.clone();
        }

        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.vhost
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum number of connections.
    pub limit: usize,
    #[serde(with = "millis")]
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            limit: 10,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Exchange replies are published to; empty for the default exchange.
    pub reply_exchange: String,
    /// Idle time after which the broker deletes a reply queue.
    #[serde(with = "millis")]
    pub reply_expires: Duration,
    pub cleanup: ReplyCleanupPolicy,
}

impl Default for RpcConfig {
    fn default() -> Self {
        RpcConfig {
            reply_exchange: String::new(),
            reply_expires: Duration::from_secs(600),
            cleanup: ReplyCleanupPolicy::default(),
        }
    }
}

impl RpcConfig {
    pub fn exchange(&self) -> ExchangeDefinition {
        if self.reply_exchange.is_empty() {
            return ExchangeDefinition::default_exchange();
        }
        ExchangeDefinition::new(&self.reply_exchange).direct()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Filter directive used when `RUST_LOG` is not set.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: "info".to_owned(),
            format: LogFormat::Text,
        }
    }
}

impl AppConfig {
    /// Loads `config/default` and the `TRACKER_` environment.
    pub fn load() -> Result<AppConfig, ConfigError> {
        Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::new(AmqpTransport::new(&self.rabbitmq.uri(), &self.app.name))
    }

    /// A pool over `transport` sized and timed by this configuration.
    pub fn pool(&self, transport: Arc<dyn Transport>) -> ConnectionPool {
        ConnectionPool::new(
            transport,
            self.retry.clone(),
            self.pool.limit,
            self.pool.acquire_timeout,
        )
    }
}
