// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Transports
//!
//! The traits in this module are the only place the rest of the crate talks
//! to a broker. [`amqp`] implements them over `lapin`; [`memory`] is an
//! in-process broker with the same routing and acknowledgement semantics.
//!
//! A [`Transport`] opens [`TransportConnection`]s, which open
//! [`TransportChannel`]s and drain deliveries for every consumer registered
//! on any of their channels.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    message::{Delivery, OutboundMessage},
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use std::{sync::Arc, time::Duration};

pub mod amqp;
pub mod memory;

/// Factory for broker connections.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Endpoint address, without credentials.
    fn endpoint(&self) -> String;

    async fn connect(&self) -> Result<Arc<dyn TransportConnection>, AmqpError>;
}

/// An open broker connection.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TransportConnection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn TransportChannel>, AmqpError>;

    /// Waits for the next delivery on any consumer of this connection.
    ///
    /// Returns [`AmqpError::Timeout`] when `timeout` elapses first and
    /// [`AmqpError::ConnectionClosed`] once the connection is gone.
    async fn drain_events(&self, timeout: Option<Duration>) -> Result<Delivery, AmqpError>;

    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// A channel on an open connection.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TransportChannel: Send + Sync {
    async fn exchange_declare(&self, exchange: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn queue_declare(&self, queue: &QueueDefinition) -> Result<(), AmqpError>;

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError>;

    /// Publishes and waits for the broker to confirm receipt.
    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &OutboundMessage,
    ) -> Result<(), AmqpError>;

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
    ) -> Result<(), AmqpError>;

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    /// Reply queue semantics: called once a transient reply queue has
    /// delivered its replies so the transport can drop it.
    async fn after_reply_message_received(&self, queue: &str) -> Result<(), AmqpError>;

    fn is_open(&self) -> bool;
}
