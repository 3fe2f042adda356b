// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! Types for defining queues and their bindings. Queues may carry a Dead
//! Letter Queue (DLQ) that receives rejected messages, which is how
//! permanently failed tasks are kept visible to operators.

use crate::exchange::ExchangeDefinition;
use uuid::Uuid;

/// Definition of a queue with its configuration parameters.
///
/// A queue may be bound to an exchange with a routing key; declaring the
/// queue then also declares the exchange and the binding.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) passive: bool,
    pub(crate) no_wait: bool,
    pub(crate) ttl: Option<i32>,
    pub(crate) max_length: Option<i32>,
    pub(crate) max_length_bytes: Option<i32>,
    pub(crate) expires: Option<i32>,
    pub(crate) dlq_name: Option<String>,
    pub(crate) exchange: Option<ExchangeDefinition>,
    pub(crate) routing_key: Option<String>,
}

impl QueueDefinition {
    /// Creates a new queue definition with the given name.
    ///
    /// By default, the queue is created with standard settings (non-durable,
    /// non-exclusive, not bound).
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            ..QueueDefinition::default()
        }
    }

    /// A broadcast queue: a uniquely named auto-delete queue bound to a fanout
    /// exchange, so every consumer gets its own copy of each message.
    pub fn broadcast(exchange: &str) -> QueueDefinition {
        let exchange = ExchangeDefinition::new(exchange).fanout();
        QueueDefinition::new(&format!("bcast.{}", Uuid::new_v4()))
            .delete()
            .bind(&exchange, "")
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the queue to auto-delete when its last consumer goes away.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Makes the queue exclusive to the connection.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    pub fn no_wait(mut self) -> Self {
        self.no_wait = true;
        self
    }

    /// Sets the message Time-To-Live (TTL) in milliseconds.
    pub fn ttl(mut self, ttl: i32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Sets the maximum number of messages the queue can hold.
    pub fn max_length(mut self, max: i32) -> Self {
        self.max_length = Some(max);
        self
    }

    /// Sets the maximum size in bytes the queue can hold.
    pub fn max_length_bytes(mut self, max_bytes: i32) -> Self {
        self.max_length_bytes = Some(max_bytes);
        self
    }

    /// Deletes the queue after it has been unused for `expires` milliseconds.
    pub fn expires(mut self, expires: i32) -> Self {
        self.expires = Some(expires);
        self
    }

    /// Adds a Dead Letter Queue named `<name>-dlq`.
    ///
    /// Messages rejected without requeue are routed there instead of being
    /// dropped.
    pub fn with_dlq(mut self) -> Self {
        self.dlq_name = Some(format!("{}-dlq", self.name));
        self
    }

    /// Binds the queue to an exchange with the given routing key.
    pub fn bind(mut self, exchange: &ExchangeDefinition, routing_key: &str) -> Self {
        self.exchange = Some(exchange.clone());
        self.routing_key = Some(routing_key.to_owned());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_auto_delete(&self) -> bool {
        self.delete
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn dlq_name(&self) -> Option<&str> {
        self.dlq_name.as_deref()
    }

    pub fn exchange(&self) -> Option<&ExchangeDefinition> {
        self.exchange.as_ref()
    }

    /// The binding created by [`QueueDefinition::bind`], if any.
    pub fn binding(&self) -> Option<QueueBinding> {
        let exchange = self.exchange.as_ref()?;
        if exchange.is_default() {
            return None;
        }
        Some(
            QueueBinding::new(&self.name)
                .exchange(exchange.name())
                .routing_key(self.routing_key.as_deref().unwrap_or_default()),
        )
    }

    /// The dead letter queue as a standalone definition.
    pub fn dlq_definition(&self) -> Option<QueueDefinition> {
        let name = self.dlq_name.as_ref()?;
        let mut dlq = QueueDefinition::new(name);
        dlq.durable = self.durable;
        Some(dlq)
    }

    /// Exchange and routing key a producer uses to reach this queue.
    pub fn publish_target(&self) -> (&str, &str) {
        match (&self.exchange, &self.routing_key) {
            (Some(exchange), Some(key)) if !exchange.is_default() => (exchange.name(), key),
            _ => ("", &self.name),
        }
    }
}

/// Configuration for binding a queue to an exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
}

impl QueueBinding {
    /// Creates a new queue binding for the given queue.
    ///
    /// The exchange name and routing key default to empty strings.
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            exchange_name: String::new(),
            routing_key: String::new(),
        }
    }

    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange_name
    }

    pub fn key(&self) -> &str {
        &self.routing_key
    }
}
