// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Management
//!
//! Idempotent declaration of exchanges, queues and bindings. Every
//! [`Connection`] remembers what it has declared; re-declaring a known
//! entity is skipped unless the entity is auto-delete, since the broker may
//! have removed it in the meantime. Reconnecting forgets everything.
//!
//! The main components are:
//! - [`Entity`]: a declarable exchange, queue or binding
//! - [`maybe_declare`] and [`maybe_declare_with_retry`]: cached declaration
//! - [`Topology`]: a set of entities installed together and replayed after
//!   reconnection

use crate::{
    connection::{Connection, Errback, Revive},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
    transport::TransportChannel,
};
use async_trait::async_trait;
use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
};
use tracing::debug;

/// A declarable topology entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Entity {
    Exchange(ExchangeDefinition),
    Queue(QueueDefinition),
    Binding(QueueBinding),
}

impl Entity {
    pub fn is_auto_delete(&self) -> bool {
        match self {
            Entity::Exchange(exchange) => exchange.is_auto_delete(),
            Entity::Queue(queue) => queue.is_auto_delete(),
            Entity::Binding(_) => false,
        }
    }

    pub fn name(&self) -> String {
        match self {
            Entity::Exchange(exchange) => exchange.name().to_owned(),
            Entity::Queue(queue) => queue.name().to_owned(),
            Entity::Binding(binding) => format!(
                "{}->{}:{}",
                binding.exchange_name(),
                binding.queue_name(),
                binding.key()
            ),
        }
    }

    /// Entities declared together with this one, in declaration order.
    ///
    /// A queue brings its dead letter queue, its exchange and its binding.
    fn components(&self) -> Vec<Entity> {
        let Entity::Queue(queue) = self else {
            return vec![self.clone()];
        };

        let mut components = Vec::with_capacity(4);
        if let Some(dlq) = queue.dlq_definition() {
            components.push(Entity::Queue(dlq));
        }
        if let Some(exchange) = queue.exchange().filter(|e| !e.is_default()) {
            components.push(Entity::Exchange(exchange.clone()));
        }
        components.push(self.clone());
        if let Some(binding) = queue.binding() {
            components.push(Entity::Binding(binding));
        }
        components
    }
}

impl From<ExchangeDefinition> for Entity {
    fn from(def: ExchangeDefinition) -> Self {
        Entity::Exchange(def)
    }
}

impl From<QueueDefinition> for Entity {
    fn from(def: QueueDefinition) -> Self {
        Entity::Queue(def)
    }
}

impl From<QueueBinding> for Entity {
    fn from(binding: QueueBinding) -> Self {
        Entity::Binding(binding)
    }
}

/// Entities already declared on one connection.
#[derive(Debug, Default)]
pub struct DeclaredEntities(Mutex<HashSet<Entity>>);

impl DeclaredEntities {
    pub fn contains(&self, entity: &Entity) -> bool {
        self.0
            .lock()
            .map(|declared| declared.contains(entity))
            .unwrap_or(false)
    }

    pub fn insert(&self, entity: Entity) {
        if let Ok(mut declared) = self.0.lock() {
            declared.insert(entity);
        }
    }

    pub fn clear(&self) {
        if let Ok(mut declared) = self.0.lock() {
            declared.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.0.lock().map(|declared| declared.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Declares `entity` on the connection's default channel unless it is
/// already known there.
///
/// Returns whether a declaration was sent.
pub async fn maybe_declare(entity: &Entity, connection: &Connection) -> Result<bool, AmqpError> {
    let channel = connection.default_channel().await?;
    maybe_declare_on(entity, &channel, connection.declared()).await
}

/// Same as [`maybe_declare`] for an explicit channel and declaration cache.
pub async fn maybe_declare_on(
    entity: &Entity,
    channel: &Arc<dyn TransportChannel>,
    declared: &DeclaredEntities,
) -> Result<bool, AmqpError> {
    if !channel.is_open() {
        return Err(AmqpError::ChannelError("channel disconnected".to_owned()));
    }
    if let Entity::Exchange(exchange) = entity {
        if exchange.is_default() {
            return Ok(false);
        }
    }
    if !entity.is_auto_delete() && declared.contains(entity) {
        return Ok(false);
    }

    for component in entity.components() {
        let cached = component != *entity
            && declared.contains(&component)
            && !component.is_auto_delete()
            && !(entity.is_auto_delete() && matches!(component, Entity::Binding(_)));
        if cached {
            continue;
        }

        declare(&component, channel.as_ref()).await?;
        declared.insert(component);
    }
    Ok(true)
}

/// [`maybe_declare`] through [`Connection::ensure`], reconnecting on
/// recoverable errors.
pub async fn maybe_declare_with_retry(
    entity: &Entity,
    connection: &Connection,
    errback: Option<&Errback<'_>>,
    on_revive: Option<&dyn Revive>,
) -> Result<bool, AmqpError> {
    let declared = connection.declared();
    connection
        .ensure(
            |channel| async move { maybe_declare_on(entity, &channel, declared).await },
            errback,
            on_revive,
        )
        .await
}

async fn declare(entity: &Entity, channel: &dyn TransportChannel) -> Result<(), AmqpError> {
    debug!(entity = entity.name(), "declaring");
    match entity {
        Entity::Exchange(exchange) => channel.exchange_declare(exchange).await,
        Entity::Queue(queue) => channel.queue_declare(queue).await,
        Entity::Binding(binding) => channel.queue_bind(binding).await,
    }
}

/// A set of exchanges, queues and bindings installed together.
///
/// Used as the [`Revive`] hook, it replays the whole set after the
/// connection has been re-established.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    exchanges: Vec<ExchangeDefinition>,
    queues: Vec<QueueDefinition>,
    bindings: Vec<QueueBinding>,
}

impl Topology {
    pub fn new() -> Topology {
        Topology::default()
    }

    /// Adds an exchange definition to the topology.
    pub fn exchange(mut self, def: &ExchangeDefinition) -> Self {
        self.exchanges.push(def.clone());
        self
    }

    /// Adds a queue definition to the topology.
    pub fn queue(mut self, def: &QueueDefinition) -> Self {
        if !self.queues.iter().any(|q| q.name == def.name) {
            self.queues.push(def.clone());
        }
        self
    }

    /// Adds a queue-to-exchange binding to the topology.
    pub fn queue_binding(mut self, binding: &QueueBinding) -> Self {
        self.bindings.push(binding.clone());
        self
    }

    pub fn queues(&self) -> &[QueueDefinition] {
        &self.queues
    }

    pub fn entities(&self) -> Vec<Entity> {
        self.exchanges
            .iter()
            .cloned()
            .map(Entity::from)
            .chain(self.queues.iter().cloned().map(Entity::from))
            .chain(self.bindings.iter().cloned().map(Entity::from))
            .collect()
    }

    /// Declares exchanges, then queues, then bindings.
    pub async fn install(&self, connection: &Connection) -> Result<(), AmqpError> {
        let channel = connection.default_channel().await?;
        self.install_on(&channel, connection.declared()).await
    }

    pub async fn install_on(
        &self,
        channel: &Arc<dyn TransportChannel>,
        declared: &DeclaredEntities,
    ) -> Result<(), AmqpError> {
        for entity in self.entities() {
            maybe_declare_on(&entity, channel, declared).await?;
        }
        debug!(
            exchanges = self.exchanges.len(),
            queues = self.queues.len(),
            bindings = self.bindings.len(),
            "topology installed"
        );
        Ok(())
    }
}

#[async_trait]
impl Revive for Topology {
    async fn on_revive(
        &self,
        connection: &Connection,
        channel: Arc<dyn TransportChannel>,
    ) -> Result<(), AmqpError> {
        self.install_on(&channel, connection.declared()).await
    }
}
