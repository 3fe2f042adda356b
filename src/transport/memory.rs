// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Memory Broker
//!
//! A process-local broker implementing the transport traits. It routes
//! through direct, fanout and topic exchanges, tracks unacknowledged
//! deliveries per channel, honours prefetch limits and dead-letters rejected
//! messages. Fault injection hooks make connection loss reproducible in
//! tests.

use crate::{
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    message::{Delivery, OutboundMessage},
    queue::{QueueBinding, QueueDefinition},
    transport::{Transport, TransportChannel, TransportConnection},
};
use async_trait::async_trait;
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use tokio::sync::Notify;
use tracing::debug;

/// A message as recorded by [`MemoryBroker::published`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub message: OutboundMessage,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    message: OutboundMessage,
    redelivered: bool,
}

struct QueueState {
    definition: QueueDefinition,
    messages: VecDeque<StoredMessage>,
}

struct ConsumerState {
    queue: String,
    connection_id: u64,
    channel_id: u64,
    no_ack: bool,
}

struct Unacked {
    queue: String,
    connection_id: u64,
    channel_id: u64,
    stored: StoredMessage,
}

#[derive(Default)]
struct BrokerState {
    next_connection_id: u64,
    next_channel_id: u64,
    next_delivery_tag: u64,
    connections: HashSet<u64>,
    exchanges: HashMap<String, ExchangeDefinition>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<QueueBinding>,
    consumers: HashMap<String, ConsumerState>,
    unacked: HashMap<u64, Unacked>,
    prefetch: HashMap<u64, u16>,
    refuse_connections: u32,
    reject_authentication: bool,
    fail_operations: u32,
    socket_errors: u32,
    queue_declares: HashMap<String, usize>,
    exchange_declares: HashMap<String, usize>,
    qos_history: Vec<u16>,
    published: Vec<PublishedMessage>,
    reply_notifications: Vec<String>,
}

struct Inner {
    state: Mutex<BrokerState>,
    notify: Notify,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Runs `op` against the state of a live connection, applying injected
    /// failures first.
    fn with_live<T>(
        &self,
        connection_id: u64,
        op: impl FnOnce(&mut BrokerState) -> Result<T, AmqpError>,
    ) -> Result<T, AmqpError> {
        let result = {
            let mut state = self.lock();
            if !state.connections.contains(&connection_id) {
                return Err(AmqpError::ConnectionClosed);
            }
            if state.fail_operations > 0 {
                state.fail_operations -= 1;
                state.drop_connection(connection_id);
                Err(AmqpError::ConnectionError(
                    "connection reset by peer".to_owned(),
                ))
            } else {
                op(&mut *state)
            }
        };
        self.notify.notify_waiters();
        result
    }
}

impl BrokerState {
    fn drop_connection(&mut self, connection_id: u64) {
        if !self.connections.remove(&connection_id) {
            return;
        }

        let tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| u.connection_id == connection_id)
            .map(|(tag, _)| *tag)
            .collect();
        for tag in tags {
            if let Some(unacked) = self.unacked.remove(&tag) {
                self.requeue(unacked);
            }
        }

        let consumers: Vec<String> = self
            .consumers
            .iter()
            .filter(|(_, c)| c.connection_id == connection_id)
            .map(|(tag, _)| tag.clone())
            .collect();
        for tag in consumers {
            self.cancel(&tag);
        }
    }

    fn requeue(&mut self, unacked: Unacked) {
        if let Some(queue) = self.queues.get_mut(&unacked.queue) {
            let mut stored = unacked.stored;
            stored.redelivered = true;
            queue.messages.push_front(stored);
        }
    }

    fn dead_letter(&mut self, unacked: Unacked) {
        let dlq = self
            .queues
            .get(&unacked.queue)
            .and_then(|q| q.definition.dlq_name.clone());

        match dlq.and_then(|name| self.queues.get_mut(&name)) {
            Some(queue) => {
                let mut stored = unacked.stored;
                stored.redelivered = false;
                queue.messages.push_back(stored);
            }
            None => debug!(queue = unacked.queue, "rejected message dropped"),
        }
    }

    fn cancel(&mut self, consumer_tag: &str) {
        let Some(consumer) = self.consumers.remove(consumer_tag) else {
            return;
        };

        let auto_delete = self
            .queues
            .get(&consumer.queue)
            .map(|q| q.definition.delete)
            .unwrap_or(false);
        let remaining = self
            .consumers
            .values()
            .filter(|c| c.queue == consumer.queue)
            .count();

        if auto_delete && remaining == 0 {
            self.delete_queue(&consumer.queue);
        }
    }

    fn delete_queue(&mut self, name: &str) {
        self.queues.remove(name);
        self.bindings.retain(|b| b.queue_name != name);
    }

    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>, AmqpError> {
        if exchange.is_empty() {
            return Ok(self
                .queues
                .contains_key(routing_key)
                .then(|| vec![routing_key.to_owned()])
                .unwrap_or_default());
        }

        let definition = self
            .exchanges
            .get(exchange)
            .ok_or_else(|| AmqpError::NotFound(format!("no exchange '{}'", exchange)))?;

        let mut targets: Vec<String> = Vec::new();
        for binding in self.bindings.iter().filter(|b| b.exchange_name == exchange) {
            let matched = match definition.kind {
                ExchangeKind::Direct => binding.routing_key == routing_key,
                ExchangeKind::Fanout => true,
                ExchangeKind::Topic => topic_matches(&binding.routing_key, routing_key),
            };
            if matched && !targets.contains(&binding.queue_name) {
                targets.push(binding.queue_name.clone());
            }
        }
        Ok(targets)
    }

    fn in_flight(&self, channel_id: u64) -> usize {
        self.unacked
            .values()
            .filter(|u| u.channel_id == channel_id)
            .count()
    }

    fn next_delivery(&mut self, connection_id: u64) -> Option<Delivery> {
        let mut tags: Vec<&String> = self
            .consumers
            .iter()
            .filter(|(_, c)| c.connection_id == connection_id)
            .map(|(tag, _)| tag)
            .collect();
        tags.sort();

        let mut chosen = None;
        for tag in tags {
            let consumer = &self.consumers[tag];
            if !consumer.no_ack {
                let limit = self.prefetch.get(&consumer.channel_id).copied().unwrap_or(0);
                if limit > 0 && self.in_flight(consumer.channel_id) >= usize::from(limit) {
                    continue;
                }
            }
            let has_messages = self
                .queues
                .get(&consumer.queue)
                .map(|q| !q.messages.is_empty())
                .unwrap_or(false);
            if has_messages {
                chosen = Some(tag.clone());
                break;
            }
        }

        let tag = chosen?;
        let consumer = &self.consumers[&tag];
        let (queue_name, channel_id, no_ack) =
            (consumer.queue.clone(), consumer.channel_id, consumer.no_ack);
        let stored = self.queues.get_mut(&queue_name)?.messages.pop_front()?;

        self.next_delivery_tag += 1;
        let delivery_tag = self.next_delivery_tag;
        let delivery = Delivery {
            consumer_tag: tag,
            delivery_tag,
            exchange: stored.exchange.clone(),
            routing_key: stored.routing_key.clone(),
            redelivered: stored.redelivered,
            body: stored.message.body.clone(),
            properties: stored.message.properties.clone(),
        };

        if !no_ack {
            self.unacked.insert(
                delivery_tag,
                Unacked {
                    queue: queue_name,
                    connection_id,
                    channel_id,
                    stored,
                },
            );
        }
        Some(delivery)
    }
}

fn topic_matches(pattern: &str, key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match pattern.split_first() {
            None => key.is_empty(),
            Some((&"#", rest)) => (0..=key.len()).any(|skip| matches(rest, &key[skip..])),
            Some((&"*", rest)) => !key.is_empty() && matches(rest, &key[1..]),
            Some((word, rest)) => key.first() == Some(word) && matches(rest, &key[1..]),
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    matches(&pattern, &key)
}

fn same_queue_properties(a: &QueueDefinition, b: &QueueDefinition) -> bool {
    a.durable == b.durable
        && a.delete == b.delete
        && a.exclusive == b.exclusive
        && a.ttl == b.ttl
        && a.max_length == b.max_length
        && a.max_length_bytes == b.max_length_bytes
        && a.expires == b.expires
        && a.dlq_name == b.dlq_name
}

/// In-process broker. Clones share the same state.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        MemoryBroker::new()
    }
}

impl MemoryBroker {
    pub fn new() -> MemoryBroker {
        MemoryBroker {
            inner: Arc::new(Inner {
                state: Mutex::new(BrokerState::default()),
                notify: Notify::new(),
            }),
        }
    }

    /// Refuses the next `count` connection attempts.
    pub fn refuse_connections(&self, count: u32) {
        self.inner.lock().refuse_connections = count;
    }

    /// Fails every connection attempt with an authentication error.
    pub fn reject_authentication(&self, reject: bool) {
        self.inner.lock().reject_authentication = reject;
    }

    /// The next `count` channel operations drop their connection and fail.
    pub fn fail_next_operations(&self, count: u32) {
        self.inner.lock().fail_operations = count;
    }

    /// The next `count` drains fail with a socket error, leaving the
    /// connection open.
    pub fn fail_next_drains(&self, count: u32) {
        self.inner.lock().socket_errors = count;
    }

    /// Drops every live connection, requeueing their unacknowledged messages.
    pub fn kill_connections(&self) {
        {
            let mut state = self.inner.lock();
            let ids: Vec<u64> = state.connections.iter().copied().collect();
            for id in ids {
                state.drop_connection(id);
            }
        }
        self.inner.notify.notify_waiters();
    }

    pub fn queue_declare_count(&self, name: &str) -> usize {
        self.inner.lock().queue_declares.get(name).copied().unwrap_or(0)
    }

    pub fn exchange_declare_count(&self, name: &str) -> usize {
        self.inner
            .lock()
            .exchange_declares
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    /// Every prefetch count applied through `basic_qos`, in order.
    pub fn qos_history(&self) -> Vec<u16> {
        self.inner.lock().qos_history.clone()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.inner.lock().published.clone()
    }

    /// Messages ready for delivery on a queue, excluding unacknowledged ones.
    pub fn queue_len(&self, name: &str) -> usize {
        self.inner
            .lock()
            .queues
            .get(name)
            .map(|q| q.messages.len())
            .unwrap_or(0)
    }

    /// Reply queues the broker was told are done with.
    pub fn reply_notifications(&self) -> Vec<String> {
        self.inner.lock().reply_notifications.clone()
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.inner.lock().queues.contains_key(name)
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.inner.lock().exchanges.contains_key(name)
    }

    pub fn has_binding(&self, queue: &str, exchange: &str, routing_key: &str) -> bool {
        self.inner.lock().bindings.iter().any(|b| {
            b.queue_name == queue && b.exchange_name == exchange && b.routing_key == routing_key
        })
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.inner
            .lock()
            .consumers
            .values()
            .filter(|c| c.queue == queue)
            .count()
    }

    pub fn unacked_count(&self) -> usize {
        self.inner.lock().unacked.len()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.lock().connections.len()
    }
}

#[async_trait]
impl Transport for MemoryBroker {
    fn endpoint(&self) -> String {
        "memory://localhost".to_owned()
    }

    async fn connect(&self) -> Result<Arc<dyn TransportConnection>, AmqpError> {
        let mut state = self.inner.lock();
        if state.refuse_connections > 0 {
            state.refuse_connections -= 1;
            return Err(AmqpError::ConnectionError("connection refused".to_owned()));
        }
        if state.reject_authentication {
            return Err(AmqpError::AuthenticationError(
                "ACCESS_REFUSED - login was refused".to_owned(),
            ));
        }

        state.next_connection_id += 1;
        let id = state.next_connection_id;
        state.connections.insert(id);
        debug!(connection = id, "memory connection opened");

        Ok(Arc::new(MemoryConnection {
            inner: self.inner.clone(),
            id,
        }))
    }
}

struct MemoryConnection {
    inner: Arc<Inner>,
    id: u64,
}

#[async_trait]
impl TransportConnection for MemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn TransportChannel>, AmqpError> {
        let mut state = self.inner.lock();
        if !state.connections.contains(&self.id) {
            return Err(AmqpError::ConnectionClosed);
        }
        state.next_channel_id += 1;

        Ok(Arc::new(MemoryChannel {
            inner: self.inner.clone(),
            connection_id: self.id,
            channel_id: state.next_channel_id,
        }))
    }

    async fn drain_events(&self, timeout: Option<Duration>) -> Result<Delivery, AmqpError> {
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);

        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.inner.lock();
                if !state.connections.contains(&self.id) {
                    return Err(AmqpError::ConnectionClosed);
                }
                if state.socket_errors > 0 {
                    state.socket_errors -= 1;
                    return Err(AmqpError::SocketError("connection reset".to_owned()));
                }
                if let Some(delivery) = state.next_delivery(self.id) {
                    return Ok(delivery);
                }
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Err(AmqpError::Timeout);
                    }
                }
                None => notified.await,
            }
        }
    }

    fn is_open(&self) -> bool {
        self.inner.lock().connections.contains(&self.id)
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.inner.lock().drop_connection(self.id);
        self.inner.notify.notify_waiters();
        Ok(())
    }
}

struct MemoryChannel {
    inner: Arc<Inner>,
    connection_id: u64,
    channel_id: u64,
}

#[async_trait]
impl TransportChannel for MemoryChannel {
    async fn exchange_declare(&self, exchange: &ExchangeDefinition) -> Result<(), AmqpError> {
        if exchange.is_default() {
            return Ok(());
        }

        self.inner.with_live(self.connection_id, |state| {
            *state
                .exchange_declares
                .entry(exchange.name.clone())
                .or_default() += 1;

            match state.exchanges.get(&exchange.name) {
                Some(existing) => {
                    if existing.kind != exchange.kind
                        || existing.durable != exchange.durable
                        || existing.delete != exchange.delete
                        || existing.internal != exchange.internal
                    {
                        return Err(AmqpError::DeclarationConflict(format!(
                            "PRECONDITION_FAILED - inequivalent arg for exchange '{}'",
                            exchange.name
                        )));
                    }
                }
                None if exchange.passive => {
                    return Err(AmqpError::NotFound(format!(
                        "NOT_FOUND - no exchange '{}'",
                        exchange.name
                    )));
                }
                None => {
                    state
                        .exchanges
                        .insert(exchange.name.clone(), exchange.clone());
                }
            }
            Ok(())
        })
    }

    async fn queue_declare(&self, queue: &QueueDefinition) -> Result<(), AmqpError> {
        self.inner.with_live(self.connection_id, |state| {
            *state.queue_declares.entry(queue.name.clone()).or_default() += 1;

            match state.queues.get(&queue.name) {
                Some(existing) => {
                    if !queue.passive && !same_queue_properties(&existing.definition, queue) {
                        return Err(AmqpError::DeclarationConflict(format!(
                            "PRECONDITION_FAILED - inequivalent arg for queue '{}'",
                            queue.name
                        )));
                    }
                }
                None if queue.passive => {
                    return Err(AmqpError::NotFound(format!(
                        "NOT_FOUND - no queue '{}'",
                        queue.name
                    )));
                }
                None => {
                    state.queues.insert(
                        queue.name.clone(),
                        QueueState {
                            definition: queue.clone(),
                            messages: VecDeque::new(),
                        },
                    );
                }
            }
            Ok(())
        })
    }

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.inner.with_live(self.connection_id, |state| {
            if !state.queues.contains_key(&binding.queue_name) {
                return Err(AmqpError::NotFound(format!(
                    "NOT_FOUND - no queue '{}'",
                    binding.queue_name
                )));
            }
            if binding.exchange_name.is_empty() {
                return Err(AmqpError::ConfigurationError(
                    "ACCESS_REFUSED - operation not permitted on the default exchange".to_owned(),
                ));
            }
            if !state.exchanges.contains_key(&binding.exchange_name) {
                return Err(AmqpError::NotFound(format!(
                    "NOT_FOUND - no exchange '{}'",
                    binding.exchange_name
                )));
            }
            if !state.bindings.contains(binding) {
                state.bindings.push(binding.clone());
            }
            Ok(())
        })
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.inner.with_live(self.connection_id, |state| {
            state.qos_history.push(prefetch_count);
            state.prefetch.insert(self.channel_id, prefetch_count);
            Ok(())
        })
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &OutboundMessage,
    ) -> Result<(), AmqpError> {
        self.inner.with_live(self.connection_id, |state| {
            let targets = state.route(exchange, routing_key)?;
            state.published.push(PublishedMessage {
                exchange: exchange.to_owned(),
                routing_key: routing_key.to_owned(),
                message: message.clone(),
            });

            for target in targets {
                if let Some(queue) = state.queues.get_mut(&target) {
                    queue.messages.push_back(StoredMessage {
                        exchange: exchange.to_owned(),
                        routing_key: routing_key.to_owned(),
                        message: message.clone(),
                        redelivered: false,
                    });
                    if let Some(max) = queue.definition.max_length {
                        while queue.messages.len() > usize::try_from(max).unwrap_or(0) {
                            queue.messages.pop_front();
                        }
                    }
                }
            }
            Ok(())
        })
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
    ) -> Result<(), AmqpError> {
        self.inner.with_live(self.connection_id, |state| {
            if !state.queues.contains_key(queue) {
                return Err(AmqpError::NotFound(format!("NOT_FOUND - no queue '{}'", queue)));
            }
            if state.consumers.contains_key(consumer_tag) {
                return Err(AmqpError::ConsumerError(format!(
                    "NOT_ALLOWED - attempt to reuse consumer tag '{}'",
                    consumer_tag
                )));
            }
            state.consumers.insert(
                consumer_tag.to_owned(),
                ConsumerState {
                    queue: queue.to_owned(),
                    connection_id: self.connection_id,
                    channel_id: self.channel_id,
                    no_ack,
                },
            );
            Ok(())
        })
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.inner.with_live(self.connection_id, |state| {
            state.cancel(consumer_tag);
            Ok(())
        })
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.inner.with_live(self.connection_id, |state| {
            state.unacked.remove(&delivery_tag).map(|_| ()).ok_or_else(|| {
                AmqpError::ChannelError(format!(
                    "PRECONDITION_FAILED - unknown delivery tag {}",
                    delivery_tag
                ))
            })
        })
    }

    async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.inner.with_live(self.connection_id, |state| {
            let unacked = state.unacked.remove(&delivery_tag).ok_or_else(|| {
                AmqpError::ChannelError(format!(
                    "PRECONDITION_FAILED - unknown delivery tag {}",
                    delivery_tag
                ))
            })?;
            if requeue {
                state.requeue(unacked);
            } else {
                state.dead_letter(unacked);
            }
            Ok(())
        })
    }

    async fn after_reply_message_received(&self, queue: &str) -> Result<(), AmqpError> {
        self.inner.with_live(self.connection_id, |state| {
            state.reply_notifications.push(queue.to_owned());
            state.delete_queue(queue);
            Ok(())
        })
    }

    fn is_open(&self) -> bool {
        self.inner.lock().connections.contains(&self.connection_id)
    }
}
