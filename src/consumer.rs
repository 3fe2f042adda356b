// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Consumer
//!
//! [`Consumer`] describes a subscription to one or more queues together with
//! the callbacks that receive decoded messages. [`Consumer::consume`]
//! declares the queues, registers the callbacks on the [`Connection`] and
//! starts the broker-side consumers, returning a [`ConsumerScope`] that
//! cancels them when it is closed or dropped.

use crate::{
    connection::{ignore_errors, Connection, ConsumerEntry, MessageCallback},
    errors::AmqpError,
    message::Message,
    queue::QueueDefinition,
    serialization::Body,
    topology::{maybe_declare_on, Entity},
    transport::TransportChannel,
};
use std::sync::Arc;
use tracing::{debug, error};
use uuid::Uuid;

/// A subscription to a set of queues.
#[derive(Clone)]
pub struct Consumer {
    queues: Vec<QueueDefinition>,
    tag: Option<String>,
    no_ack: bool,
    callbacks: Vec<MessageCallback>,
}

impl Consumer {
    pub fn new(queues: Vec<QueueDefinition>) -> Consumer {
        Consumer {
            queues,
            tag: None,
            no_ack: false,
            callbacks: Vec::new(),
        }
    }

    /// Consumer tag; with several queues it becomes the prefix of one tag
    /// per queue.
    pub fn tag(mut self, tag: &str) -> Self {
        self.tag = Some(tag.to_owned());
        self
    }

    /// Messages are acknowledged by the broker on delivery.
    pub fn no_ack(mut self, no_ack: bool) -> Self {
        self.no_ack = no_ack;
        self
    }

    pub fn callback(mut self, callback: MessageCallback) -> Self {
        self.callbacks.push(callback);
        self
    }

    pub fn on_message<F>(self, callback: F) -> Self
    where
        F: Fn(&Body, &Message) + Send + Sync + 'static,
    {
        self.callback(Arc::new(callback))
    }

    pub fn queues(&self) -> &[QueueDefinition] {
        &self.queues
    }

    /// Starts consuming on the connection's default channel.
    pub async fn consume<'c>(
        &self,
        connection: &'c Connection,
    ) -> Result<ConsumerScope<'c>, AmqpError> {
        let channel = connection.default_channel().await?;
        self.consume_on(connection, channel).await
    }

    /// Starts consuming on a specific channel of `connection`.
    pub async fn consume_on<'c>(
        &self,
        connection: &'c Connection,
        channel: Arc<dyn TransportChannel>,
    ) -> Result<ConsumerScope<'c>, AmqpError> {
        let mut scope = ConsumerScope {
            connection,
            channel: channel.clone(),
            tags: Vec::with_capacity(self.queues.len()),
            closed: false,
        };

        let base = self
            .tag
            .clone()
            .unwrap_or_else(|| format!("ctag-{}", Uuid::new_v4()));

        for (index, queue) in self.queues.iter().enumerate() {
            maybe_declare_on(&Entity::Queue(queue.clone()), &channel, connection.declared())
                .await?;

            let tag = if self.queues.len() == 1 {
                base.clone()
            } else {
                format!("{}.{}", base, index)
            };

            connection.register_consumer(
                &tag,
                ConsumerEntry {
                    channel: channel.clone(),
                    callbacks: self.callbacks.clone(),
                    no_ack: self.no_ack,
                },
            );

            if let Err(err) = channel.basic_consume(queue.name(), &tag, self.no_ack).await {
                error!(error = err.to_string(), queue = queue.name(), "error to create the consumer");
                connection.deregister_consumer(&tag);
                return Err(err);
            }

            debug!(queue = queue.name(), consumer_tag = tag, "consuming");
            scope.tags.push(tag);
        }

        Ok(scope)
    }
}

/// Active broker-side consumers of a [`Consumer`].
///
/// Dropping the scope without calling [`ConsumerScope::cancel`]
/// deregisters the callbacks immediately and cancels the broker-side
/// consumers on a spawned task.
pub struct ConsumerScope<'c> {
    connection: &'c Connection,
    channel: Arc<dyn TransportChannel>,
    tags: Vec<String>,
    closed: bool,
}

impl ConsumerScope<'_> {
    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn channel(&self) -> &Arc<dyn TransportChannel> {
        &self.channel
    }

    /// Cancels every consumer of the scope.
    pub async fn cancel(mut self) -> Result<(), AmqpError> {
        self.closed = true;
        for tag in &self.tags {
            self.connection.deregister_consumer(tag);
            ignore_errors(self.channel.basic_cancel(tag)).await?;
            debug!(consumer_tag = tag, "consumer cancelled");
        }
        Ok(())
    }
}

impl Drop for ConsumerScope<'_> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }

        for tag in &self.tags {
            self.connection.deregister_consumer(tag);
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let channel = self.channel.clone();
        let tags = std::mem::take(&mut self.tags);
        handle.spawn(async move {
            for tag in tags {
                let _ = channel.basic_cancel(&tag).await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{retry::RetryPolicy, transport::memory::MemoryBroker};

    async fn connect(broker: &MemoryBroker) -> Connection {
        Connection::connect(Arc::new(broker.clone()), RetryPolicy::new(Some(1)))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn one_tag_per_queue() {
        let broker = MemoryBroker::new();
        let conn = connect(&broker).await;

        let consumer = Consumer::new(vec![QueueDefinition::new("a"), QueueDefinition::new("b")])
            .tag("worker");
        let scope = consumer.consume(&conn).await.unwrap();

        assert_eq!(scope.tags(), ["worker.0", "worker.1"]);
        assert_eq!(broker.consumer_count("a"), 1);
        assert_eq!(broker.consumer_count("b"), 1);

        scope.cancel().await.unwrap();
        assert_eq!(broker.consumer_count("a"), 0);
        assert!(conn.consumer("worker.0").is_none());
    }

    #[tokio::test]
    async fn dropping_the_scope_cancels_consumers() {
        let broker = MemoryBroker::new();
        let conn = connect(&broker).await;

        let scope = Consumer::new(vec![QueueDefinition::new("a")])
            .consume(&conn)
            .await
            .unwrap();
        let tag = scope.tags()[0].clone();
        drop(scope);

        assert!(conn.consumer(&tag).is_none());
        tokio::task::yield_now().await;
        assert_eq!(broker.consumer_count("a"), 0);
    }
}
