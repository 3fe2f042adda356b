// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Task Dispatcher
//!
//! Registry of named tasks and the producer side of task execution.
//!
//! A [`TaskDefinition`] links a task name to the queue it is published to and
//! the [`TaskHandler`] that executes it. [`TaskDispatcher::submit`] publishes
//! the raw payload with `message_id = task_id` and `type = task name`; the
//! call returns once the broker confirmed the message, never waiting for a
//! worker. Deliveries are executed by a [`TaskWorker`](crate::worker::TaskWorker)
//! built from the same dispatcher.

use crate::{
    connection::{Errback, Revive},
    errors::{AmqpError, TaskError},
    pool::ConnectionPool,
    publisher::{publish_on, PublishOptions},
    queue::QueueDefinition,
    serialization::{Body, Codec},
    state::{TaskId, TaskState},
    topology::Topology,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc};
use tracing::{debug, error};

/// Executes the payload of one task.
///
/// Deliveries are at-least-once: a handler may see the same task id again
/// after a crash or a lost acknowledgement and must produce the same side
/// effects.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, payload: &[u8], task_id: &TaskId) -> Result<(), TaskError>;
}

/// Associates a task name with its queue and handler.
#[derive(Clone)]
pub struct TaskDefinition {
    pub(crate) name: String,
    pub(crate) queue: QueueDefinition,
    pub(crate) handler: Arc<dyn TaskHandler>,
}

impl TaskDefinition {
    pub fn new(name: &str, queue: QueueDefinition, handler: Arc<dyn TaskHandler>) -> Self {
        TaskDefinition {
            name: name.to_owned(),
            queue,
            handler,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queue(&self) -> &QueueDefinition {
        &self.queue
    }
}

/// Outcome of a task, published to the submitter's `reply_to` queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub task: String,
    pub status: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Task registry and producer.
#[derive(Clone)]
pub struct TaskDispatcher {
    pool: ConnectionPool,
    pub(crate) tasks: HashMap<String, TaskDefinition>,
    errback: Option<Arc<Errback<'static>>>,
}

impl TaskDispatcher {
    pub fn new(pool: ConnectionPool) -> Self {
        TaskDispatcher {
            pool,
            tasks: HashMap::default(),
            errback: None,
        }
    }

    /// Registers a task. A later registration with the same name wins.
    pub fn register(mut self, def: TaskDefinition) -> Self {
        self.tasks.insert(def.name.clone(), def);
        self
    }

    /// Called before every publish retry instead of the default error log.
    pub fn errback<F>(mut self, errback: F) -> Self
    where
        F: Fn(&AmqpError, std::time::Duration) + Send + Sync + 'static,
    {
        let errback: Arc<Errback<'static>> = Arc::new(errback);
        self.errback = Some(errback);
        self
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn task(&self, name: &str) -> Option<&TaskDefinition> {
        self.tasks.get(name)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &TaskDefinition> {
        self.tasks.values()
    }

    /// Every task queue, with its dead-letter queue and binding.
    pub fn topology(&self) -> Topology {
        let mut defs: Vec<&TaskDefinition> = self.tasks.values().collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));

        defs.into_iter()
            .fold(Topology::new(), |topology, def| topology.queue(&def.queue))
    }

    /// Publishes a task; `Ok` means the broker accepted and queued it.
    pub async fn submit(
        &self,
        task: &str,
        task_id: &TaskId,
        payload: &[u8],
    ) -> Result<(), AmqpError> {
        self.publish(task, task_id, payload, None).await
    }

    /// Like [`TaskDispatcher::submit`], asking the worker to publish a
    /// [`TaskResult`] to `reply_to` with the task id as correlation id.
    pub async fn submit_with_reply(
        &self,
        task: &str,
        task_id: &TaskId,
        payload: &[u8],
        reply_to: &str,
    ) -> Result<(), AmqpError> {
        self.publish(task, task_id, payload, Some(reply_to)).await
    }

    async fn publish(
        &self,
        task: &str,
        task_id: &TaskId,
        payload: &[u8],
        reply_to: Option<&str>,
    ) -> Result<(), AmqpError> {
        let Some(def) = self.tasks.get(task) else {
            error!(task, "submitting an unregistered task");
            return Err(AmqpError::NotFound(format!("task `{}`", task)));
        };

        let options = publish_options(def, task_id, reply_to);
        let body = Body::Bytes(payload.to_vec());
        let topology = Topology::new().queue(&def.queue);

        let conn = self.pool.acquire().await?;
        let declared = conn.declared();
        let (options, body) = (&options, &body);
        conn.ensure(
            |channel| async move { publish_on(&channel, declared, body, options).await },
            self.errback.as_deref(),
            Some(&topology as &dyn Revive),
        )
        .await?;

        debug!(task, task_id = task_id.as_str(), "task queued");
        Ok(())
    }
}

fn publish_options(def: &TaskDefinition, task_id: &TaskId, reply_to: Option<&str>) -> PublishOptions {
    let (_, routing_key) = def.queue.publish_target();

    let mut options = PublishOptions::new(routing_key)
        .codec(Codec::Binary)
        .message_id(task_id.as_str())
        .kind(&def.name)
        .declare(def.queue.clone());
    if let Some(exchange) = def.queue.exchange().filter(|e| !e.is_default()) {
        options = options.exchange(exchange);
    }
    if let Some(reply_to) = reply_to {
        options = options.reply_to(reply_to).correlation_id(task_id.as_str());
    }
    options
}
