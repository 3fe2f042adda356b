// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Task Worker
//!
//! Consumer side of the task dispatcher.
//!
//! [`TaskWorker::run`] consumes every registered task queue on one pooled
//! connection and executes deliveries on tokio tasks, at most `concurrency`
//! at a time. The broker prefetch is `concurrency * prefetch_multiplier`
//! and is kept in sync with [`WorkerControl`] by the consume loop, which
//! applies pending QoS changes once per iteration.
//!
//! Deliveries are settled after the handler ran: acked when it succeeded,
//! rejected without requeue on a permanent failure (dead-lettered when the
//! queue has a DLQ) and requeued on a transient one. A lost connection is
//! revived, the topology re-installed and consumption resumed; in-flight
//! tasks of the old connection are redelivered by the broker.

use crate::{
    connection::{ignore_errors, Connection},
    consumer::{Consumer, ConsumerScope},
    dispatcher::{TaskDefinition, TaskDispatcher, TaskResult},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    message::Message,
    otel,
    pool::ConnectionPool,
    qos::Qos,
    retry::millis,
    rpc::isend_reply,
    serialization::{Body, JSON_CONTENT_TYPE},
    state::{TaskId, TaskState, WorkerState},
    topology::Topology,
};
use opentelemetry::{
    global,
    trace::{Span, Status},
};
use serde::Deserialize;
use std::{
    borrow::Cow,
    collections::HashMap,
    future::Future,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::{
    sync::{AcquireError, OwnedSemaphorePermit, Semaphore},
    task::JoinSet,
};
use tracing::{debug, error, info, warn};

/// Execution limits of a [`TaskWorker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct WorkerOptions {
    /// Tasks executed in parallel.
    pub concurrency: usize,
    /// Deliveries prefetched per execution slot.
    pub prefetch_multiplier: u32,
    /// Maximum wait of one drain iteration.
    #[serde(with = "millis")]
    pub drain_timeout: Duration,
    /// Time granted to in-flight tasks on shutdown.
    #[serde(with = "millis")]
    pub shutdown_timeout: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        WorkerOptions {
            concurrency: 4,
            prefetch_multiplier: 4,
            drain_timeout: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerOptions {
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn prefetch_multiplier(mut self, multiplier: u32) -> Self {
        self.prefetch_multiplier = multiplier;
        self
    }

    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    fn prefetch_count(&self) -> u32 {
        prefetch_for(self.concurrency, self.prefetch_multiplier)
    }
}

fn prefetch_for(slots: usize, multiplier: u32) -> u32 {
    u32::try_from(slots)
        .unwrap_or(u32::MAX)
        .saturating_mul(multiplier)
}

struct ControlInner {
    permits: Arc<Semaphore>,
    concurrency: AtomicUsize,
    prefetch_multiplier: u32,
    qos: Mutex<Option<Arc<Qos>>>,
}

/// Handle resizing a running worker. Clones control the same worker.
#[derive(Clone)]
pub struct WorkerControl {
    inner: Arc<ControlInner>,
}

impl WorkerControl {
    fn new(concurrency: usize, prefetch_multiplier: u32) -> Self {
        WorkerControl {
            inner: Arc::new(ControlInner {
                permits: Arc::new(Semaphore::new(concurrency)),
                concurrency: AtomicUsize::new(concurrency),
                prefetch_multiplier,
                qos: Mutex::new(None),
            }),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.inner.concurrency.load(Ordering::SeqCst)
    }

    /// Adds `n` execution slots and raises the prefetch accordingly.
    pub async fn grow(&self, n: usize) -> usize {
        if n == 0 {
            return self.concurrency();
        }
        self.inner.permits.add_permits(n);
        let concurrency = self.inner.concurrency.fetch_add(n, Ordering::SeqCst) + n;

        if let Some(qos) = self.qos() {
            qos.increment_eventually(prefetch_for(n, self.inner.prefetch_multiplier))
                .await;
        }
        info!(concurrency, "worker grown");
        concurrency
    }

    /// Removes up to `n` execution slots, keeping at least one.
    ///
    /// Busy slots are retired as soon as their task finishes.
    pub async fn shrink(&self, n: usize) -> usize {
        let current = self.concurrency();
        let n = n.min(current.saturating_sub(1));
        if n == 0 {
            return current;
        }
        let concurrency = self.inner.concurrency.fetch_sub(n, Ordering::SeqCst) - n;

        let permits = self.inner.permits.clone();
        let count = u32::try_from(n).unwrap_or(u32::MAX);
        tokio::spawn(async move {
            if let Ok(retired) = permits.acquire_many_owned(count).await {
                retired.forget();
            }
        });

        if let Some(qos) = self.qos() {
            qos.decrement_eventually(prefetch_for(n, self.inner.prefetch_multiplier))
                .await;
        }
        info!(concurrency, "worker shrunk");
        concurrency
    }

    fn permits(&self) -> Arc<Semaphore> {
        self.inner.permits.clone()
    }

    fn qos(&self) -> Option<Arc<Qos>> {
        self.inner.qos.lock().ok().and_then(|qos| qos.clone())
    }

    fn attach(&self, qos: Option<Arc<Qos>>) {
        if let Ok(mut slot) = self.inner.qos.lock() {
            *slot = qos;
        }
    }
}

/// What one iteration of the consume loop observed.
enum Event {
    Shutdown,
    Finished,
    Drained(Result<Message, AmqpError>),
    Slot(Result<OwnedSemaphorePermit, AcquireError>),
}

/// A delivery admitted for execution, waiting for a free slot.
struct Reserved {
    def: TaskDefinition,
    message: Message,
    task_id: TaskId,
}

/// Executes the tasks registered on a [`TaskDispatcher`].
pub struct TaskWorker {
    pool: ConnectionPool,
    tasks: HashMap<String, TaskDefinition>,
    topology: Topology,
    options: WorkerOptions,
    state: Arc<WorkerState>,
    control: WorkerControl,
    reply_exchange: ExchangeDefinition,
}

impl TaskWorker {
    pub fn new(dispatcher: &TaskDispatcher, options: WorkerOptions) -> Self {
        let options = options.concurrency(options.concurrency);
        TaskWorker {
            pool: dispatcher.pool().clone(),
            tasks: dispatcher.tasks.clone(),
            topology: dispatcher.topology(),
            options,
            state: Arc::new(WorkerState::new()),
            control: WorkerControl::new(options.concurrency, options.prefetch_multiplier),
            reply_exchange: ExchangeDefinition::default_exchange(),
        }
    }

    /// Shares a state object, e.g. to revoke tasks from outside the worker.
    pub fn with_state(mut self, state: Arc<WorkerState>) -> Self {
        self.state = state;
        self
    }

    /// Exchange task results are published to.
    pub fn reply_exchange(mut self, exchange: &ExchangeDefinition) -> Self {
        self.reply_exchange = exchange.clone();
        self
    }

    pub fn state(&self) -> &Arc<WorkerState> {
        &self.state
    }

    pub fn control(&self) -> WorkerControl {
        self.control.clone()
    }

    /// Consumes and executes tasks until `shutdown` resolves.
    ///
    /// On shutdown a delivery still waiting for a free slot is requeued, the
    /// consumers are cancelled and in-flight tasks get up to the shutdown
    /// timeout to finish. Returns an error when the connection
    /// cannot be revived or a fatal broker error occurs.
    pub async fn run<F>(&self, shutdown: F) -> Result<(), AmqpError>
    where
        F: Future<Output = ()> + Send,
    {
        tokio::pin!(shutdown);

        let pooled = self.pool.acquire().await?;
        let conn: &Connection = &pooled;
        conn.ensure_connection(None).await?;

        let channel = conn.default_channel().await?;
        let qos = Arc::new(Qos::new(channel, self.options.prefetch_count()));
        self.control.attach(Some(qos.clone()));

        let mut scope = match self.start(conn, &qos).await {
            Ok(scope) => Some(scope),
            Err(err) => {
                self.control.attach(None);
                return Err(err);
            }
        };
        info!(
            endpoint = conn.endpoint(),
            tasks = self.tasks.len(),
            concurrency = self.control.concurrency(),
            "worker ready"
        );

        let mut in_flight: JoinSet<()> = JoinSet::new();
        let mut waiting: Option<Reserved> = None;
        let result = loop {
            if let Err(err) = qos.update().await {
                debug!(error = err.to_string(), "qos update deferred");
            }

            // While a delivery waits for a slot nothing else is drained.
            let event = tokio::select! {
                biased;
                _ = &mut shutdown => Event::Shutdown,
                Some(_) = in_flight.join_next(), if !in_flight.is_empty() => Event::Finished,
                permit = self.control.permits().acquire_owned(), if waiting.is_some() => {
                    Event::Slot(permit)
                }
                drained = conn.drain_events(Some(self.options.drain_timeout)), if waiting.is_none() => {
                    Event::Drained(drained)
                }
            };

            match event {
                Event::Shutdown => break Ok(()),
                Event::Finished => continue,
                Event::Slot(permit) => {
                    if let Some(reserved) = waiting.take() {
                        self.execute(reserved, permit, &mut in_flight).await;
                    }
                }
                Event::Drained(Ok(message)) => waiting = self.admit(message).await,
                Event::Drained(Err(AmqpError::Timeout)) => continue,
                Event::Drained(Err(err)) if err.is_socket_error() => {
                    debug!(error = err.to_string(), "ignoring socket error");
                }
                Event::Drained(Err(err)) if err.is_recoverable() => {
                    warn!(error = err.to_string(), "consumer connection lost, reviving");
                    drop(scope.take());
                    match self.restart(conn, &qos).await {
                        Ok(revived) => scope = Some(revived),
                        Err(err) => break Err(err),
                    }
                }
                Event::Drained(Err(err)) => {
                    error!(error = err.to_string(), "errors consume msg");
                    break Err(err);
                }
            }
        };

        if let Some(reserved) = waiting.take() {
            self.release(reserved).await;
        }
        self.stop(conn, scope, &mut in_flight).await;
        result
    }

    fn consumer(&self) -> Consumer {
        Consumer::new(self.topology.queues().to_vec())
    }

    async fn start<'c>(
        &self,
        conn: &'c Connection,
        qos: &Qos,
    ) -> Result<ConsumerScope<'c>, AmqpError> {
        self.topology.install(conn).await?;
        qos.update().await?;
        let channel = conn.default_channel().await?;
        self.consumer().consume_on(conn, channel).await
    }

    async fn restart<'c>(
        &self,
        conn: &'c Connection,
        qos: &Qos,
    ) -> Result<ConsumerScope<'c>, AmqpError> {
        conn.ensure_connection(None).await?;
        let channel = conn.default_channel().await?;
        qos.rebind(channel).await;

        let scope = self.start(conn, qos).await?;
        info!(endpoint = conn.endpoint(), "worker resumed");
        Ok(scope)
    }

    async fn stop(
        &self,
        conn: &Connection,
        scope: Option<ConsumerScope<'_>>,
        in_flight: &mut JoinSet<()>,
    ) {
        if let Some(scope) = scope {
            if let Err(err) = scope.cancel().await {
                debug!(error = err.to_string(), "failure cancelling consumers");
            }
        }

        let drained = tokio::time::timeout(self.options.shutdown_timeout, async {
            while in_flight.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                abandoned = in_flight.len(),
                "shutdown timeout elapsed, abandoning in-flight tasks"
            );
            in_flight.abort_all();
        }

        self.control.attach(None);
        // Unsettled prefetched deliveries go back to their queues.
        if let Err(err) = ignore_errors(conn.close()).await {
            debug!(error = err.to_string(), "failure closing worker connection");
        }
        info!("worker stopped");
    }

    /// Settles deliveries that must not run and reserves the others.
    async fn admit(&self, message: Message) -> Option<Reserved> {
        if message.acknowledged() {
            return None;
        }

        let name = message.properties().kind().unwrap_or_default().to_owned();
        let task_id = TaskId::new(message.properties().message_id().unwrap_or_default());

        let Some(def) = self.tasks.get(&name).cloned() else {
            error!(task = name, "received unregistered task, rejecting");
            if let Err(err) = message.reject().await {
                error!(error = err.to_string(), "error whiling reject msg");
            }
            return None;
        };

        if self.state.is_revoked(&task_id) {
            info!(task = name, task_id = task_id.as_str(), "discarding revoked task");
            if let Err(err) = message.ack().await {
                error!(error = err.to_string(), "error whiling ack msg");
            }
            return None;
        }

        self.state.task_reserved(&task_id);
        Some(Reserved {
            def,
            message,
            task_id,
        })
    }

    async fn execute(
        &self,
        reserved: Reserved,
        permit: Result<OwnedSemaphorePermit, AcquireError>,
        in_flight: &mut JoinSet<()>,
    ) {
        let Ok(permit) = permit else {
            self.release(reserved).await;
            return;
        };

        let Reserved {
            def,
            message,
            task_id,
        } = reserved;
        let execution = Execution {
            state: self.state.clone(),
            pool: self.pool.clone(),
            reply_exchange: self.reply_exchange.clone(),
        };
        in_flight.spawn(async move {
            execution.run(def, message, task_id).await;
            drop(permit);
        });
    }

    /// Hands a reserved delivery that never ran back to its queue.
    async fn release(&self, reserved: Reserved) {
        self.state.task_ready(&reserved.task_id);
        debug!(
            task = reserved.def.name,
            task_id = reserved.task_id.as_str(),
            "requeueing unstarted task"
        );
        if let Err(err) = reserved.message.requeue().await {
            debug!(error = err.to_string(), "failure requeueing task");
        }
    }
}

/// Everything a spawned task needs besides its delivery.
struct Execution {
    state: Arc<WorkerState>,
    pool: ConnectionPool,
    reply_exchange: ExchangeDefinition,
}

impl Execution {
    async fn run(self, def: TaskDefinition, message: Message, task_id: TaskId) {
        let tracer = global::tracer("task worker");
        let (_ctx, mut span) = otel::new_span(message.properties(), &tracer, &def.name);

        self.state.task_accepted(&task_id, &def.name);
        debug!(
            task = def.name,
            task_id = task_id.as_str(),
            redelivered = message.redelivered(),
            "executing task"
        );

        let outcome = def.handler.handle(message.body(), &task_id).await;

        let settled = match outcome {
            Ok(()) => {
                debug!(task = def.name, task_id = task_id.as_str(), "task completed");
                self.reply(&def, &message, &task_id, TaskState::Completed, None)
                    .await;
                span.set_status(Status::Ok);
                message.ack().await
            }
            Err(err) if err.is_permanent() => {
                error!(
                    error = err.to_string(),
                    task = def.name,
                    task_id = task_id.as_str(),
                    "task failed, rejecting"
                );
                self.reply(&def, &message, &task_id, TaskState::Failed, Some(err.to_string()))
                    .await;
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from(err.to_string()),
                });
                message.reject().await
            }
            Err(err) => {
                warn!(
                    error = err.to_string(),
                    task = def.name,
                    task_id = task_id.as_str(),
                    "error whiling handling task, requeuing for latter"
                );
                span.record_error(&err);
                message.requeue().await
            }
        };

        if let Err(err) = settled {
            error!(
                error = err.to_string(),
                task_id = task_id.as_str(),
                "error whiling settling msg"
            );
            span.record_error(&err);
        }
        self.state.task_ready(&task_id);
        span.end();
    }

    async fn reply(
        &self,
        def: &TaskDefinition,
        message: &Message,
        task_id: &TaskId,
        status: TaskState,
        error: Option<String>,
    ) {
        if message.properties().reply_to().is_none() {
            return;
        }

        let result = TaskResult {
            task_id: task_id.clone(),
            task: def.name.clone(),
            status,
            error,
        };
        let body = match serde_json::to_value(&result) {
            Ok(value) => Body::Json(value),
            Err(err) => {
                error!(error = err.to_string(), "cannot serialize task result");
                return;
            }
        };

        let request = message
            .properties()
            .clone()
            .with_content_type(JSON_CONTENT_TYPE);
        if let Err(err) = isend_reply(&self.pool, &self.reply_exchange, &request, &body, None).await {
            error!(
                error = err.to_string(),
                task_id = task_id.as_str(),
                "failure to publish task result"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dispatcher::MockTaskHandler, errors::TaskError, queue::QueueDefinition,
        retry::RetryPolicy, transport::memory::MemoryBroker,
    };
    use tokio::sync::oneshot;

    fn pool(broker: &MemoryBroker) -> ConnectionPool {
        ConnectionPool::new(
            Arc::new(broker.clone()),
            RetryPolicy::new(Some(3))
                .interval_start(Duration::from_millis(1))
                .interval_max(Duration::from_millis(5)),
            4,
            Duration::from_millis(200),
        )
    }

    fn options() -> WorkerOptions {
        WorkerOptions::default()
            .concurrency(2)
            .prefetch_multiplier(2)
            .drain_timeout(Duration::from_millis(10))
            .shutdown_timeout(Duration::from_secs(1))
    }

    async fn wait_until<F: Fn() -> bool>(check: F) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn outcomes_settle_deliveries() {
        let broker = MemoryBroker::new();
        let mut handler = MockTaskHandler::new();
        handler.expect_handle().returning(|payload, _| match payload {
            b"ok" => Ok(()),
            b"bad" => Err(TaskError::MalformedPayload("not bencode".to_owned())),
            _ => Err(TaskError::Transient("database busy".to_owned())),
        });
        let dispatcher = TaskDispatcher::new(pool(&broker)).register(TaskDefinition::new(
            "process_torrent",
            QueueDefinition::new("torrents").with_dlq(),
            Arc::new(handler),
        ));

        dispatcher
            .submit("process_torrent", &TaskId::new("a"), b"ok")
            .await
            .unwrap();
        dispatcher
            .submit("process_torrent", &TaskId::new("b"), b"bad")
            .await
            .unwrap();

        let worker = TaskWorker::new(&dispatcher, options());
        let state = worker.state().clone();
        let (stop, stopped) = oneshot::channel::<()>();
        let running = tokio::spawn(async move {
            worker
                .run(async move {
                    let _ = stopped.await;
                })
                .await
        });

        wait_until(|| state.total_count("process_torrent") == 2 && state.active_count() == 0)
            .await;
        let _ = stop.send(());
        running.await.unwrap().unwrap();

        assert_eq!(broker.queue_len("torrents"), 0);
        assert_eq!(broker.queue_len("torrents-dlq"), 1);
        assert_eq!(broker.unacked_count(), 0);
    }

    #[tokio::test]
    async fn unknown_and_revoked_tasks_never_reach_the_handler() {
        let broker = MemoryBroker::new();
        let mut handler = MockTaskHandler::new();
        handler.expect_handle().never();
        let dispatcher = TaskDispatcher::new(pool(&broker)).register(TaskDefinition::new(
            "process_torrent",
            QueueDefinition::new("torrents").with_dlq(),
            Arc::new(handler),
        ));
        let channel = {
            let conn = dispatcher.pool().acquire().await.unwrap();
            dispatcher.topology().install(&conn).await.unwrap();
            conn.default_channel().await.unwrap()
        };
        channel
            .basic_publish(
                "",
                "torrents",
                &crate::message::OutboundMessage {
                    body: b"x".to_vec(),
                    properties: crate::message::Properties::default()
                        .with_content_type("application/octet-stream")
                        .with_kind("resize_avatar")
                        .with_message_id("u-1"),
                },
            )
            .await
            .unwrap();
        dispatcher
            .submit("process_torrent", &TaskId::new("r-1"), b"x")
            .await
            .unwrap();

        let worker = TaskWorker::new(&dispatcher, options());
        worker.state().revoke(&TaskId::new("r-1"));

        let (stop, stopped) = oneshot::channel::<()>();
        let watcher = broker.clone();
        let stopper = tokio::spawn(async move {
            wait_until(|| watcher.queue_len("torrents") == 0 && watcher.unacked_count() == 0).await;
            let _ = stop.send(());
        });
        worker
            .run(async move {
                let _ = stopped.await;
            })
            .await
            .unwrap();
        stopper.await.unwrap();

        assert_eq!(broker.queue_len("torrents-dlq"), 1);
        assert_eq!(worker.state().total_count("process_torrent"), 0);
    }

    /// Never finishes once started.
    struct Stalled {
        started: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl crate::dispatcher::TaskHandler for Stalled {
        async fn handle(&self, _payload: &[u8], _task_id: &TaskId) -> Result<(), TaskError> {
            self.started.fetch_add(1, Ordering::SeqCst);
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn shutdown_is_not_blocked_by_busy_slots() {
        let broker = MemoryBroker::new();
        let started = Arc::new(AtomicUsize::new(0));
        let dispatcher = TaskDispatcher::new(pool(&broker)).register(TaskDefinition::new(
            "process_torrent",
            QueueDefinition::new("torrents"),
            Arc::new(Stalled {
                started: started.clone(),
            }),
        ));
        for id in ["a", "b"] {
            dispatcher
                .submit("process_torrent", &TaskId::new(id), b"x")
                .await
                .unwrap();
        }

        let worker = TaskWorker::new(
            &dispatcher,
            options()
                .concurrency(1)
                .shutdown_timeout(Duration::from_millis(100)),
        );
        let state = worker.state().clone();
        let (stop, stopped) = oneshot::channel::<()>();
        let running = tokio::spawn(async move {
            worker
                .run(async move {
                    let _ = stopped.await;
                })
                .await
        });

        wait_until(|| started.load(Ordering::SeqCst) == 1 && state.reserved_count() == 2).await;
        let _ = stop.send(());
        tokio::time::timeout(Duration::from_secs(1), running)
            .await
            .expect("worker ignored shutdown")
            .unwrap()
            .unwrap();

        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert!(!state.is_active(&TaskId::new("b")));
        assert_eq!(broker.queue_len("torrents"), 2);
        assert_eq!(broker.unacked_count(), 0);
    }

    #[tokio::test]
    async fn resizing_adjusts_slots_and_prefetch() {
        let control = WorkerControl::new(2, 4);
        let broker = MemoryBroker::new();
        let conn = Connection::connect(Arc::new(broker.clone()), RetryPolicy::new(Some(1)))
            .await
            .unwrap();
        let qos = Arc::new(Qos::new(conn.default_channel().await.unwrap(), 8));
        control.attach(Some(qos.clone()));

        assert_eq!(control.grow(2).await, 4);
        assert_eq!(qos.value().await, 16);
        assert_eq!(control.permits().available_permits(), 4);

        assert_eq!(control.shrink(10).await, 1);
        assert_eq!(qos.value().await, 4);
        tokio::task::yield_now().await;
        wait_until(|| control.permits().available_permits() == 1).await;

        qos.update().await.unwrap();
        assert_eq!(broker.qos_history().last(), Some(&4));
    }
}
