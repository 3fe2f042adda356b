// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Connections
//!
//! [`Connection`] is the logical broker session. It owns the transport
//! connection and its default channel, the set of topology entities already
//! declared on it and the registry of active consumers. When the transport
//! connection is lost, [`Connection::ensure`] reconnects with exponential
//! backoff, lets dependents replay their declarations through a [`Revive`]
//! hook and retries the failed operation.

use crate::{
    errors::AmqpError,
    message::Message,
    retry::RetryPolicy,
    serialization::Body,
    topology::DeclaredEntities,
    transport::{Transport, TransportChannel, TransportConnection},
};
use async_trait::async_trait;
use std::{
    collections::HashMap,
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tracing::{debug, error, warn};

/// Called before each retry with the error and the upcoming sleep.
pub type Errback<'a> = dyn Fn(&AmqpError, Duration) + Send + Sync + 'a;

/// Invoked for every decoded message delivered to a consumer.
pub type MessageCallback = Arc<dyn Fn(&Body, &Message) + Send + Sync>;

/// Logs the connection error and the upcoming retry interval.
pub fn default_errback(err: &AmqpError, interval: Duration) {
    error!(
        error = err.to_string(),
        "Connection error: {}. Retry in {:?}", err, interval
    );
}

/// Hook run after a connection has been re-established.
#[async_trait]
pub trait Revive: Send + Sync {
    async fn on_revive(
        &self,
        connection: &Connection,
        channel: Arc<dyn TransportChannel>,
    ) -> Result<(), AmqpError>;
}

/// Runs a cleanup future, swallowing recoverable connection errors.
pub async fn ignore_errors<T, F>(fut: F) -> Result<Option<T>, AmqpError>
where
    F: Future<Output = Result<T, AmqpError>>,
{
    match fut.await {
        Ok(value) => Ok(Some(value)),
        Err(err) if err.is_recoverable() => {
            debug!(error = err.to_string(), "ignoring connection error");
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

struct Live {
    conn: Arc<dyn TransportConnection>,
    default_channel: Arc<dyn TransportChannel>,
}

#[derive(Clone)]
pub(crate) struct ConsumerEntry {
    pub channel: Arc<dyn TransportChannel>,
    pub callbacks: Vec<MessageCallback>,
    pub no_ack: bool,
}

/// A logical broker session with recovery.
pub struct Connection {
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
    live: tokio::sync::Mutex<Option<Live>>,
    declared: DeclaredEntities,
    consumers: Mutex<HashMap<String, ConsumerEntry>>,
    alive: AtomicBool,
}

impl Connection {
    /// Creates a connection that connects lazily on first use.
    pub fn new(transport: Arc<dyn Transport>, policy: RetryPolicy) -> Connection {
        Connection {
            transport,
            policy,
            live: tokio::sync::Mutex::new(None),
            declared: DeclaredEntities::default(),
            consumers: Mutex::new(HashMap::new()),
            alive: AtomicBool::new(true),
        }
    }

    /// Creates a connection and establishes it with the retry policy.
    pub async fn connect(
        transport: Arc<dyn Transport>,
        policy: RetryPolicy,
    ) -> Result<Connection, AmqpError> {
        let connection = Connection::new(transport, policy);
        connection.ensure_connection(None).await?;
        Ok(connection)
    }

    pub fn endpoint(&self) -> String {
        self.transport.endpoint()
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Whether the transport connection is currently open.
    pub async fn is_connected(&self) -> bool {
        self.live
            .lock()
            .await
            .as_ref()
            .map(|live| live.conn.is_open())
            .unwrap_or(false)
    }

    /// `false` once recovery gave up on this connection.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_dead(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    pub(crate) fn declared(&self) -> &DeclaredEntities {
        &self.declared
    }

    /// Connects, retrying recoverable failures with backoff.
    pub async fn ensure_connection(
        &self,
        errback: Option<&Errback<'_>>,
    ) -> Result<(), AmqpError> {
        let mut attempt = 0;
        loop {
            match self.default_channel().await {
                Ok(_) => return Ok(()),
                Err(err) if !err.is_recoverable() => {
                    error!(error = err.to_string(), endpoint = self.endpoint(), "cannot connect");
                    return Err(err);
                }
                Err(err) => {
                    attempt += 1;
                    let interval = self.backoff(attempt, &err, errback)?;
                    tokio::time::sleep(interval).await;
                }
            }
        }
    }

    /// The connection's default channel, connecting first if needed.
    ///
    /// Replacing a closed transport connection forgets the declared entities
    /// and the registered consumers.
    pub async fn default_channel(&self) -> Result<Arc<dyn TransportChannel>, AmqpError> {
        let mut live = self.live.lock().await;
        if let Some(current) = live.as_ref() {
            if current.conn.is_open() {
                return Ok(current.default_channel.clone());
            }
        }

        let channel = self.replace(&mut live).await?;
        Ok(channel)
    }

    /// Opens an additional channel on the transport connection.
    pub async fn channel(&self) -> Result<Arc<dyn TransportChannel>, AmqpError> {
        self.default_channel().await?;
        let conn = self.transport_connection().await?;
        conn.create_channel().await
    }

    /// Drops the transport connection and opens a new one.
    pub async fn reconnect(&self) -> Result<Arc<dyn TransportChannel>, AmqpError> {
        let mut live = self.live.lock().await;
        self.replace(&mut live).await
    }

    /// Reconnects and runs the revive hook.
    pub async fn revive(&self, on_revive: Option<&dyn Revive>) -> Result<(), AmqpError> {
        let channel = self.reconnect().await?;
        debug!(endpoint = self.endpoint(), "connection revived");
        if let Some(hook) = on_revive {
            hook.on_revive(self, channel).await?;
        }
        Ok(())
    }

    pub async fn close(&self) -> Result<(), AmqpError> {
        let previous = self.live.lock().await.take();
        self.reset();
        match previous {
            Some(live) => live.conn.close().await,
            None => Ok(()),
        }
    }

    /// Runs `operation` on the default channel, reconnecting and retrying on
    /// recoverable errors.
    ///
    /// `errback` is called before every sleep; `on_revive` after every
    /// reconnect. Non-recoverable errors are returned immediately.
    pub async fn ensure<T, F, Fut>(
        &self,
        mut operation: F,
        errback: Option<&Errback<'_>>,
        on_revive: Option<&dyn Revive>,
    ) -> Result<T, AmqpError>
    where
        F: FnMut(Arc<dyn TransportChannel>) -> Fut + Send,
        Fut: Future<Output = Result<T, AmqpError>> + Send,
    {
        let mut attempt = 0;
        let mut needs_revive = false;

        loop {
            let result = if needs_revive {
                match self.revive(on_revive).await {
                    Ok(()) => match self.default_channel().await {
                        Ok(channel) => operation(channel).await,
                        Err(err) => Err(err),
                    },
                    Err(err) => Err(err),
                }
            } else {
                match self.default_channel().await {
                    Ok(channel) => operation(channel).await,
                    Err(err) => Err(err),
                }
            };

            match result {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_recoverable() => return Err(err),
                Err(err) => {
                    attempt += 1;
                    let interval = self.backoff(attempt, &err, errback)?;
                    tokio::time::sleep(interval).await;
                    needs_revive = true;
                }
            }
        }
    }

    /// Waits for the next delivery on any registered consumer.
    ///
    /// The body is decoded and handed to the consumer's callbacks before the
    /// message is returned. A body that cannot be decoded is rejected without
    /// requeue and its callbacks are skipped.
    pub async fn drain_events(&self, timeout: Option<Duration>) -> Result<Message, AmqpError> {
        let conn = self.transport_connection().await?;

        loop {
            let delivery = conn.drain_events(timeout).await?;
            let entry = self.consumer(&delivery.consumer_tag);

            let Some(entry) = entry else {
                warn!(
                    consumer_tag = delivery.consumer_tag,
                    "delivery for an unknown consumer"
                );
                continue;
            };

            let message = Message::new(delivery, entry.channel.clone(), entry.no_ack);
            match message.decode() {
                Ok(body) => {
                    for callback in &entry.callbacks {
                        callback(&body, &message);
                    }
                }
                Err(err) => {
                    error!(
                        error = err.to_string(),
                        routing_key = message.routing_key(),
                        "cannot decode message body"
                    );
                    if !entry.no_ack {
                        ignore_errors(message.reject()).await?;
                    }
                }
            }
            return Ok(message);
        }
    }

    pub(crate) fn register_consumer(&self, consumer_tag: &str, entry: ConsumerEntry) {
        if let Ok(mut consumers) = self.consumers.lock() {
            consumers.insert(consumer_tag.to_owned(), entry);
        }
    }

    pub(crate) fn deregister_consumer(&self, consumer_tag: &str) -> Option<ConsumerEntry> {
        self.consumers
            .lock()
            .ok()
            .and_then(|mut consumers| consumers.remove(consumer_tag))
    }

    pub(crate) fn consumer(&self, consumer_tag: &str) -> Option<ConsumerEntry> {
        self.consumers
            .lock()
            .ok()
            .and_then(|consumers| consumers.get(consumer_tag).cloned())
    }

    async fn transport_connection(&self) -> Result<Arc<dyn TransportConnection>, AmqpError> {
        self.live
            .lock()
            .await
            .as_ref()
            .map(|live| live.conn.clone())
            .ok_or(AmqpError::ConnectionClosed)
    }

    async fn replace(&self, live: &mut Option<Live>) -> Result<Arc<dyn TransportChannel>, AmqpError> {
        if let Some(previous) = live.take() {
            ignore_errors(previous.conn.close()).await.ok();
        }
        self.reset();

        debug!(endpoint = self.endpoint(), "opening broker connection");
        let conn = self.transport.connect().await?;
        let default_channel = conn.create_channel().await?;
        *live = Some(Live {
            conn,
            default_channel: default_channel.clone(),
        });
        Ok(default_channel)
    }

    fn reset(&self) {
        self.declared.clear();
        if let Ok(mut consumers) = self.consumers.lock() {
            consumers.clear();
        }
    }

    fn backoff(
        &self,
        attempt: u32,
        err: &AmqpError,
        errback: Option<&Errback<'_>>,
    ) -> Result<Duration, AmqpError> {
        match self.policy.interval(attempt) {
            Some(interval) => {
                match errback {
                    Some(callback) => callback(err, interval),
                    None => default_errback(err, interval),
                }
                Ok(interval)
            }
            None => {
                self.mark_dead();
                error!(
                    error = err.to_string(),
                    attempts = attempt,
                    "giving up on the broker connection"
                );
                Err(AmqpError::RetriesExhausted {
                    attempts: attempt,
                    reason: err.to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        message::{OutboundMessage, Properties},
        queue::QueueDefinition,
        transport::{memory::MemoryBroker, MockTransport},
    };
    use std::sync::atomic::AtomicUsize;

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(Some(max_retries))
            .interval_start(Duration::from_millis(1))
            .interval_max(Duration::from_millis(5))
    }

    struct CountRevives(AtomicUsize);

    #[async_trait]
    impl Revive for CountRevives {
        async fn on_revive(
            &self,
            _connection: &Connection,
            _channel: Arc<dyn TransportChannel>,
        ) -> Result<(), AmqpError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn ensure_revives_and_retries() {
        let broker = MemoryBroker::new();
        let conn = Connection::connect(Arc::new(broker.clone()), fast_policy(3))
            .await
            .unwrap();
        let revives = CountRevives(AtomicUsize::new(0));

        broker.fail_next_operations(1);
        conn.ensure(
            |channel| async move { channel.queue_declare(&QueueDefinition::new("jobs")).await },
            None,
            Some(&revives as &dyn Revive),
        )
        .await
        .unwrap();

        assert_eq!(revives.0.load(Ordering::SeqCst), 1);
        assert!(broker.has_queue("jobs"));
    }

    #[tokio::test]
    async fn ensure_gives_up_and_marks_the_connection_dead() {
        let broker = MemoryBroker::new();
        let conn = Connection::connect(Arc::new(broker.clone()), fast_policy(2))
            .await
            .unwrap();
        let errbacks = AtomicUsize::new(0);
        let errback = |_: &AmqpError, _: Duration| {
            errbacks.fetch_add(1, Ordering::SeqCst);
        };

        broker.fail_next_operations(10);
        let err = conn
            .ensure(
                |channel| async move { channel.basic_qos(1).await },
                Some(&errback as &Errback<'_>),
                None,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, AmqpError::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(errbacks.load(Ordering::SeqCst), 2);
        assert!(!conn.is_alive());
    }

    #[tokio::test]
    async fn authentication_errors_are_not_retried() {
        let mut transport = MockTransport::new();
        transport.expect_endpoint().returning(|| "mock://".to_owned());
        transport
            .expect_connect()
            .times(1)
            .returning(|| Err(AmqpError::AuthenticationError("guest".to_owned())));

        let err = Connection::connect(Arc::new(transport), fast_policy(5))
            .await
            .err()
            .unwrap();
        assert_eq!(err, AmqpError::AuthenticationError("guest".to_owned()));
    }

    #[tokio::test]
    async fn ensure_connection_outlasts_refusals() {
        let broker = MemoryBroker::new();
        broker.refuse_connections(2);

        let conn = Connection::new(Arc::new(broker.clone()), fast_policy(3));
        conn.ensure_connection(None).await.unwrap();
        assert!(conn.is_connected().await);
    }

    #[tokio::test]
    async fn undecodable_bodies_are_rejected() {
        let broker = MemoryBroker::new();
        let conn = Connection::connect(Arc::new(broker.clone()), fast_policy(1))
            .await
            .unwrap();
        let channel = conn.default_channel().await.unwrap();
        let queue = QueueDefinition::new("jobs").with_dlq();
        channel.queue_declare(&queue.dlq_definition().unwrap()).await.unwrap();
        channel.queue_declare(&queue).await.unwrap();

        let called = Arc::new(AtomicUsize::new(0));
        let counter = called.clone();
        let callback: MessageCallback = Arc::new(move |_: &Body, _: &Message| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        conn.register_consumer(
            "c1",
            ConsumerEntry {
                channel: channel.clone(),
                callbacks: vec![callback],
                no_ack: false,
            },
        );
        channel.basic_consume("jobs", "c1", false).await.unwrap();
        channel
            .basic_publish(
                "",
                "jobs",
                &OutboundMessage {
                    body: b"{broken".to_vec(),
                    properties: Properties::default().with_content_type("application/json"),
                },
            )
            .await
            .unwrap();

        let message = conn.drain_events(Some(Duration::from_secs(1))).await.unwrap();
        assert_eq!(message.state(), crate::message::AckState::Rejected);
        assert_eq!(called.load(Ordering::SeqCst), 0);
        assert_eq!(broker.queue_len("jobs-dlq"), 1);
    }
}
