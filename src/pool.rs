// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Pool
//!
//! A bounded set of [`Connection`]s to one broker. [`ConnectionPool::acquire`]
//! hands out a [`PooledConnection`] guard that returns the connection when
//! dropped; connections that gave up recovering are destroyed instead.

use crate::{
    connection::{Connection, Errback, Revive},
    errors::AmqpError,
    retry::RetryPolicy,
    transport::{Transport, TransportChannel},
};
use std::{
    future::Future,
    ops::Deref,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

struct PoolInner {
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
    idle: Mutex<Vec<Arc<Connection>>>,
    permits: Arc<Semaphore>,
    acquire_timeout: Duration,
}

/// Bounded pool of broker connections. Clones share the same pool.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(
        transport: Arc<dyn Transport>,
        policy: RetryPolicy,
        limit: usize,
        acquire_timeout: Duration,
    ) -> ConnectionPool {
        ConnectionPool {
            inner: Arc::new(PoolInner {
                transport,
                policy,
                idle: Mutex::new(Vec::new()),
                permits: Arc::new(Semaphore::new(limit.max(1))),
                acquire_timeout,
            }),
        }
    }

    pub fn endpoint(&self) -> String {
        self.inner.transport.endpoint()
    }

    /// Connections that can be acquired right now without waiting.
    pub fn available(&self) -> usize {
        self.inner.permits.available_permits()
    }

    /// Takes a connection, waiting up to the acquire timeout for one to be
    /// released.
    ///
    /// The connection is established lazily by its first operation.
    pub async fn acquire(&self) -> Result<PooledConnection, AmqpError> {
        let permit = tokio::time::timeout(
            self.inner.acquire_timeout,
            self.inner.permits.clone().acquire_owned(),
        )
        .await
        .map_err(|_| {
            warn!(endpoint = self.endpoint(), "no pooled connection available");
            AmqpError::PoolTimeout
        })?
        .map_err(|_| AmqpError::InternalError("connection pool closed".to_owned()))?;

        let reused = self
            .inner
            .idle
            .lock()
            .ok()
            .and_then(|mut idle| idle.pop());
        let connection = match reused {
            Some(connection) => connection,
            None => {
                debug!(endpoint = self.endpoint(), "new pooled connection");
                Arc::new(Connection::new(
                    self.inner.transport.clone(),
                    self.inner.policy.clone(),
                ))
            }
        };

        Ok(PooledConnection {
            connection,
            pool: self.inner.clone(),
            discard: false,
            _permit: permit,
        })
    }

    /// Acquires a connection and runs `operation` through
    /// [`Connection::ensure`].
    pub async fn ensure<T, F, Fut>(
        &self,
        operation: F,
        errback: Option<&Errback<'_>>,
        on_revive: Option<&dyn Revive>,
    ) -> Result<T, AmqpError>
    where
        F: FnMut(Arc<dyn TransportChannel>) -> Fut + Send,
        Fut: Future<Output = Result<T, AmqpError>> + Send,
    {
        let conn = self.acquire().await?;
        conn.ensure(operation, errback, on_revive).await
    }
}

/// A connection on loan from a [`ConnectionPool`].
pub struct PooledConnection {
    connection: Arc<Connection>,
    pool: Arc<PoolInner>,
    discard: bool,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    /// Destroys the connection instead of returning it to the pool.
    pub fn discard(mut self) {
        self.discard = true;
    }

    pub fn connection(&self) -> Arc<Connection> {
        self.connection.clone()
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.connection
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let connection = self.connection.clone();

        if self.discard || !connection.is_alive() {
            debug!(endpoint = connection.endpoint(), "destroying pooled connection");
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    let _ = connection.close().await;
                });
            }
            return;
        }

        if let Ok(mut idle) = self.pool.idle.lock() {
            idle.push(connection);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{queue::QueueDefinition, transport::memory::MemoryBroker};

    fn pool(broker: &MemoryBroker, limit: usize) -> ConnectionPool {
        ConnectionPool::new(
            Arc::new(broker.clone()),
            RetryPolicy::new(Some(2))
                .interval_start(Duration::from_millis(1))
                .interval_max(Duration::from_millis(2)),
            limit,
            Duration::from_millis(30),
        )
    }

    #[tokio::test]
    async fn acquire_waits_then_times_out() {
        let broker = MemoryBroker::new();
        let pool = pool(&broker, 1);

        let held = pool.acquire().await.unwrap();
        assert_eq!(pool.acquire().await.err(), Some(AmqpError::PoolTimeout));

        drop(held);
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn released_connections_are_reused() {
        let broker = MemoryBroker::new();
        let pool = pool(&broker, 2);

        let first = pool.acquire().await.unwrap();
        first.default_channel().await.unwrap();
        let identity = Arc::as_ptr(&first.connection());
        drop(first);

        let second = pool.acquire().await.unwrap();
        assert_eq!(Arc::as_ptr(&second.connection()), identity);
        assert_eq!(broker.connection_count(), 1);
    }

    #[tokio::test]
    async fn dead_connections_are_not_returned() {
        let broker = MemoryBroker::new();
        let pool = pool(&broker, 1);

        broker.fail_next_operations(10);
        let err = pool
            .ensure(
                |channel| async move { channel.queue_declare(&QueueDefinition::new("q")).await },
                None,
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AmqpError::RetriesExhausted { .. }));

        let fresh = pool.acquire().await.unwrap();
        assert!(fresh.is_alive());
    }

    #[tokio::test]
    async fn ensure_retries_through_a_disconnect() {
        let broker = MemoryBroker::new();
        let pool = pool(&broker, 1);

        broker.fail_next_operations(1);
        pool.ensure(
            |channel| async move { channel.queue_declare(&QueueDefinition::new("q")).await },
            None,
            None,
        )
        .await
        .unwrap();
        assert!(broker.has_queue("q"));
    }
}
