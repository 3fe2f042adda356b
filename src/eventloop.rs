// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Event Loop
//!
//! Streams over the events drained from a [`Connection`].
//!
//! [`eventloop`] yields every delivered message. [`drain_consumer`] and
//! [`itermessages`] run a consumer for the lifetime of the stream and yield
//! the decoded `(Body, Message)` pairs its callbacks receive.

use crate::{
    connection::{Connection, MessageCallback},
    consumer::{Consumer, ConsumerScope},
    errors::AmqpError,
    message::Message,
    queue::QueueDefinition,
    serialization::Body,
};
use futures_util::{stream, Stream, StreamExt};
use std::{
    collections::VecDeque,
    pin::Pin,
    sync::{Arc, Mutex},
    time::Duration,
};
use tracing::debug;

/// Bounds of an event loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventLoopOptions {
    /// Number of drain iterations; unbounded when `None`.
    pub limit: Option<usize>,
    /// Maximum wait for each drain.
    pub timeout: Option<Duration>,
    /// Keep looping when a drain times out instead of ending with an error.
    pub ignore_timeouts: bool,
}

impl EventLoopOptions {
    pub fn new() -> EventLoopOptions {
        EventLoopOptions::default()
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn ignore_timeouts(mut self, ignore: bool) -> Self {
        self.ignore_timeouts = ignore;
        self
    }
}

/// Drains events from `connection`, one stream item per delivered message.
///
/// `limit` counts drain iterations, including the ones that timed out. A
/// timeout ends the stream with [`AmqpError::Timeout`] unless
/// `ignore_timeouts` is set. Socket errors are skipped. Any other error,
/// including [`AmqpError::ConnectionClosed`], is yielded and ends the
/// stream.
pub fn eventloop<'c>(
    connection: &'c Connection,
    options: EventLoopOptions,
) -> impl Stream<Item = Result<Message, AmqpError>> + Send + 'c {
    stream::unfold(Some(0usize), move |state| async move {
        let mut iteration = state?;

        loop {
            if options.limit.is_some_and(|limit| iteration >= limit) {
                return None;
            }
            iteration += 1;

            match connection.drain_events(options.timeout).await {
                Ok(message) => return Some((Ok(message), Some(iteration))),
                Err(AmqpError::Timeout) if options.ignore_timeouts => continue,
                Err(err) if err.is_socket_error() => {
                    debug!(error = err.to_string(), "ignoring socket error");
                    continue;
                }
                Err(err) => return Some((Err(err), None)),
            }
        }
    })
}

type Accumulator = Arc<Mutex<VecDeque<(Body, Message)>>>;

struct DrainState<'c> {
    events: Pin<Box<dyn Stream<Item = Result<Message, AmqpError>> + Send + 'c>>,
    scope: Option<ConsumerScope<'c>>,
    accumulated: Accumulator,
}

impl DrainState<'_> {
    fn next_accumulated(&self) -> Option<(Body, Message)> {
        self.accumulated
            .lock()
            .ok()
            .and_then(|mut accumulated| accumulated.pop_front())
    }

    async fn close(&mut self) {
        if let Some(scope) = self.scope.take() {
            if let Err(err) = scope.cancel().await {
                debug!(error = err.to_string(), "failure cancelling consumer");
            }
        }
    }
}

/// Runs `consumer` for the lifetime of the stream, yielding each decoded
/// message its callbacks receive.
///
/// Timeouts never end the stream. The consumer is cancelled when the event
/// loop finishes, and on drop if the caller stops early.
pub fn drain_consumer<'c>(
    consumer: Consumer,
    connection: &'c Connection,
    options: EventLoopOptions,
    callbacks: Vec<MessageCallback>,
) -> impl Stream<Item = Result<(Body, Message), AmqpError>> + Send + 'c {
    let accumulated: Accumulator = Arc::new(Mutex::new(VecDeque::new()));
    let sink = accumulated.clone();

    let mut consumer = consumer;
    for callback in callbacks {
        consumer = consumer.callback(callback);
    }
    let consumer = consumer.on_message(move |body: &Body, message: &Message| {
        if let Ok(mut sink) = sink.lock() {
            sink.push_back((body.clone(), message.clone()));
        }
    });

    let options = options.ignore_timeouts(true);

    stream::once(async move {
        match consumer.consume(connection).await {
            Ok(scope) => Ok(DrainState {
                events: Box::pin(eventloop(connection, options)),
                scope: Some(scope),
                accumulated,
            }),
            Err(err) => Err(err),
        }
    })
    .flat_map(|started| match started {
        Ok(state) => drain(state).left_stream(),
        Err(err) => stream::once(async move { Err(err) }).right_stream(),
    })
}

fn drain(
    state: DrainState<'_>,
) -> impl Stream<Item = Result<(Body, Message), AmqpError>> + Send + '_ {
    stream::unfold(Some(state), |state| async move {
        let mut state = state?;

        loop {
            if let Some(item) = state.next_accumulated() {
                return Some((Ok(item), Some(state)));
            }

            match state.events.next().await {
                Some(Ok(_)) => continue,
                Some(Err(err)) => {
                    state.close().await;
                    return Some((Err(err), None));
                }
                None => {
                    state.close().await;
                    return None;
                }
            }
        }
    })
}

/// [`drain_consumer`] over a new consumer of a single queue.
pub fn itermessages<'c>(
    connection: &'c Connection,
    queue: &QueueDefinition,
    no_ack: bool,
    options: EventLoopOptions,
    callbacks: Vec<MessageCallback>,
) -> impl Stream<Item = Result<(Body, Message), AmqpError>> + Send + 'c {
    let consumer = Consumer::new(vec![queue.clone()]).no_ack(no_ack);
    drain_consumer(consumer, connection, options, callbacks)
}
