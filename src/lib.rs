// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # tracker-mq
//!
//! Message-queue core of the torrent tracker: reliable task dispatch over
//! AMQP with connection recovery, prefetch-based flow control, idempotent
//! topology declaration and request/reply correlation.
//!
//! A [`TaskDispatcher`](dispatcher::TaskDispatcher) publishes tasks through a
//! [`ConnectionPool`](pool::ConnectionPool); a
//! [`TaskWorker`](worker::TaskWorker) consumes and executes them.

mod otel;

pub mod config;
pub mod connection;
pub mod consumer;
pub mod dispatcher;
pub mod errors;
pub mod eventloop;
pub mod exchange;
pub mod logging;
pub mod message;
pub mod pool;
pub mod publisher;
pub mod qos;
pub mod queue;
pub mod retry;
pub mod rpc;
pub mod serialization;
pub mod state;
pub mod topology;
pub mod torrent;
pub mod transport;
pub mod worker;

pub use otel::new_span;
