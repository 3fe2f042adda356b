// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Quality of Service
//!
//! Prefetch-count controller with eventual updates. Producers of concurrency
//! changes call [`Qos::increment_eventually`] or [`Qos::decrement_eventually`]
//! from anywhere; a single consume loop calls [`Qos::update`] to push the
//! value to the broker, so bursts of changes cost one `basic.qos` round-trip.

use crate::{errors::AmqpError, transport::TransportChannel};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Largest prefetch count AMQP can express.
pub const PREFETCH_COUNT_MAX: u32 = 0xFFFF;

struct QosState {
    channel: Arc<dyn TransportChannel>,
    value: u32,
    prev: Option<u32>,
}

/// Thread-safe prefetch count of one channel.
///
/// A value of 0 means flow control is disabled.
pub struct Qos {
    state: Mutex<QosState>,
}

impl Qos {
    pub fn new(channel: Arc<dyn TransportChannel>, initial_value: u32) -> Qos {
        Qos {
            state: Mutex::new(QosState {
                channel,
                value: initial_value,
                prev: None,
            }),
        }
    }

    pub async fn value(&self) -> u32 {
        self.state.lock().await.value
    }

    /// Raises the in-memory value; applied on the next [`Qos::update`].
    ///
    /// No-op while flow control is disabled.
    pub async fn increment_eventually(&self, n: u32) -> u32 {
        let mut state = self.state.lock().await;
        if state.value > 0 {
            state.value = state.value.saturating_add(n);
        }
        state.value
    }

    /// Lowers the in-memory value, never below 1.
    ///
    /// No-op while flow control is disabled.
    pub async fn decrement_eventually(&self, n: u32) -> u32 {
        let mut state = self.state.lock().await;
        if state.value > 0 {
            state.value = state.value.saturating_sub(n).max(1);
        }
        state.value
    }

    /// Applies `pcount` to the channel if it differs from the last request.
    pub async fn set(&self, pcount: u32) -> Result<u32, AmqpError> {
        let mut state = self.state.lock().await;
        Qos::apply(&mut state, pcount).await
    }

    /// Applies the current in-memory value.
    pub async fn update(&self) -> Result<u32, AmqpError> {
        let mut state = self.state.lock().await;
        let value = state.value;
        Qos::apply(&mut state, value).await
    }

    /// Moves the controller to a new channel after reconnection.
    ///
    /// The next [`Qos::update`] re-applies the value.
    pub async fn rebind(&self, channel: Arc<dyn TransportChannel>) {
        let mut state = self.state.lock().await;
        state.channel = channel;
        state.prev = None;
    }

    async fn apply(state: &mut QosState, pcount: u32) -> Result<u32, AmqpError> {
        if state.prev == Some(pcount) {
            return Ok(pcount);
        }

        let new_value = match u16::try_from(pcount) {
            Ok(value) => value,
            Err(_) => {
                warn!(
                    prefetch_count = pcount,
                    "QoS: Disabled: prefetch_count exceeds {}", PREFETCH_COUNT_MAX
                );
                0
            }
        };
        debug!("basic.qos: prefetch_count->{}", new_value);

        state.channel.basic_qos(new_value).await?;
        state.prev = Some(pcount);
        Ok(pcount)
    }
}
