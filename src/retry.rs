// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Exponential backoff used by connection recovery.

use serde::Deserialize;
use std::time::Duration;

/// Backoff policy for reconnect-and-retry.
///
/// The interval before retry `n` (1-based) is
/// `min(interval_start * interval_step^(n-1), interval_max)`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// `None` retries forever.
    pub max_retries: Option<u32>,
    #[serde(with = "millis")]
    pub interval_start: Duration,
    pub interval_step: u32,
    #[serde(with = "millis")]
    pub interval_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: Some(5),
            interval_start: Duration::from_secs(2),
            interval_step: 2,
            interval_max: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: Option<u32>) -> Self {
        RetryPolicy {
            max_retries,
            ..RetryPolicy::default()
        }
    }

    pub fn interval_start(mut self, interval: Duration) -> Self {
        self.interval_start = interval;
        self
    }

    pub fn interval_step(mut self, step: u32) -> Self {
        self.interval_step = step;
        self
    }

    pub fn interval_max(mut self, interval: Duration) -> Self {
        self.interval_max = interval;
        self
    }

    /// Sleep before retry `attempt`, or `None` once the policy gives up.
    pub fn interval(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 {
            return Some(Duration::ZERO);
        }
        if let Some(max) = self.max_retries {
            if attempt > max {
                return None;
            }
        }

        let factor = self.interval_step.checked_pow(attempt - 1).unwrap_or(u32::MAX);
        let interval = self
            .interval_start
            .checked_mul(factor)
            .unwrap_or(self.interval_max);
        Some(interval.min(self.interval_max))
    }
}

pub(crate) mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
