// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Installs the global `tracing` subscriber.

use crate::config::{LogConfig, LogFormat};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Filter built from `RUST_LOG`, or from the configured level when unset.
pub fn env_filter(cfg: &LogConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.level))
}

/// Initializes logging; later calls keep the first subscriber.
pub fn init(cfg: &LogConfig) {
    let layer = match cfg.format {
        LogFormat::Text => fmt::layer().with_target(true).boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_target(true)
            .boxed(),
    };

    let installed = tracing_subscriber::registry()
        .with(layer.with_filter(env_filter(cfg)))
        .try_init();

    if installed.is_ok() {
        tracing::debug!(format = ?cfg.format, "logging initialized");
    }
}
