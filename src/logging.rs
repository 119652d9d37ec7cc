// ABOUTME: Logging configuration and structured logging setup
// ABOUTME: Env-driven level with pretty output for development and JSON for production
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Portico Project

//! Logging initialization built on `tracing-subscriber`.
//!
//! Audit events are ordinary `tracing` events with `target: "audit"`, so
//! they can be filtered or shipped independently of operational logs.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::errors::{AppError, AppResult};

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Emit JSON lines instead of the pretty format
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            json: false,
        }
    }
}

/// Initialize the global subscriber.
///
/// `RUST_LOG` overrides the configured level when set.
///
/// # Errors
/// Returns an error if a subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> AppResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));

    let registry = tracing_subscriber::registry().with(filter);
    let result = if config.json {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer()).try_init()
    };

    result.map_err(|e| AppError::config(format!("unable to install tracing subscriber: {e}")))
}
