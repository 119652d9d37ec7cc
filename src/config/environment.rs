// ABOUTME: Environment configuration management for deployment-specific settings
// ABOUTME: Reads ISSUER, BASE_URL, DATABASE_URL, admin seed credentials, and token lifetimes
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Portico Project

//! Environment-based configuration.
//!
//! Every recognised variable has a development default; production
//! deployments are expected to set at least `ISSUER`, `BASE_URL`,
//! `DATABASE_URL`, `ADMIN_EMAIL`, and `ADMIN_PASSWORD` (the last two are
//! seed-only and ignored after first boot).

use std::env;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::{AppError, AppResult};

/// Server configuration loaded from the environment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen port
    pub http_port: u16,
    /// HTTP listen host
    pub host: String,
    /// Public base URL of this server
    pub base_url: String,
    /// Token issuer (`iss` claim); defaults to the base URL
    pub issuer: String,
    /// Database connection string
    pub database_url: String,
    /// Seed-only admin email
    pub admin_email: Option<String>,
    /// Seed-only admin password
    pub admin_password: Option<String>,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Emit JSON logs instead of the pretty format
    pub log_json: bool,
    /// Access-token lifetime in seconds (seed value)
    pub access_token_seconds: i64,
    /// Refresh-token lifetime in seconds (seed value)
    pub refresh_token_seconds: i64,
    /// Authorization-code lifetime in seconds (seed value)
    pub auth_code_seconds: i64,
    /// Session idle timeout in seconds (seed value)
    pub session_idle_seconds: i64,
    /// Session absolute lifetime in seconds (seed value)
    pub session_max_seconds: i64,
}

fn env_string(name: &str, default: &str) -> String {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => value,
        _ => default.to_owned(),
    }
}

fn env_optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

fn env_i64(name: &str, default: i64) -> AppResult<i64> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => value.trim().parse::<i64>().map_err(|_| {
            AppError::config(format!("{name} must be an integer, got '{value}'"))
        }),
        _ => Ok(default),
    }
}

impl ServerConfig {
    /// Load configuration from the environment.
    ///
    /// # Errors
    /// Returns an error if a numeric variable fails to parse or a lifetime
    /// is non-positive.
    pub fn from_env() -> AppResult<Self> {
        let http_port = match env::var("HTTP_PORT") {
            Ok(value) if !value.trim().is_empty() => value.trim().parse::<u16>().map_err(|_| {
                AppError::config(format!("HTTP_PORT must be a port number, got '{value}'"))
            })?,
            _ => 8080,
        };

        let base_url = env_string("BASE_URL", &format!("http://localhost:{http_port}"));
        let issuer = env_string("ISSUER", &base_url);

        if env_optional("ADMIN_EMAIL").is_none() {
            warn!("ADMIN_EMAIL is not set; the seed will fall back to a default");
        }

        let config = Self {
            http_port,
            host: env_string("HOST", "127.0.0.1"),
            base_url,
            issuer,
            database_url: env_string("DATABASE_URL", "sqlite:portico.db"),
            admin_email: env_optional("ADMIN_EMAIL"),
            admin_password: env_optional("ADMIN_PASSWORD"),
            log_level: env_string("LOG_LEVEL", "info"),
            log_json: env_string("LOG_FORMAT", "pretty") == "json",
            access_token_seconds: env_i64("ACCESS_TOKEN_SECONDS", 300)?,
            refresh_token_seconds: env_i64("REFRESH_TOKEN_SECONDS", 30 * 24 * 3600)?,
            auth_code_seconds: env_i64("AUTH_CODE_SECONDS", 60)?,
            session_idle_seconds: env_i64("SESSION_IDLE_SECONDS", 1800)?,
            session_max_seconds: env_i64("SESSION_MAX_SECONDS", 86400)?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> AppResult<()> {
        for (name, value) in [
            ("ACCESS_TOKEN_SECONDS", self.access_token_seconds),
            ("REFRESH_TOKEN_SECONDS", self.refresh_token_seconds),
            ("AUTH_CODE_SECONDS", self.auth_code_seconds),
            ("SESSION_IDLE_SECONDS", self.session_idle_seconds),
            ("SESSION_MAX_SECONDS", self.session_max_seconds),
        ] {
            if value <= 0 {
                return Err(AppError::config(format!("{name} must be positive")));
            }
        }
        if self.session_idle_seconds > self.session_max_seconds {
            return Err(AppError::config(
                "SESSION_IDLE_SECONDS must not exceed SESSION_MAX_SECONDS",
            ));
        }
        Ok(())
    }
}
