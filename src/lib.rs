// ABOUTME: Library entry point for the Portico OIDC authorization server
// ABOUTME: Authorization Code flow with PKCE, ACR-driven auth ladder, rotating RS256 keys
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Portico Project

#![deny(unsafe_code)]

//! # Portico
//!
//! An OpenID Connect authorization server. It issues identity and access
//! tokens to registered client applications on behalf of end users through
//! the Authorization Code flow with PKCE, driving a multi-step
//! authentication ladder (password, then optional TOTP) keyed by the
//! requested ACR level.
//!
//! ## Architecture
//!
//! - [`oauth2`]: the authorization core with request validation, the login
//!   state machine, code issuance, the three token grants, and token
//!   validation
//! - [`session`]: server-side session lifecycle with idle and absolute
//!   expiry
//! - [`jwks`]: signing-key lifecycle (previous/current/next) and JWKS
//!   publication
//! - [`database`]: the repository contract and its SQLite backend
//! - [`crypto`]: password hashing, TOTP, secure randomness, secret sealing
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use portico_server::config::ServerConfig;
//! use portico_server::errors::AppResult;
//!
//! fn main() -> AppResult<()> {
//!     let config = ServerConfig::from_env()?;
//!     println!("portico will listen on {}:{}", config.host, config.http_port);
//!     Ok(())
//! }
//! ```

/// Process-wide caches (settings)
pub mod cache;

/// Environment-driven configuration
pub mod config;

/// Request-scoped context threaded through handlers
pub mod context;

/// Cryptographic adapters: passwords, TOTP, randomness, secret sealing
pub mod crypto;

/// Repository contract and backends
pub mod database;

/// Error codes and the application error type
pub mod errors;

/// Signing-key lifecycle and JWKS publication
pub mod jwks;

/// Logging setup
pub mod logging;

/// Persisted domain entities
pub mod models;

/// The OAuth 2.0 / OIDC authorization core
pub mod oauth2;

/// User-session lifecycle
pub mod session;
