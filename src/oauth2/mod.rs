// ABOUTME: OAuth 2.0 / OpenID Connect core: authorize pipeline and token pipeline
// ABOUTME: Request validation, login ladder, code issuance, grants, token validation, routes
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Portico Project

//! The authorization core.
//!
//! The authorize pipeline ([`authorize`], [`login`], [`code`]) turns a
//! validated request plus an authenticated session into a one-time
//! authorization code. The token pipeline ([`endpoints`], [`token`],
//! [`validation`]) exchanges codes and refresh tokens for signed JWTs and
//! validates them. [`routes`] wires both onto the HTTP surface.

pub mod authorize;
pub mod code;
pub mod endpoints;
pub mod login;
pub mod models;
pub mod routes;
pub mod token;
pub mod validation;
