// ABOUTME: Configuration modules for deployment-specific settings
// ABOUTME: Environment-variable driven, with warn-and-default behavior
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Portico Project

pub mod environment;

pub use environment::ServerConfig;
