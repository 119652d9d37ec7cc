// ABOUTME: Request-scoped context threaded explicitly through handler call chains
// ABOUTME: Carries the session identifier and authenticated subject, never a context map
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Portico Project

use uuid::Uuid;

/// Per-request context assembled by the route layer from cookies and the
/// session store, then passed down the authorize/token call chains.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Opaque session identifier from the session cookie, when present
    pub session_identifier: Option<String>,
    /// Authenticated user, when the session resolved to a live row
    pub user_id: Option<Uuid>,
    /// Client IP, for session metadata and audit events
    pub ip_address: Option<String>,
    /// User agent, for session metadata
    pub user_agent: Option<String>,
}

impl RequestContext {
    /// Context for an anonymous request
    #[must_use]
    pub fn anonymous() -> Self {
        Self::default()
    }
}
