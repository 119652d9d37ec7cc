// ABOUTME: Server-side session lifecycle: creation, extension, expiry, termination
// ABOUTME: Sessions accumulate auth methods and ACR; logout revokes session-issued refresh tokens
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Portico Project

//! # Session Manager
//!
//! A session is created at the first successful authentication step and
//! extended by later steps. The cookie only ever holds the opaque
//! identifier; this module owns the canonical server-side row.

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};
use uuid::Uuid;

use crate::context::RequestContext;
use crate::crypto;
use crate::database::{Database, DatabaseProvider};
use crate::errors::AppResult;
use crate::models::{
    acr_for_methods, join_auth_methods, AuthMethod, Settings, UserSession,
};

/// Minimum interval between persisted `last_accessed_at` updates.
///
/// Authorized routes touch the session at most once per second to avoid
/// write amplification; races on the timestamp are benign (last writer wins).
const TOUCH_INTERVAL_SECONDS: i64 = 1;

/// Liveness of a session at a given instant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Within both idle and absolute windows
    Active,
    /// `last_accessed_at` plus the idle timeout has passed
    IdleExpired,
    /// `started_at` plus the absolute maximum has passed
    AbsoluteExpired,
}

/// Creates, extends, and terminates user sessions
#[derive(Clone)]
pub struct SessionManager {
    db: Database,
}

impl SessionManager {
    /// Create a new session manager
    #[must_use]
    pub const fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a session after the first successful authentication step
    ///
    /// # Errors
    /// Returns an error if the identifier cannot be generated or the row
    /// cannot be written.
    pub async fn create_session(
        &self,
        user_id: Uuid,
        method: AuthMethod,
        ctx: &RequestContext,
    ) -> AppResult<UserSession> {
        let now = Utc::now();
        let methods = vec![method];
        let session = UserSession {
            id: Uuid::new_v4(),
            session_identifier: crypto::generate_session_identifier()?,
            user_id,
            started_at: now,
            last_accessed_at: now,
            acr_level: acr_for_methods(&methods),
            auth_methods: join_auth_methods(&methods),
            ip_address: ctx.ip_address.clone(),
            user_agent: ctx.user_agent.clone(),
        };
        self.db.create_user_session(&session).await?;

        info!(
            target: "audit",
            event = "user_session_created",
            user_id = %user_id,
            session_id = %session.id,
            "user session created"
        );
        Ok(session)
    }

    /// Record a completed authentication step on an existing session.
    ///
    /// Appends the method to the ordered set (idempotently) and raises the
    /// session ACR to the minimum level the accumulated methods satisfy.
    ///
    /// # Errors
    /// Returns an error if the update cannot be written.
    pub async fn record_auth_method(
        &self,
        session: &mut UserSession,
        method: AuthMethod,
    ) -> AppResult<()> {
        let mut methods = session.methods();
        if !methods.contains(&method) {
            methods.push(method);
        }
        session.auth_methods = join_auth_methods(&methods);
        session.acr_level = acr_for_methods(&methods);
        session.last_accessed_at = Utc::now();
        self.db.update_user_session(session).await?;
        Ok(())
    }

    /// Liveness of a session under the given settings
    #[must_use]
    pub fn status(
        session: &UserSession,
        settings: &Settings,
        now: DateTime<Utc>,
    ) -> SessionStatus {
        if now - session.started_at > Duration::seconds(settings.session_max_seconds) {
            SessionStatus::AbsoluteExpired
        } else if now - session.last_accessed_at
            > Duration::seconds(settings.session_idle_seconds)
        {
            SessionStatus::IdleExpired
        } else {
            SessionStatus::Active
        }
    }

    /// Resolve a session identifier to a live session.
    ///
    /// Expired sessions are terminated on sight: their refresh tokens are
    /// revoked and the row is deleted. `None` is returned so the caller
    /// re-authenticates.
    ///
    /// # Errors
    /// Returns an error if the store is unreachable.
    pub async fn resolve(
        &self,
        session_identifier: &str,
        settings: &Settings,
    ) -> AppResult<Option<UserSession>> {
        let Some(session) = self.db.get_user_session(session_identifier).await? else {
            return Ok(None);
        };

        match Self::status(&session, settings, Utc::now()) {
            SessionStatus::Active => Ok(Some(session)),
            status @ (SessionStatus::IdleExpired | SessionStatus::AbsoluteExpired) => {
                debug!(session_id = %session.id, ?status, "session expired, terminating");
                self.terminate(session_identifier).await?;
                Ok(None)
            }
        }
    }

    /// Extend a session's idle window.
    ///
    /// Persists at most once per second; closer calls are dropped.
    ///
    /// # Errors
    /// Returns an error if the update cannot be written.
    pub async fn touch(&self, session: &mut UserSession) -> AppResult<()> {
        let now = Utc::now();
        if now - session.last_accessed_at < Duration::seconds(TOUCH_INTERVAL_SECONDS) {
            return Ok(());
        }
        session.last_accessed_at = now;
        self.db.update_user_session(session).await?;
        Ok(())
    }

    /// Terminate a session: delete the row and revoke every refresh token
    /// issued under it.
    ///
    /// # Errors
    /// Returns an error if either write fails.
    pub async fn terminate(&self, session_identifier: &str) -> AppResult<()> {
        let session = self.db.get_user_session(session_identifier).await?;

        let revoked = self
            .db
            .revoke_session_refresh_tokens(session_identifier)
            .await?;
        self.db.delete_user_session(session_identifier).await?;

        if let Some(session) = session {
            info!(
                target: "audit",
                event = "user_session_deleted",
                user_id = %session.user_id,
                session_id = %session.id,
                revoked_refresh_tokens = revoked,
                "user session terminated"
            );
        }
        Ok(())
    }

    /// List a user's sessions, for the account sessions page
    ///
    /// # Errors
    /// Returns an error if the store is unreachable.
    pub async fn sessions_for_user(&self, user_id: Uuid) -> AppResult<Vec<UserSession>> {
        Ok(self.db.get_user_sessions_by_user(user_id).await?)
    }
}
