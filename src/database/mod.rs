// ABOUTME: Persistence contract for the authorization core
// ABOUTME: Trait-based abstraction so the core never depends on a storage technology
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Portico Project

//! Repository contract.
//!
//! The core depends on [`DatabaseProvider`], never on SQL. Every lookup
//! returns `Result<Option<T>>` so callers can distinguish missing from
//! failed. Mutations that must be race-free (code consumption, refresh-token
//! rotation, key promotion) are expressed as single conditional operations
//! here and implemented atomically by the backend.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{
    AuthCode, AuthContext, Client, KeyPair, Permission, RefreshToken, Resource, Settings, User,
    UserConsent, UserSession,
};

pub mod factory;
pub mod seed;
pub mod sqlite;

pub use factory::Database;

/// Core database abstraction trait
///
/// All backends implement this trait to provide a consistent interface to
/// the authorization core.
#[async_trait]
pub trait DatabaseProvider: Send + Sync + Clone {
    /// Run schema migrations
    async fn migrate(&self) -> Result<()>;

    // ================================
    // Users
    // ================================

    /// Create a user, including its direct permission links
    async fn create_user(&self, user: &User) -> Result<()>;

    /// Get user by primary key
    async fn get_user(&self, user_id: Uuid) -> Result<Option<User>>;

    /// Get user by email address
    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>>;

    /// Get user by OIDC subject
    async fn get_user_by_subject(&self, subject: Uuid) -> Result<Option<User>>;

    /// Update mutable user fields (password, OTP, profile, enabled)
    async fn update_user(&self, user: &User) -> Result<()>;

    // ================================
    // Clients
    // ================================

    /// Create a client, including redirect URIs and permission links
    async fn create_client(&self, client: &Client) -> Result<()>;

    /// Get client by primary key, with redirect URIs and permissions loaded
    async fn get_client(&self, client_id: Uuid) -> Result<Option<Client>>;

    /// Get client by its public identifier, fully loaded
    async fn get_client_by_identifier(&self, client_identifier: &str) -> Result<Option<Client>>;

    // ================================
    // Resources & Permissions
    // ================================

    /// Create a protected resource
    async fn create_resource(&self, resource: &Resource) -> Result<()>;

    /// Create a permission under a resource
    async fn create_permission(&self, permission: &Permission) -> Result<()>;

    /// Resolve a `resource:permission` scope token to a permission
    async fn get_permission_by_identifiers(
        &self,
        resource_identifier: &str,
        permission_identifier: &str,
    ) -> Result<Option<Permission>>;

    /// Grant a permission directly to a user
    async fn add_permission_to_user(&self, user_id: Uuid, permission_id: Uuid) -> Result<()>;

    /// Grant a permission to a client (client-credentials audience)
    async fn add_permission_to_client(&self, client_id: Uuid, permission_id: Uuid) -> Result<()>;

    // ================================
    // Authorization codes
    // ================================

    /// Persist a new authorization code (hash only)
    async fn create_auth_code(&self, code: &AuthCode) -> Result<()>;

    /// Atomically consume a code by hash: returns the row and marks it used
    /// in one conditional operation. `None` when the code is unknown or was
    /// already consumed; only the caller observing `Some` may mint tokens.
    async fn consume_auth_code(&self, code_hash: &str) -> Result<Option<AuthCode>>;

    /// Get a code row by hash regardless of state, for replay auditing
    async fn get_auth_code_by_hash(&self, code_hash: &str) -> Result<Option<AuthCode>>;

    /// Delete expired codes; returns how many were removed
    async fn purge_expired_auth_codes(&self, now: DateTime<Utc>) -> Result<u64>;

    // ================================
    // User sessions
    // ================================

    /// Create a session row
    async fn create_user_session(&self, session: &UserSession) -> Result<()>;

    /// Get a session by its opaque identifier
    async fn get_user_session(&self, session_identifier: &str) -> Result<Option<UserSession>>;

    /// List a user's sessions
    async fn get_user_sessions_by_user(&self, user_id: Uuid) -> Result<Vec<UserSession>>;

    /// Update a session (last-accessed, ACR, auth methods)
    async fn update_user_session(&self, session: &UserSession) -> Result<()>;

    /// Delete a session by its opaque identifier
    async fn delete_user_session(&self, session_identifier: &str) -> Result<()>;

    // ================================
    // Consents
    // ================================

    /// Get the consent a user granted to a client, if any
    async fn get_user_consent(&self, user_id: Uuid, client_id: Uuid)
        -> Result<Option<UserConsent>>;

    /// List all consents granted by a user
    async fn get_user_consents(&self, user_id: Uuid) -> Result<Vec<UserConsent>>;

    /// Insert or replace the consent for a (user, client) pair
    async fn save_user_consent(&self, consent: &UserConsent) -> Result<()>;

    /// Revoke the consent for a (user, client) pair
    async fn delete_user_consent(&self, user_id: Uuid, client_id: Uuid) -> Result<()>;

    // ================================
    // Refresh tokens
    // ================================

    /// Persist a refresh token (hash only)
    async fn create_refresh_token(&self, token: &RefreshToken) -> Result<()>;

    /// Get a refresh token row by token hash, regardless of state
    async fn get_refresh_token_by_hash(&self, token_hash: &str) -> Result<Option<RefreshToken>>;

    /// Atomically consume a refresh token for rotation: returns the row and
    /// marks it revoked in one conditional operation. `None` when unknown,
    /// already revoked, or owned by a different client.
    async fn consume_refresh_token(
        &self,
        token_hash: &str,
        client_id: Uuid,
    ) -> Result<Option<RefreshToken>>;

    /// Revoke every refresh token issued under a session; returns the count
    async fn revoke_session_refresh_tokens(&self, session_identifier: &str) -> Result<u64>;

    // ================================
    // Key pairs
    // ================================

    /// List all persisted key pairs
    async fn get_key_pairs(&self) -> Result<Vec<KeyPair>>;

    /// Persist a key pair
    async fn create_key_pair(&self, key_pair: &KeyPair) -> Result<()>;

    /// Atomic rotation: demote `current` to `previous`, promote `next` to
    /// `current`, insert the new `next`, all or nothing. Fails when the
    /// named rows are no longer in the expected states (concurrent rotation).
    async fn rotate_key_pairs(
        &self,
        demote_kid: &str,
        promote_kid: &str,
        new_next: &KeyPair,
    ) -> Result<()>;

    // ================================
    // Settings
    // ================================

    /// Get the settings singleton; `None` only before first seed
    async fn get_settings(&self) -> Result<Option<Settings>>;

    /// Insert or update the settings singleton
    async fn save_settings(&self, settings: &Settings) -> Result<()>;

    // ================================
    // Auth contexts (in-flight authorize requests)
    // ================================

    /// Persist a new auth context
    async fn create_auth_context(&self, context: &AuthContext) -> Result<()>;

    /// Get an auth context by its opaque identifier
    async fn get_auth_context(&self, id: &str) -> Result<Option<AuthContext>>;

    /// Update flow progress on an auth context
    async fn update_auth_context(&self, context: &AuthContext) -> Result<()>;

    /// Delete an auth context once the flow completes or is abandoned
    async fn delete_auth_context(&self, id: &str) -> Result<()>;

    /// Delete expired auth contexts; returns how many were removed
    async fn purge_expired_auth_contexts(&self, now: DateTime<Utc>) -> Result<u64>;
}
