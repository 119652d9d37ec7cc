// ABOUTME: Database factory and backend selection from the connection string
// ABOUTME: Delegating enum so the core stays monomorphic over one Database type
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Portico Project

//! Database factory.
//!
//! Detects the backend from the connection URL and wraps it in a delegating
//! enum. Only SQLite ships today; the URL detection seam is where a
//! Postgres variant would slot in behind a feature flag.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info};
use uuid::Uuid;

use super::sqlite::SqliteDatabase;
use super::DatabaseProvider;
use crate::models::{
    AuthCode, AuthContext, Client, KeyPair, Permission, RefreshToken, Resource, Settings, User,
    UserConsent, UserSession,
};

/// Supported database types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseType {
    /// Embedded SQLite (file or in-memory)
    SQLite,
}

/// Database instance wrapper that delegates to the active backend
#[derive(Clone)]
pub enum Database {
    /// SQLite backend
    SQLite(SqliteDatabase),
}

impl Database {
    /// Create a database instance from a connection string
    ///
    /// # Errors
    /// Returns an error if the URL scheme is unsupported or the connection
    /// fails.
    pub async fn new(database_url: &str) -> Result<Self> {
        debug!("detecting database type from URL");
        let db_type = detect_database_type(database_url)?;
        info!(?db_type, "initializing database backend");

        match db_type {
            DatabaseType::SQLite => {
                let db = SqliteDatabase::new(database_url).await?;
                Ok(Self::SQLite(db))
            }
        }
    }

    /// Descriptive string for the active backend
    #[must_use]
    pub const fn backend_info(&self) -> &'static str {
        match self {
            Self::SQLite(_) => "SQLite",
        }
    }
}

/// Detect the database type from a connection string
fn detect_database_type(database_url: &str) -> Result<DatabaseType> {
    if database_url.starts_with("sqlite:") || database_url.ends_with(".db") {
        Ok(DatabaseType::SQLite)
    } else {
        Err(anyhow!(
            "unsupported database URL (expected sqlite:...): {database_url}"
        ))
    }
}

macro_rules! delegate {
    ($self:ident, $method:ident $(, $arg:expr)*) => {
        match $self {
            Database::SQLite(db) => db.$method($($arg),*).await,
        }
    };
}

#[async_trait]
impl DatabaseProvider for Database {
    async fn migrate(&self) -> Result<()> {
        delegate!(self, migrate)
    }

    async fn create_user(&self, user: &User) -> Result<()> {
        delegate!(self, create_user, user)
    }

    async fn get_user(&self, user_id: Uuid) -> Result<Option<User>> {
        delegate!(self, get_user, user_id)
    }

    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
        delegate!(self, get_user_by_email, email)
    }

    async fn get_user_by_subject(&self, subject: Uuid) -> Result<Option<User>> {
        delegate!(self, get_user_by_subject, subject)
    }

    async fn update_user(&self, user: &User) -> Result<()> {
        delegate!(self, update_user, user)
    }

    async fn create_client(&self, client: &Client) -> Result<()> {
        delegate!(self, create_client, client)
    }

    async fn get_client(&self, client_id: Uuid) -> Result<Option<Client>> {
        delegate!(self, get_client, client_id)
    }

    async fn get_client_by_identifier(&self, client_identifier: &str) -> Result<Option<Client>> {
        delegate!(self, get_client_by_identifier, client_identifier)
    }

    async fn create_resource(&self, resource: &Resource) -> Result<()> {
        delegate!(self, create_resource, resource)
    }

    async fn create_permission(&self, permission: &Permission) -> Result<()> {
        delegate!(self, create_permission, permission)
    }

    async fn get_permission_by_identifiers(
        &self,
        resource_identifier: &str,
        permission_identifier: &str,
    ) -> Result<Option<Permission>> {
        delegate!(
            self,
            get_permission_by_identifiers,
            resource_identifier,
            permission_identifier
        )
    }

    async fn add_permission_to_user(&self, user_id: Uuid, permission_id: Uuid) -> Result<()> {
        delegate!(self, add_permission_to_user, user_id, permission_id)
    }

    async fn add_permission_to_client(&self, client_id: Uuid, permission_id: Uuid) -> Result<()> {
        delegate!(self, add_permission_to_client, client_id, permission_id)
    }

    async fn create_auth_code(&self, code: &AuthCode) -> Result<()> {
        delegate!(self, create_auth_code, code)
    }

    async fn consume_auth_code(&self, code_hash: &str) -> Result<Option<AuthCode>> {
        delegate!(self, consume_auth_code, code_hash)
    }

    async fn get_auth_code_by_hash(&self, code_hash: &str) -> Result<Option<AuthCode>> {
        delegate!(self, get_auth_code_by_hash, code_hash)
    }

    async fn purge_expired_auth_codes(&self, now: DateTime<Utc>) -> Result<u64> {
        delegate!(self, purge_expired_auth_codes, now)
    }

    async fn create_user_session(&self, session: &UserSession) -> Result<()> {
        delegate!(self, create_user_session, session)
    }

    async fn get_user_session(&self, session_identifier: &str) -> Result<Option<UserSession>> {
        delegate!(self, get_user_session, session_identifier)
    }

    async fn get_user_sessions_by_user(&self, user_id: Uuid) -> Result<Vec<UserSession>> {
        delegate!(self, get_user_sessions_by_user, user_id)
    }

    async fn update_user_session(&self, session: &UserSession) -> Result<()> {
        delegate!(self, update_user_session, session)
    }

    async fn delete_user_session(&self, session_identifier: &str) -> Result<()> {
        delegate!(self, delete_user_session, session_identifier)
    }

    async fn get_user_consent(
        &self,
        user_id: Uuid,
        client_id: Uuid,
    ) -> Result<Option<UserConsent>> {
        delegate!(self, get_user_consent, user_id, client_id)
    }

    async fn get_user_consents(&self, user_id: Uuid) -> Result<Vec<UserConsent>> {
        delegate!(self, get_user_consents, user_id)
    }

    async fn save_user_consent(&self, consent: &UserConsent) -> Result<()> {
        delegate!(self, save_user_consent, consent)
    }

    async fn delete_user_consent(&self, user_id: Uuid, client_id: Uuid) -> Result<()> {
        delegate!(self, delete_user_consent, user_id, client_id)
    }

    async fn create_refresh_token(&self, token: &RefreshToken) -> Result<()> {
        delegate!(self, create_refresh_token, token)
    }

    async fn get_refresh_token_by_hash(&self, token_hash: &str) -> Result<Option<RefreshToken>> {
        delegate!(self, get_refresh_token_by_hash, token_hash)
    }

    async fn consume_refresh_token(
        &self,
        token_hash: &str,
        client_id: Uuid,
    ) -> Result<Option<RefreshToken>> {
        delegate!(self, consume_refresh_token, token_hash, client_id)
    }

    async fn revoke_session_refresh_tokens(&self, session_identifier: &str) -> Result<u64> {
        delegate!(self, revoke_session_refresh_tokens, session_identifier)
    }

    async fn get_key_pairs(&self) -> Result<Vec<KeyPair>> {
        delegate!(self, get_key_pairs)
    }

    async fn create_key_pair(&self, key_pair: &KeyPair) -> Result<()> {
        delegate!(self, create_key_pair, key_pair)
    }

    async fn rotate_key_pairs(
        &self,
        demote_kid: &str,
        promote_kid: &str,
        new_next: &KeyPair,
    ) -> Result<()> {
        delegate!(self, rotate_key_pairs, demote_kid, promote_kid, new_next)
    }

    async fn get_settings(&self) -> Result<Option<Settings>> {
        delegate!(self, get_settings)
    }

    async fn save_settings(&self, settings: &Settings) -> Result<()> {
        delegate!(self, save_settings, settings)
    }

    async fn create_auth_context(&self, context: &AuthContext) -> Result<()> {
        delegate!(self, create_auth_context, context)
    }

    async fn get_auth_context(&self, id: &str) -> Result<Option<AuthContext>> {
        delegate!(self, get_auth_context, id)
    }

    async fn update_auth_context(&self, context: &AuthContext) -> Result<()> {
        delegate!(self, update_auth_context, context)
    }

    async fn delete_auth_context(&self, id: &str) -> Result<()> {
        delegate!(self, delete_auth_context, id)
    }

    async fn purge_expired_auth_contexts(&self, now: DateTime<Utc>) -> Result<u64> {
        delegate!(self, purge_expired_auth_contexts, now)
    }
}
