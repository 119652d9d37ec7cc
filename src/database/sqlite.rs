// ABOUTME: SQLite implementation of the repository contract using sqlx
// ABOUTME: Runtime queries, TEXT-encoded UUIDs, conditional updates for race-free consumption
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Portico Project

use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tracing::debug;
use uuid::Uuid;

use super::DatabaseProvider;
use crate::models::{
    AcrLevel, AuthCode, AuthContext, Client, KeyPair, KeyState, PasswordPolicy, Permission,
    RefreshToken, Resource, Settings, User, UserConsent, UserSession,
};

/// SQLite-backed repository
#[derive(Clone)]
pub struct SqliteDatabase {
    pool: SqlitePool,
}

fn parse_uuid(value: &str) -> Result<Uuid> {
    Uuid::parse_str(value).with_context(|| format!("malformed uuid in database: {value}"))
}

fn parse_acr(value: &str) -> Result<AcrLevel> {
    AcrLevel::parse(value).ok_or_else(|| anyhow!("malformed acr level in database: {value}"))
}

impl SqliteDatabase {
    /// Connect to a SQLite database, creating the file when missing.
    ///
    /// In-memory databases are pinned to a single pooled connection so the
    /// schema is shared across all users of the pool.
    ///
    /// # Errors
    /// Returns an error if the URL is malformed or the connection fails.
    pub async fn new(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("invalid sqlite URL: {database_url}"))?
            .create_if_missing(true);

        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .context("unable to open sqlite database")?;

        Ok(Self { pool })
    }

    /// Access to the underlying pool, for test fixtures
    #[must_use]
    pub const fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn load_user_permissions(&self, user_id: Uuid) -> Result<Vec<Permission>> {
        let rows = sqlx::query(
            r"
            SELECT p.id, p.permission_identifier, p.description, p.resource_id,
                   r.resource_identifier
            FROM permissions p
            JOIN resources r ON r.id = p.resource_id
            JOIN user_permissions up ON up.permission_id = p.id
            WHERE up.user_id = ?1
            ORDER BY r.resource_identifier, p.permission_identifier
            ",
        )
        .bind(user_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_permission).collect()
    }

    async fn load_client_permissions(&self, client_id: Uuid) -> Result<Vec<Permission>> {
        let rows = sqlx::query(
            r"
            SELECT p.id, p.permission_identifier, p.description, p.resource_id,
                   r.resource_identifier
            FROM permissions p
            JOIN resources r ON r.id = p.resource_id
            JOIN client_permissions cp ON cp.permission_id = p.id
            WHERE cp.client_id = ?1
            ORDER BY r.resource_identifier, p.permission_identifier
            ",
        )
        .bind(client_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_permission).collect()
    }

    async fn load_redirect_uris(&self, client_id: Uuid) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT uri FROM redirect_uris WHERE client_id = ?1 ORDER BY id")
            .bind(client_id.to_string())
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.iter().map(|row| row.get::<String, _>("uri")).collect())
    }

    async fn hydrate_user(&self, row: &SqliteRow) -> Result<User> {
        let mut user = row_to_user(row)?;
        user.permissions = self.load_user_permissions(user.id).await?;
        Ok(user)
    }

    async fn hydrate_client(&self, row: &SqliteRow) -> Result<Client> {
        let mut client = row_to_client(row)?;
        client.redirect_uris = self.load_redirect_uris(client.id).await?;
        client.permissions = self.load_client_permissions(client.id).await?;
        Ok(client)
    }
}

fn row_to_user(row: &SqliteRow) -> Result<User> {
    Ok(User {
        id: parse_uuid(&row.get::<String, _>("id"))?,
        subject: parse_uuid(&row.get::<String, _>("subject"))?,
        email: row.get("email"),
        email_verified: row.get("email_verified"),
        password_hash: row.get("password_hash"),
        otp_enabled: row.get("otp_enabled"),
        otp_secret: row.get("otp_secret"),
        enabled: row.get("enabled"),
        given_name: row.get("given_name"),
        family_name: row.get("family_name"),
        address: row.get("address"),
        phone_number: row.get("phone_number"),
        phone_number_verified: row.get("phone_number_verified"),
        permissions: Vec::new(),
        created_at: row.get("created_at"),
    })
}

fn row_to_client(row: &SqliteRow) -> Result<Client> {
    Ok(Client {
        id: parse_uuid(&row.get::<String, _>("id"))?,
        client_identifier: row.get("client_identifier"),
        description: row.get("description"),
        enabled: row.get("enabled"),
        consent_required: row.get("consent_required"),
        is_public: row.get("is_public"),
        client_secret_hash: row.get("client_secret_hash"),
        default_acr_level: parse_acr(&row.get::<String, _>("default_acr_level"))?,
        authorization_code_enabled: row.get("authorization_code_enabled"),
        client_credentials_enabled: row.get("client_credentials_enabled"),
        access_token_seconds: row.get("access_token_seconds"),
        refresh_token_seconds: row.get("refresh_token_seconds"),
        redirect_uris: Vec::new(),
        permissions: Vec::new(),
        created_at: row.get("created_at"),
    })
}

fn row_to_permission(row: &SqliteRow) -> Result<Permission> {
    Ok(Permission {
        id: parse_uuid(&row.get::<String, _>("id"))?,
        permission_identifier: row.get("permission_identifier"),
        description: row.get("description"),
        resource_id: parse_uuid(&row.get::<String, _>("resource_id"))?,
        resource_identifier: row.get("resource_identifier"),
    })
}

fn row_to_auth_code(row: &SqliteRow) -> Result<AuthCode> {
    Ok(AuthCode {
        id: parse_uuid(&row.get::<String, _>("id"))?,
        code_hash: row.get("code_hash"),
        client_id: parse_uuid(&row.get::<String, _>("client_id"))?,
        user_id: parse_uuid(&row.get::<String, _>("user_id"))?,
        scope: row.get("scope"),
        redirect_uri: row.get("redirect_uri"),
        code_challenge: row.get("code_challenge"),
        code_challenge_method: row.get("code_challenge_method"),
        nonce: row.get("nonce"),
        state: row.get("state"),
        acr_level: parse_acr(&row.get::<String, _>("acr_level"))?,
        auth_methods: row.get("auth_methods"),
        session_identifier: row.get("session_identifier"),
        auth_time: row.get("auth_time"),
        issued_at: row.get("issued_at"),
        expires_at: row.get("expires_at"),
        used: row.get("used"),
    })
}

fn row_to_session(row: &SqliteRow) -> Result<UserSession> {
    Ok(UserSession {
        id: parse_uuid(&row.get::<String, _>("id"))?,
        session_identifier: row.get("session_identifier"),
        user_id: parse_uuid(&row.get::<String, _>("user_id"))?,
        started_at: row.get("started_at"),
        last_accessed_at: row.get("last_accessed_at"),
        acr_level: parse_acr(&row.get::<String, _>("acr_level"))?,
        auth_methods: row.get("auth_methods"),
        ip_address: row.get("ip_address"),
        user_agent: row.get("user_agent"),
    })
}

fn row_to_consent(row: &SqliteRow) -> Result<UserConsent> {
    Ok(UserConsent {
        id: parse_uuid(&row.get::<String, _>("id"))?,
        user_id: parse_uuid(&row.get::<String, _>("user_id"))?,
        client_id: parse_uuid(&row.get::<String, _>("client_id"))?,
        scope: row.get("scope"),
        granted_at: row.get("granted_at"),
    })
}

fn row_to_refresh_token(row: &SqliteRow) -> Result<RefreshToken> {
    Ok(RefreshToken {
        id: parse_uuid(&row.get::<String, _>("id"))?,
        jti: parse_uuid(&row.get::<String, _>("jti"))?,
        token_hash: row.get("token_hash"),
        user_id: parse_uuid(&row.get::<String, _>("user_id"))?,
        client_id: parse_uuid(&row.get::<String, _>("client_id"))?,
        scope: row.get("scope"),
        session_identifier: row.get("session_identifier"),
        acr_level: parse_acr(&row.get::<String, _>("acr_level"))?,
        auth_methods: row.get("auth_methods"),
        issued_at: row.get("issued_at"),
        expires_at: row.get("expires_at"),
        revoked: row.get("revoked"),
    })
}

fn row_to_key_pair(row: &SqliteRow) -> Result<KeyPair> {
    Ok(KeyPair {
        id: parse_uuid(&row.get::<String, _>("id"))?,
        kid: row.get("kid"),
        state: KeyState::parse(&row.get::<String, _>("state"))
            .map_err(|e| anyhow!(e.to_string()))?,
        algorithm: row.get("algorithm"),
        private_key_pem: row.get("private_key_pem"),
        public_key_pem: row.get("public_key_pem"),
        public_key_jwk: row.get("public_key_jwk"),
        created_at: row.get("created_at"),
    })
}

fn row_to_settings(row: &SqliteRow) -> Result<Settings> {
    Ok(Settings {
        id: parse_uuid(&row.get::<String, _>("id"))?,
        app_name: row.get("app_name"),
        issuer: row.get("issuer"),
        password_policy: PasswordPolicy::parse(&row.get::<String, _>("password_policy"))
            .map_err(|e| anyhow!(e.to_string()))?,
        aes_encryption_key: row.get("aes_encryption_key"),
        session_authentication_key: row.get("session_authentication_key"),
        session_encryption_key: row.get("session_encryption_key"),
        access_token_seconds: row.get("access_token_seconds"),
        refresh_token_seconds: row.get("refresh_token_seconds"),
        auth_code_seconds: row.get("auth_code_seconds"),
        session_idle_seconds: row.get("session_idle_seconds"),
        session_max_seconds: row.get("session_max_seconds"),
    })
}

fn row_to_auth_context(row: &SqliteRow) -> Result<AuthContext> {
    let user_id = row
        .get::<Option<String>, _>("user_id")
        .map(|s| parse_uuid(&s))
        .transpose()?;
    Ok(AuthContext {
        id: row.get("id"),
        client_id: parse_uuid(&row.get::<String, _>("client_id"))?,
        user_id,
        scope: row.get("scope"),
        consented_scope: row.get("consented_scope"),
        redirect_uri: row.get("redirect_uri"),
        response_mode: row.get("response_mode"),
        code_challenge: row.get("code_challenge"),
        code_challenge_method: row.get("code_challenge_method"),
        nonce: row.get("nonce"),
        state: row.get("state"),
        requested_acr: parse_acr(&row.get::<String, _>("requested_acr"))?,
        pwd_completed: row.get("pwd_completed"),
        otp_completed: row.get("otp_completed"),
        pending_otp_secret: row.get("pending_otp_secret"),
        created_at: row.get("created_at"),
        expires_at: row.get("expires_at"),
    })
}

#[async_trait]
impl DatabaseProvider for SqliteDatabase {
    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                subject TEXT UNIQUE NOT NULL,
                email TEXT UNIQUE NOT NULL,
                email_verified BOOLEAN NOT NULL DEFAULT 0,
                password_hash TEXT NOT NULL,
                otp_enabled BOOLEAN NOT NULL DEFAULT 0,
                otp_secret TEXT,
                enabled BOOLEAN NOT NULL DEFAULT 1,
                given_name TEXT,
                family_name TEXT,
                address TEXT,
                phone_number TEXT,
                phone_number_verified BOOLEAN NOT NULL DEFAULT 0,
                created_at DATETIME NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS resources (
                id TEXT PRIMARY KEY,
                resource_identifier TEXT UNIQUE NOT NULL,
                description TEXT NOT NULL DEFAULT ''
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS permissions (
                id TEXT PRIMARY KEY,
                permission_identifier TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                resource_id TEXT NOT NULL REFERENCES resources(id) ON DELETE CASCADE,
                UNIQUE(resource_id, permission_identifier)
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS user_permissions (
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                permission_id TEXT NOT NULL REFERENCES permissions(id) ON DELETE CASCADE,
                PRIMARY KEY (user_id, permission_id)
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS clients (
                id TEXT PRIMARY KEY,
                client_identifier TEXT UNIQUE NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                enabled BOOLEAN NOT NULL DEFAULT 1,
                consent_required BOOLEAN NOT NULL DEFAULT 0,
                is_public BOOLEAN NOT NULL DEFAULT 0,
                client_secret_hash TEXT,
                default_acr_level TEXT NOT NULL DEFAULT '1',
                authorization_code_enabled BOOLEAN NOT NULL DEFAULT 1,
                client_credentials_enabled BOOLEAN NOT NULL DEFAULT 0,
                access_token_seconds INTEGER,
                refresh_token_seconds INTEGER,
                created_at DATETIME NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS redirect_uris (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                client_id TEXT NOT NULL REFERENCES clients(id) ON DELETE CASCADE,
                uri TEXT NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS client_permissions (
                client_id TEXT NOT NULL REFERENCES clients(id) ON DELETE CASCADE,
                permission_id TEXT NOT NULL REFERENCES permissions(id) ON DELETE CASCADE,
                PRIMARY KEY (client_id, permission_id)
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS auth_codes (
                id TEXT PRIMARY KEY,
                code_hash TEXT UNIQUE NOT NULL,
                client_id TEXT NOT NULL REFERENCES clients(id) ON DELETE CASCADE,
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                scope TEXT NOT NULL,
                redirect_uri TEXT NOT NULL,
                code_challenge TEXT NOT NULL,
                code_challenge_method TEXT NOT NULL,
                nonce TEXT,
                state TEXT,
                acr_level TEXT NOT NULL,
                auth_methods TEXT NOT NULL,
                session_identifier TEXT,
                auth_time DATETIME NOT NULL,
                issued_at DATETIME NOT NULL,
                expires_at DATETIME NOT NULL,
                used BOOLEAN NOT NULL DEFAULT 0
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_auth_codes_expires ON auth_codes(expires_at)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS user_sessions (
                id TEXT PRIMARY KEY,
                session_identifier TEXT UNIQUE NOT NULL,
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                started_at DATETIME NOT NULL,
                last_accessed_at DATETIME NOT NULL,
                acr_level TEXT NOT NULL,
                auth_methods TEXT NOT NULL,
                ip_address TEXT,
                user_agent TEXT
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS user_consents (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                client_id TEXT NOT NULL REFERENCES clients(id) ON DELETE CASCADE,
                scope TEXT NOT NULL,
                granted_at DATETIME NOT NULL,
                UNIQUE(user_id, client_id)
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS refresh_tokens (
                id TEXT PRIMARY KEY,
                jti TEXT UNIQUE NOT NULL,
                token_hash TEXT UNIQUE NOT NULL,
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                client_id TEXT NOT NULL REFERENCES clients(id) ON DELETE CASCADE,
                scope TEXT NOT NULL,
                session_identifier TEXT,
                acr_level TEXT NOT NULL,
                auth_methods TEXT NOT NULL,
                issued_at DATETIME NOT NULL,
                expires_at DATETIME NOT NULL,
                revoked BOOLEAN NOT NULL DEFAULT 0
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_refresh_tokens_session ON refresh_tokens(session_identifier)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS key_pairs (
                id TEXT PRIMARY KEY,
                kid TEXT UNIQUE NOT NULL,
                state TEXT NOT NULL,
                algorithm TEXT NOT NULL DEFAULT 'RS256',
                private_key_pem TEXT NOT NULL,
                public_key_pem TEXT NOT NULL,
                public_key_jwk TEXT NOT NULL,
                created_at DATETIME NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS settings (
                id TEXT PRIMARY KEY,
                app_name TEXT NOT NULL,
                issuer TEXT NOT NULL,
                password_policy TEXT NOT NULL,
                aes_encryption_key TEXT NOT NULL,
                session_authentication_key TEXT NOT NULL,
                session_encryption_key TEXT NOT NULL,
                access_token_seconds INTEGER NOT NULL,
                refresh_token_seconds INTEGER NOT NULL,
                auth_code_seconds INTEGER NOT NULL,
                session_idle_seconds INTEGER NOT NULL,
                session_max_seconds INTEGER NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS auth_contexts (
                id TEXT PRIMARY KEY,
                client_id TEXT NOT NULL,
                user_id TEXT,
                scope TEXT NOT NULL,
                consented_scope TEXT,
                redirect_uri TEXT NOT NULL,
                response_mode TEXT NOT NULL DEFAULT 'query',
                code_challenge TEXT NOT NULL,
                code_challenge_method TEXT NOT NULL,
                nonce TEXT,
                state TEXT,
                requested_acr TEXT NOT NULL,
                pwd_completed BOOLEAN NOT NULL DEFAULT 0,
                otp_completed BOOLEAN NOT NULL DEFAULT 0,
                pending_otp_secret TEXT,
                created_at DATETIME NOT NULL,
                expires_at DATETIME NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        debug!("sqlite schema migration complete");
        Ok(())
    }

    async fn create_user(&self, user: &User) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r"
            INSERT INTO users (
                id, subject, email, email_verified, password_hash, otp_enabled,
                otp_secret, enabled, given_name, family_name, address,
                phone_number, phone_number_verified, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            ",
        )
        .bind(user.id.to_string())
        .bind(user.subject.to_string())
        .bind(&user.email)
        .bind(user.email_verified)
        .bind(&user.password_hash)
        .bind(user.otp_enabled)
        .bind(&user.otp_secret)
        .bind(user.enabled)
        .bind(&user.given_name)
        .bind(&user.family_name)
        .bind(&user.address)
        .bind(&user.phone_number)
        .bind(user.phone_number_verified)
        .bind(user.created_at)
        .execute(&mut *tx)
        .await
        .context("unable to create user")?;

        for permission in &user.permissions {
            sqlx::query(
                "INSERT OR IGNORE INTO user_permissions (user_id, permission_id) VALUES (?1, ?2)",
            )
            .bind(user.id.to_string())
            .bind(permission.id.to_string())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_user(&self, user_id: Uuid) -> Result<Option<User>> {
        let row = sqlx::query("SELECT * FROM users WHERE id = ?1")
            .bind(user_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("unable to fetch user")?;

        match row {
            Some(row) => Ok(Some(self.hydrate_user(&row).await?)),
            None => Ok(None),
        }
    }

    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let row = sqlx::query("SELECT * FROM users WHERE email = ?1")
            .bind(email)
            .fetch_optional(&self.pool)
            .await
            .context("unable to fetch user by email")?;

        match row {
            Some(row) => Ok(Some(self.hydrate_user(&row).await?)),
            None => Ok(None),
        }
    }

    async fn get_user_by_subject(&self, subject: Uuid) -> Result<Option<User>> {
        let row = sqlx::query("SELECT * FROM users WHERE subject = ?1")
            .bind(subject.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("unable to fetch user by subject")?;

        match row {
            Some(row) => Ok(Some(self.hydrate_user(&row).await?)),
            None => Ok(None),
        }
    }

    async fn update_user(&self, user: &User) -> Result<()> {
        sqlx::query(
            r"
            UPDATE users SET
                email = ?2, email_verified = ?3, password_hash = ?4,
                otp_enabled = ?5, otp_secret = ?6, enabled = ?7,
                given_name = ?8, family_name = ?9, address = ?10,
                phone_number = ?11, phone_number_verified = ?12
            WHERE id = ?1
            ",
        )
        .bind(user.id.to_string())
        .bind(&user.email)
        .bind(user.email_verified)
        .bind(&user.password_hash)
        .bind(user.otp_enabled)
        .bind(&user.otp_secret)
        .bind(user.enabled)
        .bind(&user.given_name)
        .bind(&user.family_name)
        .bind(&user.address)
        .bind(&user.phone_number)
        .bind(user.phone_number_verified)
        .execute(&self.pool)
        .await
        .context("unable to update user")?;
        Ok(())
    }

    async fn create_client(&self, client: &Client) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r"
            INSERT INTO clients (
                id, client_identifier, description, enabled, consent_required,
                is_public, client_secret_hash, default_acr_level,
                authorization_code_enabled, client_credentials_enabled,
                access_token_seconds, refresh_token_seconds, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            ",
        )
        .bind(client.id.to_string())
        .bind(&client.client_identifier)
        .bind(&client.description)
        .bind(client.enabled)
        .bind(client.consent_required)
        .bind(client.is_public)
        .bind(&client.client_secret_hash)
        .bind(client.default_acr_level.as_str())
        .bind(client.authorization_code_enabled)
        .bind(client.client_credentials_enabled)
        .bind(client.access_token_seconds)
        .bind(client.refresh_token_seconds)
        .bind(client.created_at)
        .execute(&mut *tx)
        .await
        .context("unable to create client")?;

        for uri in &client.redirect_uris {
            sqlx::query("INSERT INTO redirect_uris (client_id, uri) VALUES (?1, ?2)")
                .bind(client.id.to_string())
                .bind(uri)
                .execute(&mut *tx)
                .await?;
        }

        for permission in &client.permissions {
            sqlx::query(
                "INSERT OR IGNORE INTO client_permissions (client_id, permission_id) VALUES (?1, ?2)",
            )
            .bind(client.id.to_string())
            .bind(permission.id.to_string())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_client(&self, client_id: Uuid) -> Result<Option<Client>> {
        let row = sqlx::query("SELECT * FROM clients WHERE id = ?1")
            .bind(client_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("unable to fetch client")?;

        match row {
            Some(row) => Ok(Some(self.hydrate_client(&row).await?)),
            None => Ok(None),
        }
    }

    async fn get_client_by_identifier(&self, client_identifier: &str) -> Result<Option<Client>> {
        let row = sqlx::query("SELECT * FROM clients WHERE client_identifier = ?1")
            .bind(client_identifier)
            .fetch_optional(&self.pool)
            .await
            .context("unable to fetch client by identifier")?;

        match row {
            Some(row) => Ok(Some(self.hydrate_client(&row).await?)),
            None => Ok(None),
        }
    }

    async fn create_resource(&self, resource: &Resource) -> Result<()> {
        sqlx::query(
            "INSERT INTO resources (id, resource_identifier, description) VALUES (?1, ?2, ?3)",
        )
        .bind(resource.id.to_string())
        .bind(&resource.resource_identifier)
        .bind(&resource.description)
        .execute(&self.pool)
        .await
        .context("unable to create resource")?;
        Ok(())
    }

    async fn create_permission(&self, permission: &Permission) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO permissions (id, permission_identifier, description, resource_id)
            VALUES (?1, ?2, ?3, ?4)
            ",
        )
        .bind(permission.id.to_string())
        .bind(&permission.permission_identifier)
        .bind(&permission.description)
        .bind(permission.resource_id.to_string())
        .execute(&self.pool)
        .await
        .context("unable to create permission")?;
        Ok(())
    }

    async fn get_permission_by_identifiers(
        &self,
        resource_identifier: &str,
        permission_identifier: &str,
    ) -> Result<Option<Permission>> {
        let row = sqlx::query(
            r"
            SELECT p.id, p.permission_identifier, p.description, p.resource_id,
                   r.resource_identifier
            FROM permissions p
            JOIN resources r ON r.id = p.resource_id
            WHERE r.resource_identifier = ?1 AND p.permission_identifier = ?2
            ",
        )
        .bind(resource_identifier)
        .bind(permission_identifier)
        .fetch_optional(&self.pool)
        .await
        .context("unable to fetch permission")?;

        row.as_ref().map(row_to_permission).transpose()
    }

    async fn add_permission_to_user(&self, user_id: Uuid, permission_id: Uuid) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO user_permissions (user_id, permission_id) VALUES (?1, ?2)",
        )
        .bind(user_id.to_string())
        .bind(permission_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn add_permission_to_client(&self, client_id: Uuid, permission_id: Uuid) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO client_permissions (client_id, permission_id) VALUES (?1, ?2)",
        )
        .bind(client_id.to_string())
        .bind(permission_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn create_auth_code(&self, code: &AuthCode) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO auth_codes (
                id, code_hash, client_id, user_id, scope, redirect_uri,
                code_challenge, code_challenge_method, nonce, state, acr_level,
                auth_methods, session_identifier, auth_time, issued_at,
                expires_at, used
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
            ",
        )
        .bind(code.id.to_string())
        .bind(&code.code_hash)
        .bind(code.client_id.to_string())
        .bind(code.user_id.to_string())
        .bind(&code.scope)
        .bind(&code.redirect_uri)
        .bind(&code.code_challenge)
        .bind(&code.code_challenge_method)
        .bind(&code.nonce)
        .bind(&code.state)
        .bind(code.acr_level.as_str())
        .bind(&code.auth_methods)
        .bind(&code.session_identifier)
        .bind(code.auth_time)
        .bind(code.issued_at)
        .bind(code.expires_at)
        .bind(code.used)
        .execute(&self.pool)
        .await
        .context("unable to create auth code")?;
        Ok(())
    }

    async fn consume_auth_code(&self, code_hash: &str) -> Result<Option<AuthCode>> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT * FROM auth_codes WHERE code_hash = ?1 AND used = 0")
            .bind(code_hash)
            .fetch_optional(&mut *tx)
            .await
            .context("unable to fetch auth code")?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };
        let code = row_to_auth_code(&row)?;

        // The conditional update is the serialization point: only the
        // transaction observing rows_affected == 1 may mint tokens.
        let affected = sqlx::query("UPDATE auth_codes SET used = 1 WHERE id = ?1 AND used = 0")
            .bind(code.id.to_string())
            .execute(&mut *tx)
            .await?
            .rows_affected();

        if affected == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        tx.commit().await?;
        Ok(Some(code))
    }

    async fn get_auth_code_by_hash(&self, code_hash: &str) -> Result<Option<AuthCode>> {
        let row = sqlx::query("SELECT * FROM auth_codes WHERE code_hash = ?1")
            .bind(code_hash)
            .fetch_optional(&self.pool)
            .await
            .context("unable to fetch auth code")?;

        row.as_ref().map(row_to_auth_code).transpose()
    }

    async fn purge_expired_auth_codes(&self, now: DateTime<Utc>) -> Result<u64> {
        let affected = sqlx::query("DELETE FROM auth_codes WHERE expires_at < ?1")
            .bind(now)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(affected)
    }

    async fn create_user_session(&self, session: &UserSession) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO user_sessions (
                id, session_identifier, user_id, started_at, last_accessed_at,
                acr_level, auth_methods, ip_address, user_agent
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ",
        )
        .bind(session.id.to_string())
        .bind(&session.session_identifier)
        .bind(session.user_id.to_string())
        .bind(session.started_at)
        .bind(session.last_accessed_at)
        .bind(session.acr_level.as_str())
        .bind(&session.auth_methods)
        .bind(&session.ip_address)
        .bind(&session.user_agent)
        .execute(&self.pool)
        .await
        .context("unable to create user session")?;
        Ok(())
    }

    async fn get_user_session(&self, session_identifier: &str) -> Result<Option<UserSession>> {
        let row = sqlx::query("SELECT * FROM user_sessions WHERE session_identifier = ?1")
            .bind(session_identifier)
            .fetch_optional(&self.pool)
            .await
            .context("unable to fetch user session")?;

        row.as_ref().map(row_to_session).transpose()
    }

    async fn get_user_sessions_by_user(&self, user_id: Uuid) -> Result<Vec<UserSession>> {
        let rows = sqlx::query(
            "SELECT * FROM user_sessions WHERE user_id = ?1 ORDER BY started_at DESC",
        )
        .bind(user_id.to_string())
        .fetch_all(&self.pool)
        .await
        .context("unable to fetch user sessions")?;

        rows.iter().map(row_to_session).collect()
    }

    async fn update_user_session(&self, session: &UserSession) -> Result<()> {
        sqlx::query(
            r"
            UPDATE user_sessions SET
                last_accessed_at = ?2, acr_level = ?3, auth_methods = ?4
            WHERE session_identifier = ?1
            ",
        )
        .bind(&session.session_identifier)
        .bind(session.last_accessed_at)
        .bind(session.acr_level.as_str())
        .bind(&session.auth_methods)
        .execute(&self.pool)
        .await
        .context("unable to update user session")?;
        Ok(())
    }

    async fn delete_user_session(&self, session_identifier: &str) -> Result<()> {
        sqlx::query("DELETE FROM user_sessions WHERE session_identifier = ?1")
            .bind(session_identifier)
            .execute(&self.pool)
            .await
            .context("unable to delete user session")?;
        Ok(())
    }

    async fn get_user_consent(
        &self,
        user_id: Uuid,
        client_id: Uuid,
    ) -> Result<Option<UserConsent>> {
        let row = sqlx::query("SELECT * FROM user_consents WHERE user_id = ?1 AND client_id = ?2")
            .bind(user_id.to_string())
            .bind(client_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("unable to fetch user consent")?;

        row.as_ref().map(row_to_consent).transpose()
    }

    async fn get_user_consents(&self, user_id: Uuid) -> Result<Vec<UserConsent>> {
        let rows =
            sqlx::query("SELECT * FROM user_consents WHERE user_id = ?1 ORDER BY granted_at DESC")
                .bind(user_id.to_string())
                .fetch_all(&self.pool)
                .await
                .context("unable to fetch user consents")?;

        rows.iter().map(row_to_consent).collect()
    }

    async fn save_user_consent(&self, consent: &UserConsent) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO user_consents (id, user_id, client_id, scope, granted_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(user_id, client_id)
            DO UPDATE SET scope = excluded.scope, granted_at = excluded.granted_at
            ",
        )
        .bind(consent.id.to_string())
        .bind(consent.user_id.to_string())
        .bind(consent.client_id.to_string())
        .bind(&consent.scope)
        .bind(consent.granted_at)
        .execute(&self.pool)
        .await
        .context("unable to save user consent")?;
        Ok(())
    }

    async fn delete_user_consent(&self, user_id: Uuid, client_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM user_consents WHERE user_id = ?1 AND client_id = ?2")
            .bind(user_id.to_string())
            .bind(client_id.to_string())
            .execute(&self.pool)
            .await
            .context("unable to delete user consent")?;
        Ok(())
    }

    async fn create_refresh_token(&self, token: &RefreshToken) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO refresh_tokens (
                id, jti, token_hash, user_id, client_id, scope,
                session_identifier, acr_level, auth_methods, issued_at,
                expires_at, revoked
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ",
        )
        .bind(token.id.to_string())
        .bind(token.jti.to_string())
        .bind(&token.token_hash)
        .bind(token.user_id.to_string())
        .bind(token.client_id.to_string())
        .bind(&token.scope)
        .bind(&token.session_identifier)
        .bind(token.acr_level.as_str())
        .bind(&token.auth_methods)
        .bind(token.issued_at)
        .bind(token.expires_at)
        .bind(token.revoked)
        .execute(&self.pool)
        .await
        .context("unable to create refresh token")?;
        Ok(())
    }

    async fn get_refresh_token_by_hash(&self, token_hash: &str) -> Result<Option<RefreshToken>> {
        let row = sqlx::query("SELECT * FROM refresh_tokens WHERE token_hash = ?1")
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .await
            .context("unable to fetch refresh token")?;

        row.as_ref().map(row_to_refresh_token).transpose()
    }

    async fn consume_refresh_token(
        &self,
        token_hash: &str,
        client_id: Uuid,
    ) -> Result<Option<RefreshToken>> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT * FROM refresh_tokens WHERE token_hash = ?1 AND client_id = ?2 AND revoked = 0",
        )
        .bind(token_hash)
        .bind(client_id.to_string())
        .fetch_optional(&mut *tx)
        .await
        .context("unable to fetch refresh token")?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };
        let token = row_to_refresh_token(&row)?;

        // Same serialization technique as code consumption: the old token
        // becomes invalid atomically with the caller gaining the right to
        // issue its replacement.
        let affected =
            sqlx::query("UPDATE refresh_tokens SET revoked = 1 WHERE id = ?1 AND revoked = 0")
                .bind(token.id.to_string())
                .execute(&mut *tx)
                .await?
                .rows_affected();

        if affected == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        tx.commit().await?;
        Ok(Some(token))
    }

    async fn revoke_session_refresh_tokens(&self, session_identifier: &str) -> Result<u64> {
        let affected = sqlx::query(
            "UPDATE refresh_tokens SET revoked = 1 WHERE session_identifier = ?1 AND revoked = 0",
        )
        .bind(session_identifier)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected)
    }

    async fn get_key_pairs(&self) -> Result<Vec<KeyPair>> {
        let rows = sqlx::query("SELECT * FROM key_pairs ORDER BY created_at")
            .fetch_all(&self.pool)
            .await
            .context("unable to fetch key pairs")?;

        rows.iter().map(row_to_key_pair).collect()
    }

    async fn create_key_pair(&self, key_pair: &KeyPair) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO key_pairs (
                id, kid, state, algorithm, private_key_pem, public_key_pem,
                public_key_jwk, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ",
        )
        .bind(key_pair.id.to_string())
        .bind(&key_pair.kid)
        .bind(key_pair.state.as_str())
        .bind(&key_pair.algorithm)
        .bind(&key_pair.private_key_pem)
        .bind(&key_pair.public_key_pem)
        .bind(&key_pair.public_key_jwk)
        .bind(key_pair.created_at)
        .execute(&self.pool)
        .await
        .context("unable to create key pair")?;
        Ok(())
    }

    async fn rotate_key_pairs(
        &self,
        demote_kid: &str,
        promote_kid: &str,
        new_next: &KeyPair,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let demoted =
            sqlx::query("UPDATE key_pairs SET state = 'previous' WHERE kid = ?1 AND state = 'current'")
                .bind(demote_kid)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        if demoted != 1 {
            tx.rollback().await?;
            return Err(anyhow!(
                "key rotation conflict: {demote_kid} is no longer the current key"
            ));
        }

        let promoted =
            sqlx::query("UPDATE key_pairs SET state = 'current' WHERE kid = ?1 AND state = 'next'")
                .bind(promote_kid)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        if promoted != 1 {
            tx.rollback().await?;
            return Err(anyhow!(
                "key rotation conflict: {promote_kid} is no longer the next key"
            ));
        }

        sqlx::query(
            r"
            INSERT INTO key_pairs (
                id, kid, state, algorithm, private_key_pem, public_key_pem,
                public_key_jwk, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ",
        )
        .bind(new_next.id.to_string())
        .bind(&new_next.kid)
        .bind(new_next.state.as_str())
        .bind(&new_next.algorithm)
        .bind(&new_next.private_key_pem)
        .bind(&new_next.public_key_pem)
        .bind(&new_next.public_key_jwk)
        .bind(new_next.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_settings(&self) -> Result<Option<Settings>> {
        let row = sqlx::query("SELECT * FROM settings LIMIT 1")
            .fetch_optional(&self.pool)
            .await
            .context("unable to fetch settings")?;

        row.as_ref().map(row_to_settings).transpose()
    }

    async fn save_settings(&self, settings: &Settings) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO settings (
                id, app_name, issuer, password_policy, aes_encryption_key,
                session_authentication_key, session_encryption_key,
                access_token_seconds, refresh_token_seconds, auth_code_seconds,
                session_idle_seconds, session_max_seconds
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ON CONFLICT(id) DO UPDATE SET
                app_name = excluded.app_name,
                issuer = excluded.issuer,
                password_policy = excluded.password_policy,
                aes_encryption_key = excluded.aes_encryption_key,
                session_authentication_key = excluded.session_authentication_key,
                session_encryption_key = excluded.session_encryption_key,
                access_token_seconds = excluded.access_token_seconds,
                refresh_token_seconds = excluded.refresh_token_seconds,
                auth_code_seconds = excluded.auth_code_seconds,
                session_idle_seconds = excluded.session_idle_seconds,
                session_max_seconds = excluded.session_max_seconds
            ",
        )
        .bind(settings.id.to_string())
        .bind(&settings.app_name)
        .bind(&settings.issuer)
        .bind(settings.password_policy.as_str())
        .bind(&settings.aes_encryption_key)
        .bind(&settings.session_authentication_key)
        .bind(&settings.session_encryption_key)
        .bind(settings.access_token_seconds)
        .bind(settings.refresh_token_seconds)
        .bind(settings.auth_code_seconds)
        .bind(settings.session_idle_seconds)
        .bind(settings.session_max_seconds)
        .execute(&self.pool)
        .await
        .context("unable to save settings")?;
        Ok(())
    }

    async fn create_auth_context(&self, context: &AuthContext) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO auth_contexts (
                id, client_id, user_id, scope, consented_scope, redirect_uri,
                response_mode, code_challenge, code_challenge_method, nonce,
                state, requested_acr, pwd_completed, otp_completed,
                pending_otp_secret, created_at, expires_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
            ",
        )
        .bind(&context.id)
        .bind(context.client_id.to_string())
        .bind(context.user_id.map(|id| id.to_string()))
        .bind(&context.scope)
        .bind(&context.consented_scope)
        .bind(&context.redirect_uri)
        .bind(&context.response_mode)
        .bind(&context.code_challenge)
        .bind(&context.code_challenge_method)
        .bind(&context.nonce)
        .bind(&context.state)
        .bind(context.requested_acr.as_str())
        .bind(context.pwd_completed)
        .bind(context.otp_completed)
        .bind(&context.pending_otp_secret)
        .bind(context.created_at)
        .bind(context.expires_at)
        .execute(&self.pool)
        .await
        .context("unable to create auth context")?;
        Ok(())
    }

    async fn get_auth_context(&self, id: &str) -> Result<Option<AuthContext>> {
        let row = sqlx::query("SELECT * FROM auth_contexts WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("unable to fetch auth context")?;

        row.as_ref().map(row_to_auth_context).transpose()
    }

    async fn update_auth_context(&self, context: &AuthContext) -> Result<()> {
        sqlx::query(
            r"
            UPDATE auth_contexts SET
                user_id = ?2, consented_scope = ?3, pwd_completed = ?4,
                otp_completed = ?5, pending_otp_secret = ?6
            WHERE id = ?1
            ",
        )
        .bind(&context.id)
        .bind(context.user_id.map(|id| id.to_string()))
        .bind(&context.consented_scope)
        .bind(context.pwd_completed)
        .bind(context.otp_completed)
        .bind(&context.pending_otp_secret)
        .execute(&self.pool)
        .await
        .context("unable to update auth context")?;
        Ok(())
    }

    async fn delete_auth_context(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM auth_contexts WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("unable to delete auth context")?;
        Ok(())
    }

    async fn purge_expired_auth_contexts(&self, now: DateTime<Utc>) -> Result<u64> {
        let affected = sqlx::query("DELETE FROM auth_contexts WHERE expires_at < ?1")
            .bind(now)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(affected)
    }
}
