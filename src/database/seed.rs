// ABOUTME: First-boot database seeding: settings, system resource, admin user, system client, key pairs
// ABOUTME: Runs only when the settings singleton is absent; otherwise a no-op
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Portico Project

use anyhow::{anyhow, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use super::{Database, DatabaseProvider};
use crate::crypto;
use crate::jwks::{SigningKey, RSA_KEY_SIZE};
use crate::models::{
    AcrLevel, Client, KeyState, PasswordPolicy, Permission, Resource, Settings, User,
};

/// Identifier of the resource representing this server
pub const SYSTEM_RESOURCE: &str = "authserver";

/// Identifier of the seeded first-party client
pub const SYSTEM_CLIENT: &str = "system-website";

const DEFAULT_ADMIN_EMAIL: &str = "admin@example.com";
const DEFAULT_ADMIN_PASSWORD: &str = "admin123";

/// Inputs for first-boot seeding
#[derive(Debug, Clone)]
pub struct SeedOptions {
    /// Admin account email; defaults with a warning when empty
    pub admin_email: Option<String>,
    /// Admin account password; defaults with a warning when empty
    pub admin_password: Option<String>,
    /// Token issuer
    pub issuer: String,
    /// Base URL used to build the system client's redirect URI
    pub base_url: String,
    /// Access-token lifetime in seconds
    pub access_token_seconds: i64,
    /// Refresh-token lifetime in seconds
    pub refresh_token_seconds: i64,
    /// Authorization-code lifetime in seconds
    pub auth_code_seconds: i64,
    /// Session idle timeout in seconds
    pub session_idle_seconds: i64,
    /// Session absolute lifetime in seconds
    pub session_max_seconds: i64,
    /// RSA key size for the seeded key pairs; tests pass 2048 for speed
    pub key_size_bits: usize,
}

impl SeedOptions {
    /// Production defaults around the given issuer and base URL
    #[must_use]
    pub fn new(issuer: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            admin_email: None,
            admin_password: None,
            issuer: issuer.into(),
            base_url: base_url.into(),
            access_token_seconds: 300,
            refresh_token_seconds: 30 * 24 * 3600,
            auth_code_seconds: 60,
            session_idle_seconds: 1800,
            session_max_seconds: 86400,
            key_size_bits: RSA_KEY_SIZE,
        }
    }
}

/// Seed the database when empty. Returns `true` when seeding ran.
///
/// # Errors
/// Returns an error if any write fails; a partially seeded store is
/// recovered by re-running (settings are written last).
pub async fn seed_database(db: &Database, options: &SeedOptions) -> Result<bool> {
    if db.get_settings().await?.is_some() {
        info!("no need to seed");
        return Ok(false);
    }

    info!("seeding database");
    let now = Utc::now();

    // System resource and its permissions
    let resource = Resource {
        id: Uuid::new_v4(),
        resource_identifier: SYSTEM_RESOURCE.to_owned(),
        description: "Authorization server (system-level)".to_owned(),
    };
    db.create_resource(&resource).await?;

    let account_permission = Permission {
        id: Uuid::new_v4(),
        permission_identifier: "account".to_owned(),
        description: "View and update user account data for the current user".to_owned(),
        resource_id: resource.id,
        resource_identifier: resource.resource_identifier.clone(),
    };
    db.create_permission(&account_permission).await?;

    let admin_website_permission = Permission {
        id: Uuid::new_v4(),
        permission_identifier: "admin-website".to_owned(),
        description: "Manage the authorization server settings via the web interface".to_owned(),
        resource_id: resource.id,
        resource_identifier: resource.resource_identifier.clone(),
    };
    db.create_permission(&admin_website_permission).await?;

    let admin_api_permission = Permission {
        id: Uuid::new_v4(),
        permission_identifier: "admin-rest-api".to_owned(),
        description: "Manage the authorization server settings via the REST API".to_owned(),
        resource_id: resource.id,
        resource_identifier: resource.resource_identifier.clone(),
    };
    db.create_permission(&admin_api_permission).await?;

    // Admin user
    let admin_email = options.admin_email.clone().unwrap_or_else(|| {
        warn!(
            "ADMIN_EMAIL is empty, defaulting to '{}'",
            DEFAULT_ADMIN_EMAIL
        );
        DEFAULT_ADMIN_EMAIL.to_owned()
    });
    let admin_password = options.admin_password.clone().unwrap_or_else(|| {
        warn!(
            "ADMIN_PASSWORD is empty, defaulting to '{}'",
            DEFAULT_ADMIN_PASSWORD
        );
        DEFAULT_ADMIN_PASSWORD.to_owned()
    });

    let password_hash = crypto::password::hash_password(&admin_password)
        .await
        .map_err(|e| anyhow!("unable to hash admin password: {e}"))?;

    let admin = User {
        id: Uuid::new_v4(),
        subject: Uuid::new_v4(),
        email: admin_email,
        email_verified: true,
        password_hash,
        otp_enabled: false,
        otp_secret: None,
        enabled: true,
        given_name: None,
        family_name: None,
        address: None,
        phone_number: None,
        phone_number_verified: false,
        permissions: vec![account_permission, admin_website_permission],
        created_at: now,
    };
    db.create_user(&admin).await?;

    // First-party website client
    let client_secret = crypto::generate_opaque_token()
        .map_err(|e| anyhow!("unable to generate client secret: {e}"))?;
    let client_secret_hash = crypto::password::hash_password(&client_secret)
        .await
        .map_err(|e| anyhow!("unable to hash client secret: {e}"))?;

    let client = Client {
        id: Uuid::new_v4(),
        client_identifier: SYSTEM_CLIENT.to_owned(),
        description: "Website client (system-level)".to_owned(),
        enabled: true,
        consent_required: false,
        is_public: false,
        client_secret_hash: Some(client_secret_hash),
        default_acr_level: AcrLevel::Level2,
        authorization_code_enabled: true,
        client_credentials_enabled: false,
        access_token_seconds: None,
        refresh_token_seconds: None,
        redirect_uris: vec![format!("{}/auth/callback", options.base_url)],
        permissions: Vec::new(),
        created_at: now,
    };
    db.create_client(&client).await?;
    // Shown exactly once; only the bcrypt hash is stored
    info!(
        client = SYSTEM_CLIENT,
        secret = %client_secret,
        "generated system client secret"
    );

    // Key pairs: one current, one next pre-published for rotation
    for state in [KeyState::Current, KeyState::Next] {
        let key_size = options.key_size_bits;
        let key = tokio::task::spawn_blocking(move || SigningKey::generate(state, key_size))
            .await
            .map_err(|e| anyhow!("key generation task failed: {e}"))?
            .map_err(|e| anyhow!("unable to generate a key pair: {e}"))?;
        let row = key
            .to_key_pair()
            .map_err(|e| anyhow!("unable to serialize key pair: {e}"))?;
        db.create_key_pair(&row).await?;
    }

    // Settings last: their presence marks the store as seeded, so an
    // interrupted seed re-runs from scratch.
    let settings = Settings {
        id: Uuid::new_v4(),
        app_name: "Portico".to_owned(),
        issuer: options.issuer.clone(),
        password_policy: PasswordPolicy::Low,
        aes_encryption_key: STANDARD.encode(
            crypto::random_bytes(32).map_err(|e| anyhow!("unable to generate AES key: {e}"))?,
        ),
        session_authentication_key: STANDARD.encode(
            crypto::random_bytes(64)
                .map_err(|e| anyhow!("unable to generate session auth key: {e}"))?,
        ),
        session_encryption_key: STANDARD.encode(
            crypto::random_bytes(32)
                .map_err(|e| anyhow!("unable to generate session encryption key: {e}"))?,
        ),
        access_token_seconds: options.access_token_seconds,
        refresh_token_seconds: options.refresh_token_seconds,
        auth_code_seconds: options.auth_code_seconds,
        session_idle_seconds: options.session_idle_seconds,
        session_max_seconds: options.session_max_seconds,
    };
    db.save_settings(&settings).await?;

    info!("finished seeding database");
    Ok(true)
}
