// ABOUTME: Shared integration-test fixture: in-memory database, seeded harness, flow helpers
// ABOUTME: Tests drive the managers directly and the routes through warp::test
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Portico Project

#![allow(dead_code)]
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::Arc;

use chrono::{Duration, Utc};
use uuid::Uuid;

use portico_server::cache::SettingsCache;
use portico_server::crypto;
use portico_server::database::seed::{seed_database, SeedOptions};
use portico_server::database::{Database, DatabaseProvider};
use portico_server::jwks::KeyManager;
use portico_server::models::{
    AcrLevel, AuthContext, AuthMethod, Client, Settings, User,
};
use portico_server::oauth2::code::{CodeIssuer, IssueCodeInput};
use portico_server::oauth2::endpoints::AuthorizationServer;
use portico_server::oauth2::models::{OAuth2Error, TokenRequest, TokenResponse};
use portico_server::oauth2::routes::RouteState;

pub const TEST_ISSUER: &str = "https://portico.test";
pub const ADMIN_EMAIL: &str = "mauro@x";
pub const ADMIN_PASSWORD: &str = "abc123";
pub const CLIENT_ID: &str = "test-client-1";
pub const CLIENT_SECRET: &str = "client-secret-abc123";
pub const REDIRECT_URI: &str = "https://c/cb";

/// A verifier/challenge pair valid under RFC 7636
pub const PKCE_VERIFIER: &str = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";

/// Everything a test needs to drive the core
pub struct TestHarness {
    pub db: Database,
    pub keys: Arc<KeyManager>,
    pub settings_cache: Arc<SettingsCache>,
    pub settings: Settings,
    pub client: Client,
    pub user: User,
}

/// Boot an in-memory database, seed it, and register a consent-requiring
/// confidential test client. The seeded admin doubles as the test user.
pub async fn setup() -> TestHarness {
    setup_with_client(true).await
}

/// Like [`setup`], with control over the test client's consent requirement
pub async fn setup_with_client(consent_required: bool) -> TestHarness {
    let db = Database::new("sqlite::memory:").await.unwrap();
    db.migrate().await.unwrap();

    let mut options = SeedOptions::new(TEST_ISSUER, TEST_ISSUER);
    options.admin_email = Some(ADMIN_EMAIL.to_owned());
    options.admin_password = Some(ADMIN_PASSWORD.to_owned());
    // 2048-bit keys keep test startup fast; production seeds 4096
    options.key_size_bits = 2048;
    seed_database(&db, &options).await.unwrap();

    let secret_hash = crypto::password::hash_password(CLIENT_SECRET).await.unwrap();
    let client = Client {
        id: Uuid::new_v4(),
        client_identifier: CLIENT_ID.to_owned(),
        description: "Integration test client".to_owned(),
        enabled: true,
        consent_required,
        is_public: false,
        client_secret_hash: Some(secret_hash),
        default_acr_level: AcrLevel::Level1,
        authorization_code_enabled: true,
        client_credentials_enabled: false,
        access_token_seconds: None,
        refresh_token_seconds: None,
        redirect_uris: vec![REDIRECT_URI.to_owned()],
        permissions: Vec::new(),
        created_at: Utc::now(),
    };
    db.create_client(&client).await.unwrap();
    let client = db
        .get_client_by_identifier(CLIENT_ID)
        .await
        .unwrap()
        .unwrap();

    let user = db.get_user_by_email(ADMIN_EMAIL).await.unwrap().unwrap();

    let keys = Arc::new(KeyManager::load(&db).await.unwrap());
    let settings_cache = Arc::new(SettingsCache::new(db.clone()));
    let settings = settings_cache.get().await.unwrap();

    TestHarness {
        db,
        keys,
        settings_cache,
        settings,
        client,
        user,
    }
}

impl TestHarness {
    /// Route state over this harness's managers
    pub fn state(&self) -> RouteState {
        RouteState::new(
            self.db.clone(),
            self.keys.clone(),
            self.settings_cache.clone(),
        )
    }

    /// Token endpoint over this harness's managers
    pub fn token_server(&self) -> AuthorizationServer {
        AuthorizationServer::new(
            self.db.clone(),
            self.keys.clone(),
            self.settings_cache.clone(),
        )
    }

    /// The S256 challenge for [`PKCE_VERIFIER`]
    pub fn pkce_challenge() -> String {
        crypto::sha256_base64url(PKCE_VERIFIER)
    }

    /// Mint a code at the manager level, skipping the HTTP ladder.
    ///
    /// Mirrors a completed flow: password done, optional otp, consent for
    /// the full scope.
    pub async fn issue_code(
        &self,
        scope: &str,
        methods: &[AuthMethod],
        nonce: Option<&str>,
        state: Option<&str>,
    ) -> String {
        let now = Utc::now();
        let context = AuthContext {
            id: crypto::generate_session_identifier().unwrap(),
            client_id: self.client.id,
            user_id: Some(self.user.id),
            scope: scope.to_owned(),
            consented_scope: Some(scope.to_owned()),
            redirect_uri: REDIRECT_URI.to_owned(),
            response_mode: "query".to_owned(),
            code_challenge: Self::pkce_challenge(),
            code_challenge_method: "S256".to_owned(),
            nonce: nonce.map(str::to_owned),
            state: state.map(str::to_owned),
            requested_acr: AcrLevel::Level1,
            pwd_completed: true,
            otp_completed: methods.contains(&AuthMethod::Otp),
            pending_otp_secret: None,
            created_at: now,
            expires_at: now + Duration::seconds(600),
        };

        let issuer = CodeIssuer::new(self.db.clone());
        let issued = issuer
            .issue(IssueCodeInput {
                auth_context: &context,
                client: &self.client,
                user: &self.user,
                session: None,
                methods,
                code_lifetime_seconds: self.settings.auth_code_seconds,
            })
            .await
            .unwrap();
        issued.code
    }

    /// Exchange a code at the token endpoint with this harness's client
    pub async fn exchange_code(
        &self,
        code: &str,
        verifier: &str,
    ) -> Result<TokenResponse, OAuth2Error> {
        self.token_server()
            .token(TokenRequest {
                grant_type: "authorization_code".to_owned(),
                code: Some(code.to_owned()),
                redirect_uri: Some(REDIRECT_URI.to_owned()),
                client_id: CLIENT_ID.to_owned(),
                client_secret: Some(CLIENT_SECRET.to_owned()),
                scope: None,
                refresh_token: None,
                code_verifier: Some(verifier.to_owned()),
            })
            .await
    }

    /// Exchange a refresh token, optionally narrowing the scope
    pub async fn exchange_refresh(
        &self,
        refresh_token: &str,
        scope: Option<&str>,
    ) -> Result<TokenResponse, OAuth2Error> {
        self.token_server()
            .token(TokenRequest {
                grant_type: "refresh_token".to_owned(),
                code: None,
                redirect_uri: None,
                client_id: CLIENT_ID.to_owned(),
                client_secret: Some(CLIENT_SECRET.to_owned()),
                scope: scope.map(str::to_owned),
                refresh_token: Some(refresh_token.to_owned()),
                code_verifier: None,
            })
            .await
    }

    /// Decode any JWT this harness's keys signed, skipping exp/aud checks
    pub fn decode_claims<T: serde::de::DeserializeOwned>(&self, jws: &str) -> T {
        let header = jsonwebtoken::decode_header(jws).unwrap();
        let kid = header.kid.unwrap();
        let key = self.keys.decoding_key(&kid).unwrap();

        let mut validation = jsonwebtoken::Validation::new(jsonwebtoken::Algorithm::RS256);
        validation.validate_exp = false;
        validation.validate_aud = false;

        jsonwebtoken::decode::<T>(jws, &key, &validation)
            .unwrap()
            .claims
    }

    /// Enable TOTP on the test user; returns the base32 secret so tests can
    /// compute valid codes
    pub async fn enable_otp(&mut self) -> String {
        use base64::{engine::general_purpose::STANDARD, Engine as _};

        let enrollment =
            crypto::totp::generate_enrollment(&self.settings.app_name, &self.user.email).unwrap();
        let aes_key = STANDARD.decode(&self.settings.aes_encryption_key).unwrap();
        let sealed = crypto::seal_secret(&enrollment.secret_base32, &aes_key).unwrap();

        self.user.otp_enabled = true;
        self.user.otp_secret = Some(sealed);
        self.db.update_user(&self.user).await.unwrap();
        enrollment.secret_base32
    }

    /// Direct access to the SQLite pool, for fixtures that manipulate rows
    pub fn pool(&self) -> &sqlx::SqlitePool {
        match &self.db {
            Database::SQLite(db) => db.pool(),
        }
    }
}

/// Extract a named cookie's value from a warp test response
pub fn cookie_value(response: &warp::http::Response<warp::hyper::body::Bytes>, name: &str) -> Option<String> {
    response
        .headers()
        .get_all("set-cookie")
        .iter()
        .filter_map(|value| value.to_str().ok())
        .find_map(|cookie| {
            let (pair, _) = cookie.split_once(';').unwrap_or((cookie, ""));
            let (cookie_name, cookie_value) = pair.split_once('=')?;
            (cookie_name == name).then(|| cookie_value.to_owned())
        })
}
