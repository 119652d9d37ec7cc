// ABOUTME: Token issuance: access/ID token claim assembly, RS256 signing, refresh persistence
// ABOUTME: Audience is derived from resource-scoped permissions; amr/acr travel from the code
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Portico Project

use chrono::{Duration, Utc};
use tracing::debug;
use uuid::Uuid;

use super::models::{AccessTokenClaims, IdTokenClaims, TokenResponse};
use crate::crypto;
use crate::database::{Database, DatabaseProvider};
use crate::errors::AppResult;
use crate::jwks::KeyManager;
use crate::models::{AuthCode, Client, RefreshToken, Settings, User};

/// Distinct resource identifiers named by `resource:permission` scope tokens.
///
/// The access-token audience is derived solely from these; reserved OIDC
/// scopes contribute nothing.
#[must_use]
pub fn audience_from_scope(scope: &str) -> Vec<String> {
    let mut audience: Vec<String> = Vec::new();
    for token in scope.split_whitespace() {
        if let Some((resource, _)) = token.split_once(':') {
            if !resource.is_empty() && !audience.iter().any(|a| a == resource) {
                audience.push(resource.to_owned());
            }
        }
    }
    audience
}

fn scope_contains(scope: &str, wanted: &str) -> bool {
    scope.split_whitespace().any(|token| token == wanted)
}

/// Builds and signs tokens
#[derive(Clone)]
pub struct TokenIssuer {
    db: Database,
}

impl TokenIssuer {
    /// Create a new token issuer
    #[must_use]
    pub const fn new(db: Database) -> Self {
        Self { db }
    }

    /// Issue the token set for a consumed authorization code: access token,
    /// ID token when `openid` was granted, and a refresh token when the
    /// scope carries `offline_access` or the client is confidential.
    ///
    /// # Errors
    /// Returns an error if signing or refresh-token persistence fails.
    pub async fn issue_for_code(
        &self,
        keys: &KeyManager,
        settings: &Settings,
        client: &Client,
        user: &User,
        code: &AuthCode,
    ) -> AppResult<TokenResponse> {
        let access_lifetime = client
            .access_token_seconds
            .unwrap_or(settings.access_token_seconds);

        let wants_refresh = scope_contains(&code.scope, "offline_access") || !client.is_public;
        let (refresh_token, jti) = if wants_refresh {
            let (plaintext, row) = self
                .create_refresh_token(settings, client, user, code)
                .await?;
            (Some(plaintext), row.jti)
        } else {
            (None, Uuid::new_v4())
        };

        let now = Utc::now();
        let access_claims = AccessTokenClaims {
            iss: settings.issuer.clone(),
            aud: audience_from_scope(&code.scope),
            sub: user.subject.to_string(),
            client_id: client.client_identifier.clone(),
            iat: now.timestamp(),
            exp: (now + Duration::seconds(access_lifetime)).timestamp(),
            nbf: None,
            jti: jti.to_string(),
            scope: code.scope.clone(),
            acr: code.acr_level.as_str().to_owned(),
            amr: code.auth_methods.clone(),
            typ: "Bearer".to_owned(),
        };
        let (access_token, kid) = keys.sign(&access_claims)?;

        let id_token = if scope_contains(&code.scope, "openid") {
            let claims = build_id_token_claims(settings, client, user, code, access_lifetime);
            let (jws, _) = keys.sign(&claims)?;
            Some(jws)
        } else {
            None
        };

        debug!(
            client = %client.client_identifier,
            kid = %kid,
            "issued tokens for authorization code"
        );

        Ok(TokenResponse {
            access_token,
            token_type: "Bearer".to_owned(),
            expires_in: access_lifetime,
            refresh_token,
            id_token,
            scope: code.scope.clone(),
        })
    }

    /// Issue the replacement pair for a consumed refresh token.
    ///
    /// The subject, ACR, and auth methods carry over; `scope` must already
    /// be validated as equal to or narrower than the old token's scope.
    ///
    /// # Errors
    /// Returns an error if signing or persistence fails.
    pub async fn issue_for_refresh(
        &self,
        keys: &KeyManager,
        settings: &Settings,
        client: &Client,
        user: &User,
        old_token: &RefreshToken,
        scope: &str,
    ) -> AppResult<TokenResponse> {
        let access_lifetime = client
            .access_token_seconds
            .unwrap_or(settings.access_token_seconds);
        let refresh_lifetime = client
            .refresh_token_seconds
            .unwrap_or(settings.refresh_token_seconds);

        let plaintext = crypto::generate_opaque_token()?;
        let now = Utc::now();
        let new_row = RefreshToken {
            id: Uuid::new_v4(),
            jti: Uuid::new_v4(),
            token_hash: crypto::sha256_hex(&plaintext),
            user_id: user.id,
            client_id: client.id,
            scope: scope.to_owned(),
            session_identifier: old_token.session_identifier.clone(),
            acr_level: old_token.acr_level,
            auth_methods: old_token.auth_methods.clone(),
            issued_at: now,
            expires_at: now + Duration::seconds(refresh_lifetime),
            revoked: false,
        };
        self.db.create_refresh_token(&new_row).await?;

        let access_claims = AccessTokenClaims {
            iss: settings.issuer.clone(),
            aud: audience_from_scope(scope),
            sub: user.subject.to_string(),
            client_id: client.client_identifier.clone(),
            iat: now.timestamp(),
            exp: (now + Duration::seconds(access_lifetime)).timestamp(),
            nbf: None,
            jti: new_row.jti.to_string(),
            scope: scope.to_owned(),
            acr: old_token.acr_level.as_str().to_owned(),
            amr: old_token.auth_methods.clone(),
            typ: "Bearer".to_owned(),
        };
        let (access_token, _) = keys.sign(&access_claims)?;

        Ok(TokenResponse {
            access_token,
            token_type: "Bearer".to_owned(),
            expires_in: access_lifetime,
            refresh_token: Some(plaintext),
            id_token: None,
            scope: scope.to_owned(),
        })
    }

    /// Issue an access token for the client-credentials grant.
    ///
    /// The subject is the client itself; no refresh token is issued.
    ///
    /// # Errors
    /// Returns an error if signing fails.
    pub fn issue_for_client(
        &self,
        keys: &KeyManager,
        settings: &Settings,
        client: &Client,
        scope: &str,
    ) -> AppResult<TokenResponse> {
        let access_lifetime = client
            .access_token_seconds
            .unwrap_or(settings.access_token_seconds);

        let now = Utc::now();
        let access_claims = AccessTokenClaims {
            iss: settings.issuer.clone(),
            aud: audience_from_scope(scope),
            sub: client.client_identifier.clone(),
            client_id: client.client_identifier.clone(),
            iat: now.timestamp(),
            exp: (now + Duration::seconds(access_lifetime)).timestamp(),
            nbf: None,
            jti: Uuid::new_v4().to_string(),
            scope: scope.to_owned(),
            acr: String::new(),
            amr: String::new(),
            typ: "Bearer".to_owned(),
        };
        let (access_token, _) = keys.sign(&access_claims)?;

        Ok(TokenResponse {
            access_token,
            token_type: "Bearer".to_owned(),
            expires_in: access_lifetime,
            refresh_token: None,
            id_token: None,
            scope: scope.to_owned(),
        })
    }

    async fn create_refresh_token(
        &self,
        settings: &Settings,
        client: &Client,
        user: &User,
        code: &AuthCode,
    ) -> AppResult<(String, RefreshToken)> {
        let refresh_lifetime = client
            .refresh_token_seconds
            .unwrap_or(settings.refresh_token_seconds);

        let plaintext = crypto::generate_opaque_token()?;
        let now = Utc::now();
        let row = RefreshToken {
            id: Uuid::new_v4(),
            jti: Uuid::new_v4(),
            token_hash: crypto::sha256_hex(&plaintext),
            user_id: user.id,
            client_id: client.id,
            scope: code.scope.clone(),
            session_identifier: code.session_identifier.clone(),
            acr_level: code.acr_level,
            auth_methods: code.auth_methods.clone(),
            issued_at: now,
            expires_at: now + Duration::seconds(refresh_lifetime),
            revoked: false,
        };
        self.db.create_refresh_token(&row).await?;
        Ok((plaintext, row))
    }
}

fn build_id_token_claims(
    settings: &Settings,
    client: &Client,
    user: &User,
    code: &AuthCode,
    lifetime_seconds: i64,
) -> IdTokenClaims {
    let now = Utc::now();
    let has = |scope: &str| scope_contains(&code.scope, scope);

    IdTokenClaims {
        iss: settings.issuer.clone(),
        aud: client.client_identifier.clone(),
        sub: user.subject.to_string(),
        iat: now.timestamp(),
        exp: (now + Duration::seconds(lifetime_seconds)).timestamp(),
        auth_time: code.auth_time.timestamp(),
        nonce: code.nonce.clone(),
        acr: code.acr_level.as_str().to_owned(),
        amr: code.auth_methods.clone(),
        email: has("email").then(|| user.email.clone()),
        email_verified: has("email").then_some(user.email_verified),
        name: if has("profile") { user.full_name() } else { None },
        given_name: if has("profile") {
            user.given_name.clone()
        } else {
            None
        },
        family_name: if has("profile") {
            user.family_name.clone()
        } else {
            None
        },
        address: if has("address") {
            user.address.clone()
        } else {
            None
        },
        phone_number: if has("phone") {
            user.phone_number.clone()
        } else {
            None
        },
        phone_number_verified: has("phone").then_some(user.phone_number_verified),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audience_comes_only_from_resource_scopes() {
        let audience = audience_from_scope("openid email authserver:account authserver:admin-website");
        assert_eq!(audience, vec!["authserver".to_owned()]);

        let audience = audience_from_scope("openid profile");
        assert!(audience.is_empty());
    }

    #[test]
    fn audience_preserves_first_seen_order() {
        let audience = audience_from_scope("b:x a:y b:z");
        assert_eq!(audience, vec!["b".to_owned(), "a".to_owned()]);
    }
}
