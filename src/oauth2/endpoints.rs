// ABOUTME: Token-endpoint grant handlers: authorization_code, refresh_token, client_credentials
// ABOUTME: Atomic code/refresh consumption, bcrypt client authentication, PKCE verification
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Portico Project

use std::sync::Arc;

use chrono::Utc;
use subtle::ConstantTimeEq;
use tracing::{debug, error, info, warn};

use super::models::{OAuth2Error, TokenRequest, TokenResponse};
use super::token::TokenIssuer;
use crate::cache::SettingsCache;
use crate::crypto;
use crate::database::{Database, DatabaseProvider};
use crate::jwks::KeyManager;
use crate::models::{Client, Settings, User};

/// Validate PKCE `code_verifier` format per RFC 7636 §4.1
fn validate_pkce_verifier_format(verifier: &str) -> Result<(), OAuth2Error> {
    if verifier.len() < 43 || verifier.len() > 128 {
        return Err(OAuth2Error::invalid_grant(
            "code_verifier must be between 43 and 128 characters",
        ));
    }

    if !verifier
        .chars()
        .all(|c| matches!(c, 'A'..='Z' | 'a'..='z' | '0'..='9' | '-' | '.' | '_' | '~'))
    {
        return Err(OAuth2Error::invalid_grant(
            "code_verifier contains invalid characters",
        ));
    }

    Ok(())
}

/// Verify a PKCE verifier against the stored challenge in constant time
fn verify_pkce_challenge(
    stored_challenge: &str,
    code_verifier: Option<&str>,
    client_identifier: &str,
) -> Result<(), OAuth2Error> {
    let verifier = code_verifier
        .ok_or_else(|| OAuth2Error::invalid_grant("code_verifier is required (PKCE)"))?;

    validate_pkce_verifier_format(verifier)?;

    let computed = crypto::sha256_base64url(verifier);
    if computed.as_bytes().ct_eq(stored_challenge.as_bytes()).into() {
        debug!("PKCE verification successful for client {client_identifier}");
        Ok(())
    } else {
        warn!("PKCE verification failed for client {client_identifier}");
        Err(OAuth2Error::invalid_grant("Invalid code_verifier"))
    }
}

/// Whether every token of `requested` appears in `granted`
fn scope_is_subset(requested: &str, granted: &str) -> bool {
    let granted: Vec<&str> = granted.split_whitespace().collect();
    requested
        .split_whitespace()
        .all(|token| granted.contains(&token))
}

/// The token endpoint
pub struct AuthorizationServer {
    db: Database,
    keys: Arc<KeyManager>,
    settings: Arc<SettingsCache>,
    token_issuer: TokenIssuer,
}

impl AuthorizationServer {
    /// Create a new authorization server over the shared managers
    #[must_use]
    pub fn new(db: Database, keys: Arc<KeyManager>, settings: Arc<SettingsCache>) -> Self {
        let token_issuer = TokenIssuer::new(db.clone());
        Self {
            db,
            keys,
            settings,
            token_issuer,
        }
    }

    /// Handle a token request (POST /auth/token)
    ///
    /// # Errors
    /// Returns an [`OAuth2Error`] per RFC 6749 §5.2.
    pub async fn token(&self, request: TokenRequest) -> Result<TokenResponse, OAuth2Error> {
        let settings = self.settings.get().await.map_err(|e| {
            error!("settings unavailable: {e}");
            OAuth2Error::server_error()
        })?;

        let client = self
            .db
            .get_client_by_identifier(&request.client_id)
            .await
            .map_err(|e| {
                error!("client lookup failed for {}: {e:#}", request.client_id);
                OAuth2Error::server_error()
            })?
            .filter(|client| client.enabled)
            .ok_or_else(OAuth2Error::invalid_client)?;

        let secret_verified = self.authenticate_client(&client, &request).await?;

        match request.grant_type.as_str() {
            "authorization_code" => {
                self.handle_authorization_code_grant(&settings, &client, request)
                    .await
            }
            "refresh_token" => {
                self.handle_refresh_token_grant(&settings, &client, request)
                    .await
            }
            "client_credentials" => {
                self.handle_client_credentials_grant(&settings, &client, &request, secret_verified)
            }
            _ => Err(OAuth2Error::unsupported_grant_type()),
        }
    }

    /// Authenticate the client. Confidential clients must present their
    /// secret for every grant; public clients authenticate via PKCE alone.
    ///
    /// Returns whether a secret was actually verified.
    async fn authenticate_client(
        &self,
        client: &Client,
        request: &TokenRequest,
    ) -> Result<bool, OAuth2Error> {
        let Some(secret_hash) = &client.client_secret_hash else {
            return Ok(false);
        };

        let Some(secret) = request.client_secret.as_deref() else {
            warn!(
                "client {} sent no secret for grant {}",
                client.client_identifier, request.grant_type
            );
            return Err(OAuth2Error::invalid_client());
        };

        if !crypto::password::verify_password(secret, secret_hash).await {
            warn!("client secret verification failed for {}", client.client_identifier);
            return Err(OAuth2Error::invalid_client());
        }
        Ok(true)
    }

    async fn handle_authorization_code_grant(
        &self,
        settings: &Settings,
        client: &Client,
        request: TokenRequest,
    ) -> Result<TokenResponse, OAuth2Error> {
        if !client.authorization_code_enabled {
            return Err(OAuth2Error::unauthorized_client(
                "Client is not enabled for the authorization code grant",
            ));
        }

        let code = request
            .code
            .as_deref()
            .ok_or_else(|| OAuth2Error::invalid_request("Missing authorization code"))?;
        let redirect_uri = request
            .redirect_uri
            .as_deref()
            .ok_or_else(|| OAuth2Error::invalid_request("Missing redirect_uri"))?;

        let code_hash = crypto::sha256_hex(code);

        // Conditional consumption is the replay barrier: only the caller
        // observing the row flip from unused to used mints tokens.
        let auth_code = self
            .db
            .consume_auth_code(&code_hash)
            .await
            .map_err(|e| {
                error!("code consumption failed for {}: {e:#}", client.client_identifier);
                OAuth2Error::server_error()
            })?;

        let Some(auth_code) = auth_code else {
            // Distinguish replay from an unknown code for the audit trail
            match self.db.get_auth_code_by_hash(&code_hash).await {
                Ok(Some(existing)) if existing.used => {
                    info!(
                        target: "audit",
                        event = "authorization_code_replay",
                        user_id = %existing.user_id,
                        client = %client.client_identifier,
                        "authorization code replay detected"
                    );
                }
                _ => {
                    warn!(
                        "authorization code not found for client {}",
                        client.client_identifier
                    );
                }
            }
            return Err(OAuth2Error::invalid_grant(
                "Invalid or expired authorization code",
            ));
        };

        // A code at exactly its expiry instant is already dead
        if Utc::now() >= auth_code.expires_at {
            return Err(OAuth2Error::invalid_grant(
                "Invalid or expired authorization code",
            ));
        }

        if auth_code.client_id != client.id {
            warn!(
                "code issued to another client presented by {}",
                client.client_identifier
            );
            return Err(OAuth2Error::invalid_grant(
                "Authorization code was not issued to this client",
            ));
        }

        if auth_code.redirect_uri != redirect_uri {
            return Err(OAuth2Error::invalid_grant(
                "redirect_uri does not match the authorization request",
            ));
        }

        verify_pkce_challenge(
            &auth_code.code_challenge,
            request.code_verifier.as_deref(),
            &client.client_identifier,
        )?;

        let user = self
            .load_enabled_user(auth_code.user_id, &client.client_identifier)
            .await?;

        self.token_issuer
            .issue_for_code(&self.keys, settings, client, &user, &auth_code)
            .await
            .map_err(|e| {
                error!("token issuance failed for {}: {e}", client.client_identifier);
                OAuth2Error::server_error()
            })
    }

    async fn handle_refresh_token_grant(
        &self,
        settings: &Settings,
        client: &Client,
        request: TokenRequest,
    ) -> Result<TokenResponse, OAuth2Error> {
        let refresh_token = request
            .refresh_token
            .as_deref()
            .ok_or_else(|| OAuth2Error::invalid_request("Missing refresh_token"))?;

        let token_hash = crypto::sha256_hex(refresh_token);

        // Same conditional-update barrier as codes: the old token becomes
        // invalid atomically with this caller gaining the right to rotate.
        let old_token = self
            .db
            .consume_refresh_token(&token_hash, client.id)
            .await
            .map_err(|e| {
                error!(
                    "refresh consumption failed for {}: {e:#}",
                    client.client_identifier
                );
                OAuth2Error::server_error()
            })?;

        let Some(old_token) = old_token else {
            match self.db.get_refresh_token_by_hash(&token_hash).await {
                Ok(Some(existing)) if existing.revoked => {
                    info!(
                        target: "audit",
                        event = "refresh_token_reuse",
                        user_id = %existing.user_id,
                        client = %client.client_identifier,
                        "revoked refresh token presented again"
                    );
                }
                _ => {
                    warn!(
                        "refresh token not found for client {}",
                        client.client_identifier
                    );
                }
            }
            return Err(OAuth2Error::invalid_grant("Invalid or expired refresh token"));
        };

        if Utc::now() >= old_token.expires_at {
            return Err(OAuth2Error::invalid_grant("Invalid or expired refresh token"));
        }

        // Narrowing is allowed, widening is not
        let scope = match request.scope.as_deref() {
            None => old_token.scope.clone(),
            Some(requested) => {
                if !scope_is_subset(requested, &old_token.scope) {
                    return Err(OAuth2Error::invalid_scope(
                        "Requested scope exceeds the scope of the refresh token",
                    ));
                }
                requested.to_owned()
            }
        };

        let user = self
            .load_enabled_user(old_token.user_id, &client.client_identifier)
            .await?;

        self.token_issuer
            .issue_for_refresh(&self.keys, settings, client, &user, &old_token, &scope)
            .await
            .map_err(|e| {
                error!("refresh issuance failed for {}: {e}", client.client_identifier);
                OAuth2Error::server_error()
            })
    }

    fn handle_client_credentials_grant(
        &self,
        settings: &Settings,
        client: &Client,
        request: &TokenRequest,
        secret_verified: bool,
    ) -> Result<TokenResponse, OAuth2Error> {
        if !client.client_credentials_enabled {
            return Err(OAuth2Error::unauthorized_client(
                "Client is not enabled for the client credentials grant",
            ));
        }
        // Public clients cannot use this grant: there is no user and no
        // PKCE, so a verified secret is the only authentication.
        if !secret_verified {
            return Err(OAuth2Error::invalid_client());
        }

        let client_scope_tokens: Vec<String> = client
            .permissions
            .iter()
            .map(crate::models::Permission::scope_token)
            .collect();

        let scope = match request.scope.as_deref() {
            None | Some("") => client_scope_tokens.join(" "),
            Some(requested) => {
                for token in requested.split_whitespace() {
                    if !client_scope_tokens.iter().any(|t| t == token) {
                        return Err(OAuth2Error::invalid_scope(&format!(
                            "Client does not hold the '{token}' permission"
                        )));
                    }
                }
                requested.to_owned()
            }
        };

        self.token_issuer
            .issue_for_client(&self.keys, settings, client, &scope)
            .map_err(|e| {
                error!(
                    "client credentials issuance failed for {}: {e}",
                    client.client_identifier
                );
                OAuth2Error::server_error()
            })
    }

    async fn load_enabled_user(
        &self,
        user_id: uuid::Uuid,
        client_identifier: &str,
    ) -> Result<User, OAuth2Error> {
        self.db
            .get_user(user_id)
            .await
            .map_err(|e| {
                error!("user lookup failed for {client_identifier}: {e:#}");
                OAuth2Error::server_error()
            })?
            .filter(|user| user.enabled)
            .ok_or_else(|| OAuth2Error::invalid_grant("The user no longer exists or is disabled"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verifier_format_bounds_are_enforced() {
        assert!(validate_pkce_verifier_format(&"a".repeat(42)).is_err());
        assert!(validate_pkce_verifier_format(&"a".repeat(43)).is_ok());
        assert!(validate_pkce_verifier_format(&"a".repeat(128)).is_ok());
        assert!(validate_pkce_verifier_format(&"a".repeat(129)).is_err());
        assert!(validate_pkce_verifier_format(&format!("{}!", "a".repeat(43))).is_err());
    }

    #[test]
    fn pkce_challenge_must_match_the_verifier() {
        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
        let challenge = crypto::sha256_base64url(verifier);

        assert!(verify_pkce_challenge(&challenge, Some(verifier), "c").is_ok());
        assert!(verify_pkce_challenge(&challenge, Some(&"b".repeat(43)), "c").is_err());
        assert!(verify_pkce_challenge(&challenge, None, "c").is_err());
    }

    #[test]
    fn scope_subset_rules() {
        assert!(scope_is_subset("openid", "openid email"));
        assert!(scope_is_subset("openid email", "openid email"));
        assert!(!scope_is_subset("openid profile", "openid email"));
    }
}
