// ABOUTME: Authorization-request validation for GET /auth/authorize
// ABOUTME: Decides error-page versus error-redirect per OAuth 2.0 §4.1.2.1
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Portico Project

//! Authorize request validator.
//!
//! Violations found before the redirect URI is verified render a user-facing
//! error page, since the server must never redirect to an unregistered URI. Every
//! later violation redirects back to the client with `error` and `state`.

use tracing::warn;

use super::models::{AuthorizeRequest, OAuth2Error};
use crate::database::{Database, DatabaseProvider};
use crate::models::{AcrLevel, Client};

/// Reserved OIDC scopes that need no permission lookup
pub const RESERVED_SCOPES: [&str; 6] = [
    "openid",
    "profile",
    "email",
    "offline_access",
    "address",
    "phone",
];

/// PKCE challenge length bounds (RFC 7636 §4.2)
const CODE_CHALLENGE_MIN_LEN: usize = 43;
const CODE_CHALLENGE_MAX_LEN: usize = 128;

/// A fully validated authorize request, ready for the login manager
#[derive(Debug, Clone)]
pub struct ValidatedAuthorizeRequest {
    /// Resolved client, with redirect URIs and permissions loaded
    pub client: Client,
    /// Exact-matched redirect URI
    pub redirect_uri: String,
    /// Normalized requested scope (whitespace collapsed)
    pub scope: String,
    /// Client state
    pub state: Option<String>,
    /// OIDC nonce
    pub nonce: Option<String>,
    /// PKCE challenge
    pub code_challenge: String,
    /// PKCE method; always `S256` after validation
    pub code_challenge_method: String,
    /// Highest requested ACR level, or the client default
    pub requested_acr: AcrLevel,
    /// `query` or `fragment`
    pub response_mode: String,
    /// OIDC prompt parameter
    pub prompt: Option<String>,
    /// Maximum acceptable authentication age in seconds
    pub max_age: Option<i64>,
}

/// How an invalid authorize request is surfaced
#[derive(Debug, Clone)]
pub enum AuthorizeError {
    /// Rendered as an error page; the redirect URI is not trustworthy
    Page(OAuth2Error),
    /// Redirected back to the validated redirect URI
    Redirect {
        /// Where to send the error
        redirect_uri: String,
        /// `query` or `fragment`
        response_mode: String,
        /// State echoed back to the client
        state: Option<String>,
        /// The protocol error
        error: OAuth2Error,
    },
}

/// Validates authorize requests against the client registry and scope space
#[derive(Clone)]
pub struct AuthorizeValidator {
    db: Database,
}

impl AuthorizeValidator {
    /// Create a new validator
    #[must_use]
    pub const fn new(db: Database) -> Self {
        Self { db }
    }

    /// Validate a request end to end.
    ///
    /// # Errors
    /// Returns [`AuthorizeError::Page`] until the redirect URI is verified,
    /// [`AuthorizeError::Redirect`] afterwards.
    pub async fn validate(
        &self,
        request: &AuthorizeRequest,
    ) -> Result<ValidatedAuthorizeRequest, AuthorizeError> {
        // Client and redirect URI come first; nothing may redirect before
        // both are known good.
        let client = self
            .db
            .get_client_by_identifier(&request.client_id)
            .await
            .map_err(|e| {
                warn!("client lookup failed for {}: {e:#}", request.client_id);
                AuthorizeError::Page(OAuth2Error::server_error())
            })?
            .filter(|client| client.enabled)
            .ok_or_else(|| {
                AuthorizeError::Page(OAuth2Error::invalid_request(
                    "Unknown or disabled client_id",
                ))
            })?;

        if !client.has_redirect_uri(&request.redirect_uri) {
            return Err(AuthorizeError::Page(OAuth2Error {
                error: "invalid_redirect_uri".to_owned(),
                error_description: Some(
                    "redirect_uri is not registered for this client".to_owned(),
                ),
                error_uri: None,
            }));
        }

        let redirect_uri = request.redirect_uri.clone();
        let response_mode = match request.response_mode.as_deref() {
            None | Some("query") => "query".to_owned(),
            Some("fragment") => "fragment".to_owned(),
            Some(other) => {
                return Err(AuthorizeError::Redirect {
                    redirect_uri,
                    response_mode: "query".to_owned(),
                    state: request.state.clone(),
                    error: OAuth2Error::invalid_request(&format!(
                        "Unsupported response_mode '{other}'"
                    )),
                });
            }
        };

        let redirect = |error: OAuth2Error| AuthorizeError::Redirect {
            redirect_uri: redirect_uri.clone(),
            response_mode: response_mode.clone(),
            state: request.state.clone(),
            error,
        };

        if request.response_type != "code" {
            return Err(redirect(OAuth2Error::unsupported_response_type()));
        }

        if !client.authorization_code_enabled {
            return Err(redirect(OAuth2Error::unauthorized_client(
                "Client is not enabled for the authorization code flow",
            )));
        }

        // PKCE is mandatory (RFC 7636); the plain method is rejected
        let code_challenge = request
            .code_challenge
            .as_deref()
            .ok_or_else(|| redirect(OAuth2Error::invalid_request("code_challenge is required")))?;

        if code_challenge.len() < CODE_CHALLENGE_MIN_LEN
            || code_challenge.len() > CODE_CHALLENGE_MAX_LEN
        {
            return Err(redirect(OAuth2Error::invalid_request(
                "code_challenge must be between 43 and 128 characters",
            )));
        }
        if !code_challenge
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '~'))
        {
            return Err(redirect(OAuth2Error::invalid_request(
                "code_challenge contains characters outside the base64url alphabet",
            )));
        }

        match request.code_challenge_method.as_deref() {
            Some("S256") => {}
            Some("plain") => {
                return Err(redirect(OAuth2Error::invalid_request(
                    "The 'plain' code_challenge_method is not supported",
                )));
            }
            _ => {
                return Err(redirect(OAuth2Error::invalid_request(
                    "code_challenge_method must be 'S256'",
                )));
            }
        }

        let scope = self.validate_scope(request.scope.as_deref(), &redirect).await?;

        let requested_acr = match request.acr_values.as_deref() {
            None => client.default_acr_level,
            Some(values) => {
                let mut highest = None;
                for token in values.split_whitespace() {
                    let Some(level) = AcrLevel::parse(token) else {
                        return Err(redirect(OAuth2Error::invalid_request(&format!(
                            "Unknown acr_values entry '{token}'"
                        ))));
                    };
                    highest = Some(highest.map_or(level, |h: AcrLevel| h.max(level)));
                }
                highest.unwrap_or(client.default_acr_level)
            }
        };

        if let Some(max_age) = request.max_age {
            if max_age < 0 {
                return Err(redirect(OAuth2Error::invalid_request(
                    "max_age must not be negative",
                )));
            }
        }

        Ok(ValidatedAuthorizeRequest {
            client,
            redirect_uri: request.redirect_uri.clone(),
            scope,
            state: request.state.clone(),
            nonce: request.nonce.clone(),
            code_challenge: code_challenge.to_owned(),
            code_challenge_method: "S256".to_owned(),
            requested_acr,
            response_mode,
            prompt: request.prompt.clone(),
            max_age: request.max_age,
        })
    }

    /// Tokenize and resolve the requested scope.
    ///
    /// Each token must be a reserved OIDC scope or a `resource:permission`
    /// pair resolvable to an existing permission.
    async fn validate_scope(
        &self,
        scope: Option<&str>,
        redirect: &impl Fn(OAuth2Error) -> AuthorizeError,
    ) -> Result<String, AuthorizeError> {
        let raw = scope.unwrap_or("").trim();
        if raw.is_empty() {
            return Err(redirect(OAuth2Error::invalid_scope("scope is required")));
        }

        let mut tokens = Vec::new();
        for token in raw.split_whitespace() {
            if tokens.contains(&token) {
                continue;
            }
            if RESERVED_SCOPES.contains(&token) {
                tokens.push(token);
                continue;
            }

            let Some((resource, permission)) = token.split_once(':') else {
                return Err(redirect(OAuth2Error::invalid_scope(&format!(
                    "Scope token '{token}' is neither a reserved scope nor resource:permission"
                ))));
            };
            if resource.is_empty() || permission.is_empty() {
                return Err(redirect(OAuth2Error::invalid_scope(&format!(
                    "Scope token '{token}' is malformed"
                ))));
            }

            let resolved = self
                .db
                .get_permission_by_identifiers(resource, permission)
                .await
                .map_err(|e| {
                    warn!("permission lookup failed for {token}: {e:#}");
                    redirect(OAuth2Error::server_error())
                })?;
            if resolved.is_none() {
                return Err(redirect(OAuth2Error::invalid_scope(&format!(
                    "Scope token '{token}' does not resolve to a known permission"
                ))));
            }
            tokens.push(token);
        }

        Ok(tokens.join(" "))
    }
}
