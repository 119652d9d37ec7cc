// ABOUTME: OAuth 2.0 / OIDC wire types: requests, responses, protocol errors, JWT claims
// ABOUTME: Implements the RFC 6749 error vocabulary and the token response shapes
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Portico Project

use serde::{Deserialize, Serialize};

/// OAuth 2.0 Authorization Request (query parameters of GET /auth/authorize)
#[derive(Debug, Clone, Deserialize)]
pub struct AuthorizeRequest {
    /// Response type; only `code` is supported
    pub response_type: String,
    /// Client identifier
    pub client_id: String,
    /// Redirect URI; must exactly match a registered URI
    pub redirect_uri: String,
    /// Requested scope, whitespace separated
    pub scope: Option<String>,
    /// Client state echoed on the redirect
    pub state: Option<String>,
    /// OIDC nonce echoed in the ID token
    pub nonce: Option<String>,
    /// PKCE code challenge (RFC 7636)
    pub code_challenge: Option<String>,
    /// PKCE code challenge method; only `S256` is supported
    pub code_challenge_method: Option<String>,
    /// Requested ACR levels, space separated; the highest wins
    pub acr_values: Option<String>,
    /// `query` (default) or `fragment`
    pub response_mode: Option<String>,
    /// OIDC prompt parameter; `login` forces re-authentication
    pub prompt: Option<String>,
    /// Maximum acceptable authentication age in seconds
    pub max_age: Option<i64>,
}

/// OAuth 2.0 Token Request (form fields of POST /auth/token)
#[derive(Debug, Deserialize)]
pub struct TokenRequest {
    /// Grant type (`authorization_code`, `refresh_token`, `client_credentials`)
    pub grant_type: String,
    /// Authorization code (for `authorization_code`)
    pub code: Option<String>,
    /// Redirect URI; must equal the one the code was issued for
    pub redirect_uri: Option<String>,
    /// Client identifier
    pub client_id: String,
    /// Client secret; absent for public clients
    pub client_secret: Option<String>,
    /// Requested scope (for `client_credentials`, or narrowing on refresh)
    pub scope: Option<String>,
    /// Refresh token (for `refresh_token`)
    pub refresh_token: Option<String>,
    /// PKCE code verifier (for `authorization_code`)
    pub code_verifier: Option<String>,
}

/// OAuth 2.0 Token Response
#[derive(Debug, Serialize, Deserialize)]
pub struct TokenResponse {
    /// Access token (RS256 JWT)
    pub access_token: String,
    /// Always "Bearer"
    pub token_type: String,
    /// Access-token lifetime in seconds
    pub expires_in: i64,
    /// Rotating opaque refresh token
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// OIDC ID token, present when `openid` was granted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    /// Scope actually granted
    pub scope: String,
}

/// OAuth 2.0 Error Response (RFC 6749 §5.2)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuth2Error {
    /// Error code
    pub error: String,
    /// Human-readable description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
    /// URI with more information
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_uri: Option<String>,
}

impl OAuth2Error {
    fn with_rfc(error: &str, description: &str, section: &str) -> Self {
        Self {
            error: error.to_owned(),
            error_description: Some(description.to_owned()),
            error_uri: Some(format!(
                "https://datatracker.ietf.org/doc/html/rfc6749#section-{section}"
            )),
        }
    }

    /// `invalid_request`
    #[must_use]
    pub fn invalid_request(description: &str) -> Self {
        Self::with_rfc("invalid_request", description, "4.1.2.1")
    }

    /// `invalid_client`
    #[must_use]
    pub fn invalid_client() -> Self {
        Self::with_rfc("invalid_client", "Client authentication failed", "5.2")
    }

    /// `invalid_grant`
    #[must_use]
    pub fn invalid_grant(description: &str) -> Self {
        Self::with_rfc("invalid_grant", description, "5.2")
    }

    /// `invalid_scope`
    #[must_use]
    pub fn invalid_scope(description: &str) -> Self {
        Self::with_rfc("invalid_scope", description, "4.1.2.1")
    }

    /// `unauthorized_client`
    #[must_use]
    pub fn unauthorized_client(description: &str) -> Self {
        Self::with_rfc("unauthorized_client", description, "4.1.2.1")
    }

    /// `unsupported_response_type`
    #[must_use]
    pub fn unsupported_response_type() -> Self {
        Self::with_rfc(
            "unsupported_response_type",
            "Only the 'code' response_type is supported",
            "4.1.2.1",
        )
    }

    /// `unsupported_grant_type`
    #[must_use]
    pub fn unsupported_grant_type() -> Self {
        Self::with_rfc("unsupported_grant_type", "Grant type not supported", "5.2")
    }

    /// `access_denied`
    #[must_use]
    pub fn access_denied(description: &str) -> Self {
        Self::with_rfc("access_denied", description, "4.1.2.1")
    }

    /// `login_required` (OIDC core)
    #[must_use]
    pub fn login_required() -> Self {
        Self {
            error: "login_required".to_owned(),
            error_description: Some("End-user authentication is required".to_owned()),
            error_uri: None,
        }
    }

    /// `invalid_token` (RFC 6750), for bearer-protected routes
    #[must_use]
    pub fn invalid_token(description: &str) -> Self {
        Self {
            error: "invalid_token".to_owned(),
            error_description: Some(description.to_owned()),
            error_uri: None,
        }
    }

    /// `server_error`
    #[must_use]
    pub fn server_error() -> Self {
        Self {
            error: "server_error".to_owned(),
            error_description: Some("The authorization server encountered an internal error".to_owned()),
            error_uri: None,
        }
    }

    /// HTTP status for this error at the token endpoint
    #[must_use]
    pub fn http_status(&self) -> u16 {
        match self.error.as_str() {
            "invalid_client" | "invalid_token" | "login_required" => 401,
            "server_error" => 500,
            _ => 400,
        }
    }
}

/// Next step decided by the login manager for an in-flight authorize request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginStep {
    /// Collect email and password
    Password,
    /// Collect (or enroll) a TOTP code
    Otp,
    /// Capture consent for the requested scope
    Consent,
    /// All requirements met: issue the authorization code
    IssueCode,
}

/// Access-token claims (RS256 JWT)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessTokenClaims {
    /// Issuer
    pub iss: String,
    /// Audiences derived from resource-scoped permissions
    pub aud: Vec<String>,
    /// Subject: the user's stable subject, or the client identifier for
    /// client-credentials tokens
    pub sub: String,
    /// Requesting client
    pub client_id: String,
    /// Issued-at (unix seconds)
    pub iat: i64,
    /// Expiry (unix seconds)
    pub exp: i64,
    /// Not-before (unix seconds)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nbf: Option<i64>,
    /// Token identifier; matches the refresh-token row when one was issued
    pub jti: String,
    /// Granted scope, space separated
    pub scope: String,
    /// Authentication context class ("1", "2", "3")
    pub acr: String,
    /// Authentication methods, space joined ("pwd otp")
    pub amr: String,
    /// Token type marker
    pub typ: String,
}

/// ID-token claims (OIDC core)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdTokenClaims {
    /// Issuer
    pub iss: String,
    /// Audience: the client identifier
    pub aud: String,
    /// Subject
    pub sub: String,
    /// Issued-at (unix seconds)
    pub iat: i64,
    /// Expiry (unix seconds)
    pub exp: i64,
    /// When the end-user authenticated (unix seconds)
    pub auth_time: i64,
    /// Nonce from the authorize request
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    /// Authentication context class
    pub acr: String,
    /// Authentication methods, space joined
    pub amr: String,
    /// Email (`email` scope)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Email verification state (`email` scope)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email_verified: Option<bool>,
    /// Full name (`profile` scope)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Given name (`profile` scope)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub given_name: Option<String>,
    /// Family name (`profile` scope)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub family_name: Option<String>,
    /// Postal address (`address` scope)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    /// Phone number (`phone` scope)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    /// Phone verification state (`phone` scope)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone_number_verified: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_endpoint_statuses_follow_rfc6749() {
        assert_eq!(OAuth2Error::invalid_grant("used code").http_status(), 400);
        assert_eq!(OAuth2Error::invalid_client().http_status(), 401);
        assert_eq!(OAuth2Error::server_error().http_status(), 500);
    }

    #[test]
    fn optional_token_response_fields_are_omitted() {
        let response = TokenResponse {
            access_token: "jwt".to_owned(),
            token_type: "Bearer".to_owned(),
            expires_in: 300,
            refresh_token: None,
            id_token: None,
            scope: "openid".to_owned(),
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(!json.contains("refresh_token"));
        assert!(!json.contains("id_token"));
    }
}
