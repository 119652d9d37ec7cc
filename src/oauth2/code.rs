// ABOUTME: Authorization-code issuance: random code, hashed persistence, client redirect
// ABOUTME: Codes are bound to client, redirect URI, PKCE challenge, nonce, ACR, and auth methods
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Portico Project

use std::fmt::Write as _;

use chrono::{Duration, Utc};
use tracing::debug;
use uuid::Uuid;

use crate::crypto;
use crate::database::{Database, DatabaseProvider};
use crate::errors::AppResult;
use crate::models::{
    acr_for_methods, join_auth_methods, AuthCode, AuthContext, AuthMethod, Client, User,
    UserSession,
};

/// Hard ceiling on code lifetime, regardless of settings
const MAX_CODE_LIFETIME_SECONDS: i64 = 60;

/// Everything needed to mint a code once the ladder reaches `issue_code`
pub struct IssueCodeInput<'a> {
    /// The completed authorize flow
    pub auth_context: &'a AuthContext,
    /// Validated client
    pub client: &'a Client,
    /// Authenticated user
    pub user: &'a User,
    /// Session the flow ran under
    pub session: Option<&'a UserSession>,
    /// Ordered auth methods performed
    pub methods: &'a [AuthMethod],
    /// Configured code lifetime in seconds (clamped to 60)
    pub code_lifetime_seconds: i64,
}

/// The minted code and the redirect that delivers it
#[derive(Debug, Clone)]
pub struct IssuedCode {
    /// Plaintext code; exists only inside the redirect
    pub code: String,
    /// Full redirect URL with `code` and `state` in the chosen response mode
    pub redirect_url: String,
}

/// Issues authorization codes
#[derive(Clone)]
pub struct CodeIssuer {
    db: Database,
}

impl CodeIssuer {
    /// Create a new code issuer
    #[must_use]
    pub const fn new(db: Database) -> Self {
        Self { db }
    }

    /// Mint a code for a completed flow and build the client redirect.
    ///
    /// The plaintext never touches the store: only its SHA-256 is persisted,
    /// bound to the client, redirect URI, PKCE challenge, nonce, state, ACR,
    /// and the auth methods performed.
    ///
    /// # Errors
    /// Returns an error if randomness or persistence fails.
    pub async fn issue(&self, input: IssueCodeInput<'_>) -> AppResult<IssuedCode> {
        let now = Utc::now();
        let lifetime = input
            .code_lifetime_seconds
            .clamp(1, MAX_CODE_LIFETIME_SECONDS);

        let code = crypto::generate_opaque_token()?;
        let scope = input
            .auth_context
            .consented_scope
            .clone()
            .unwrap_or_else(|| input.auth_context.scope.clone());

        let auth_time = input.session.map_or(now, |session| session.started_at);

        let row = AuthCode {
            id: Uuid::new_v4(),
            code_hash: crypto::sha256_hex(&code),
            client_id: input.client.id,
            user_id: input.user.id,
            scope,
            redirect_uri: input.auth_context.redirect_uri.clone(),
            code_challenge: input.auth_context.code_challenge.clone(),
            code_challenge_method: input.auth_context.code_challenge_method.clone(),
            nonce: input.auth_context.nonce.clone(),
            state: input.auth_context.state.clone(),
            acr_level: acr_for_methods(input.methods),
            auth_methods: join_auth_methods(input.methods),
            session_identifier: input
                .session
                .map(|session| session.session_identifier.clone()),
            auth_time,
            issued_at: now,
            expires_at: now + Duration::seconds(lifetime),
            used: false,
        };
        self.db.create_auth_code(&row).await?;

        debug!(
            client = %input.client.client_identifier,
            user_id = %input.user.id,
            "authorization code issued"
        );

        let redirect_url = build_code_redirect(
            &input.auth_context.redirect_uri,
            &input.auth_context.response_mode,
            &code,
            input.auth_context.state.as_deref(),
        );

        Ok(IssuedCode { code, redirect_url })
    }
}

/// Assemble the success redirect in the chosen response mode
#[must_use]
pub fn build_code_redirect(
    redirect_uri: &str,
    response_mode: &str,
    code: &str,
    state: Option<&str>,
) -> String {
    let separator = if response_mode == "fragment" {
        '#'
    } else if redirect_uri.contains('?') {
        '&'
    } else {
        '?'
    };

    let mut url = format!("{redirect_uri}{separator}code={code}");
    if let Some(state) = state {
        write!(&mut url, "&state={}", urlencoding::encode(state)).ok();
    }
    url
}

/// Assemble an error redirect in the chosen response mode
#[must_use]
pub fn build_error_redirect(
    redirect_uri: &str,
    response_mode: &str,
    error: &super::models::OAuth2Error,
    state: Option<&str>,
) -> String {
    let separator = if response_mode == "fragment" {
        '#'
    } else if redirect_uri.contains('?') {
        '&'
    } else {
        '?'
    };

    let mut url = format!("{redirect_uri}{separator}error={}", error.error);
    if let Some(description) = &error.error_description {
        write!(
            &mut url,
            "&error_description={}",
            urlencoding::encode(description)
        )
        .ok();
    }
    if let Some(state) = state {
        write!(&mut url, "&state={}", urlencoding::encode(state)).ok();
    }
    url
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oauth2::models::OAuth2Error;

    #[test]
    fn query_mode_appends_with_question_mark() {
        let url = build_code_redirect("https://c/cb", "query", "abc", Some("a1b2c3"));
        assert_eq!(url, "https://c/cb?code=abc&state=a1b2c3");
    }

    #[test]
    fn fragment_mode_uses_a_hash() {
        let url = build_code_redirect("https://c/cb", "fragment", "abc", None);
        assert_eq!(url, "https://c/cb#code=abc");
    }

    #[test]
    fn existing_query_string_is_extended() {
        let url = build_code_redirect("https://c/cb?a=1", "query", "abc", None);
        assert_eq!(url, "https://c/cb?a=1&code=abc");
    }

    #[test]
    fn error_redirect_carries_code_and_state() {
        let url = build_error_redirect(
            "https://c/cb",
            "query",
            &OAuth2Error::access_denied("the user cancelled"),
            Some("s"),
        );
        assert!(url.starts_with("https://c/cb?error=access_denied&error_description="));
        assert!(url.ends_with("&state=s"));
    }
}
