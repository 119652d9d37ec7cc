// ABOUTME: Token-endpoint grant tests: refresh rotation, scope narrowing, client credentials
// ABOUTME: Also covers client authentication failures and code/token field binding
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Portico Project

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![allow(missing_docs)]

mod common;

use chrono::Utc;
use uuid::Uuid;

use common::{setup, CLIENT_ID, CLIENT_SECRET, PKCE_VERIFIER, REDIRECT_URI};
use portico_server::crypto;
use portico_server::database::DatabaseProvider;
use portico_server::models::{AcrLevel, AuthMethod, Client};
use portico_server::oauth2::models::{AccessTokenClaims, TokenRequest};
use portico_server::oauth2::validation::{TokenError, TokenValidator};

#[tokio::test]
async fn refresh_rotation_invalidates_the_old_token() {
    let harness = setup().await;
    let code = harness
        .issue_code("openid offline_access", &[AuthMethod::Pwd], None, None)
        .await;
    let tokens = harness.exchange_code(&code, PKCE_VERIFIER).await.unwrap();
    let r1 = tokens.refresh_token.unwrap();

    // R1 -> (A2, R2)
    let rotated = harness.exchange_refresh(&r1, None).await.unwrap();
    let r2 = rotated.refresh_token.unwrap();
    assert_ne!(r1, r2);
    assert_eq!(rotated.scope, "openid offline_access");

    // R1 again: rejected
    let error = harness.exchange_refresh(&r1, None).await.unwrap_err();
    assert_eq!(error.error, "invalid_grant");

    // R2 still valid
    harness.exchange_refresh(&r2, None).await.unwrap();
}

#[tokio::test]
async fn refresh_scope_may_narrow_but_not_widen() {
    let harness = setup().await;
    let code = harness
        .issue_code("openid email offline_access", &[AuthMethod::Pwd], None, None)
        .await;
    let tokens = harness.exchange_code(&code, PKCE_VERIFIER).await.unwrap();

    let narrowed = harness
        .exchange_refresh(&tokens.refresh_token.unwrap(), Some("openid"))
        .await
        .unwrap();
    assert_eq!(narrowed.scope, "openid");

    let error = harness
        .exchange_refresh(
            &narrowed.refresh_token.unwrap(),
            Some("openid email profile"),
        )
        .await
        .unwrap_err();
    assert_eq!(error.error, "invalid_scope");
}

#[tokio::test]
async fn exchanged_tokens_carry_the_code_bound_fields() {
    let harness = setup().await;
    let code = harness
        .issue_code(
            "openid authserver:account",
            &[AuthMethod::Pwd],
            None,
            None,
        )
        .await;
    let tokens = harness.exchange_code(&code, PKCE_VERIFIER).await.unwrap();

    let claims: AccessTokenClaims = harness.decode_claims(&tokens.access_token);
    assert_eq!(claims.sub, harness.user.subject.to_string());
    assert_eq!(claims.client_id, CLIENT_ID);
    assert_eq!(claims.scope, "openid authserver:account");
    // Audience is derived solely from resource-scoped permissions
    assert_eq!(claims.aud, vec!["authserver".to_owned()]);
    assert_eq!(claims.typ, "Bearer");
    assert_eq!(claims.acr, "1");
    assert_eq!(claims.amr, "pwd");
}

#[tokio::test]
async fn access_tokens_pass_the_validator_checks() {
    let harness = setup().await;
    let code = harness
        .issue_code("openid authserver:account", &[AuthMethod::Pwd], None, None)
        .await;
    let tokens = harness.exchange_code(&code, PKCE_VERIFIER).await.unwrap();

    let validator = TokenValidator::new();
    let claims = validator
        .validate(
            &harness.keys,
            &harness.settings.issuer,
            &tokens.access_token,
            Some("authserver"),
            Some("openid"),
        )
        .unwrap();
    assert_eq!(claims.sub, harness.user.subject.to_string());

    let error = validator
        .validate(
            &harness.keys,
            &harness.settings.issuer,
            &tokens.access_token,
            Some("another-api"),
            None,
        )
        .unwrap_err();
    assert!(matches!(error, TokenError::AudienceMismatch { .. }));

    let error = validator
        .validate(
            &harness.keys,
            &harness.settings.issuer,
            &tokens.access_token,
            None,
            Some("offline_access"),
        )
        .unwrap_err();
    assert!(matches!(error, TokenError::ScopeMissing { .. }));

    let error = validator
        .validate(
            &harness.keys,
            "https://someone-else.test",
            &tokens.access_token,
            None,
            None,
        )
        .unwrap_err();
    assert!(matches!(error, TokenError::IssuerMismatch));
}

#[tokio::test]
async fn tampered_tokens_fail_signature_validation() {
    let harness = setup().await;
    let code = harness
        .issue_code("openid", &[AuthMethod::Pwd], None, None)
        .await;
    let tokens = harness.exchange_code(&code, PKCE_VERIFIER).await.unwrap();

    // Flip a character in the signature segment
    let mut parts: Vec<String> = tokens
        .access_token
        .split('.')
        .map(str::to_owned)
        .collect();
    let signature = parts.last_mut().unwrap();
    let flipped = if signature.ends_with('A') { "B" } else { "A" };
    signature.truncate(signature.len() - 1);
    signature.push_str(flipped);
    let tampered = parts.join(".");

    let error = TokenValidator::new()
        .validate(
            &harness.keys,
            &harness.settings.issuer,
            &tampered,
            None,
            None,
        )
        .unwrap_err();
    assert!(matches!(error, TokenError::InvalidSignature));
}

#[tokio::test]
async fn wrong_client_secret_is_invalid_client() {
    let harness = setup().await;
    let code = harness
        .issue_code("openid", &[AuthMethod::Pwd], None, None)
        .await;

    let error = harness
        .token_server()
        .token(TokenRequest {
            grant_type: "authorization_code".to_owned(),
            code: Some(code),
            redirect_uri: Some(REDIRECT_URI.to_owned()),
            client_id: CLIENT_ID.to_owned(),
            client_secret: Some("not-the-secret".to_owned()),
            scope: None,
            refresh_token: None,
            code_verifier: Some(PKCE_VERIFIER.to_owned()),
        })
        .await
        .unwrap_err();
    assert_eq!(error.error, "invalid_client");
}

#[tokio::test]
async fn redirect_uri_mismatch_is_invalid_grant() {
    let harness = setup().await;
    let code = harness
        .issue_code("openid", &[AuthMethod::Pwd], None, None)
        .await;

    let error = harness
        .token_server()
        .token(TokenRequest {
            grant_type: "authorization_code".to_owned(),
            code: Some(code),
            redirect_uri: Some("https://c/other".to_owned()),
            client_id: CLIENT_ID.to_owned(),
            client_secret: Some(CLIENT_SECRET.to_owned()),
            scope: None,
            refresh_token: None,
            code_verifier: Some(PKCE_VERIFIER.to_owned()),
        })
        .await
        .unwrap_err();
    assert_eq!(error.error, "invalid_grant");
}

async fn create_service_client(harness: &common::TestHarness) -> (String, String) {
    let identifier = "service-client".to_owned();
    let secret = "service-secret-123".to_owned();
    let secret_hash = crypto::password::hash_password(&secret).await.unwrap();

    let permission = harness
        .db
        .get_permission_by_identifiers("authserver", "admin-rest-api")
        .await
        .unwrap()
        .unwrap();

    let client = Client {
        id: Uuid::new_v4(),
        client_identifier: identifier.clone(),
        description: "Service client".to_owned(),
        enabled: true,
        consent_required: false,
        is_public: false,
        client_secret_hash: Some(secret_hash),
        default_acr_level: AcrLevel::Level1,
        authorization_code_enabled: false,
        client_credentials_enabled: true,
        access_token_seconds: None,
        refresh_token_seconds: None,
        redirect_uris: Vec::new(),
        permissions: vec![permission],
        created_at: Utc::now(),
    };
    harness.db.create_client(&client).await.unwrap();
    (identifier, secret)
}

#[tokio::test]
async fn client_credentials_issues_an_access_token_only() {
    let harness = setup().await;
    let (identifier, secret) = create_service_client(&harness).await;

    let tokens = harness
        .token_server()
        .token(TokenRequest {
            grant_type: "client_credentials".to_owned(),
            code: None,
            redirect_uri: None,
            client_id: identifier.clone(),
            client_secret: Some(secret),
            scope: None,
            refresh_token: None,
            code_verifier: None,
        })
        .await
        .unwrap();

    assert!(tokens.refresh_token.is_none());
    assert!(tokens.id_token.is_none());
    assert_eq!(tokens.scope, "authserver:admin-rest-api");

    let claims: AccessTokenClaims = harness.decode_claims(&tokens.access_token);
    // The subject of a client-credentials token is the client itself
    assert_eq!(claims.sub, identifier);
    assert_eq!(claims.aud, vec!["authserver".to_owned()]);
}

#[tokio::test]
async fn client_credentials_rejects_scopes_the_client_does_not_hold() {
    let harness = setup().await;
    let (identifier, secret) = create_service_client(&harness).await;

    let error = harness
        .token_server()
        .token(TokenRequest {
            grant_type: "client_credentials".to_owned(),
            code: None,
            redirect_uri: None,
            client_id: identifier,
            client_secret: Some(secret),
            scope: Some("authserver:account".to_owned()),
            refresh_token: None,
            code_verifier: None,
        })
        .await
        .unwrap_err();
    assert_eq!(error.error, "invalid_scope");
}

#[tokio::test]
async fn client_credentials_requires_the_grant_to_be_enabled() {
    let harness = setup().await;

    let error = harness
        .token_server()
        .token(TokenRequest {
            grant_type: "client_credentials".to_owned(),
            code: None,
            redirect_uri: None,
            client_id: CLIENT_ID.to_owned(),
            client_secret: Some(CLIENT_SECRET.to_owned()),
            scope: None,
            refresh_token: None,
            code_verifier: None,
        })
        .await
        .unwrap_err();
    assert_eq!(error.error, "unauthorized_client");
}

#[tokio::test]
async fn unknown_grant_type_is_unsupported() {
    let harness = setup().await;

    let error = harness
        .token_server()
        .token(TokenRequest {
            grant_type: "password".to_owned(),
            code: None,
            redirect_uri: None,
            client_id: CLIENT_ID.to_owned(),
            client_secret: Some(CLIENT_SECRET.to_owned()),
            scope: None,
            refresh_token: None,
            code_verifier: None,
        })
        .await
        .unwrap_err();
    assert_eq!(error.error, "unsupported_grant_type");
}
