// ABOUTME: End-to-end authorization-code flow tests over the HTTP surface
// ABOUTME: Happy path, replay safety, PKCE mismatch, expired codes, the ACR/OTP ladder
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Portico Project

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![allow(missing_docs)]

mod common;

use common::{
    cookie_value, setup, TestHarness, ADMIN_EMAIL, ADMIN_PASSWORD, CLIENT_ID, PKCE_VERIFIER,
    REDIRECT_URI,
};
use portico_server::crypto;
use portico_server::models::AuthMethod;
use portico_server::oauth2::models::IdTokenClaims;
use portico_server::oauth2::routes::oauth2_routes;

const ENCODED_REDIRECT: &str = "https%3A%2F%2Fc%2Fcb";

fn authorize_path(scope: &str, acr_values: &str) -> String {
    format!(
        "/auth/authorize?response_type=code&client_id={CLIENT_ID}&redirect_uri={ENCODED_REDIRECT}\
         &scope={scope}&state=a1b2c3&nonce=m9n8b7&code_challenge={}&code_challenge_method=S256\
         &acr_values={acr_values}",
        TestHarness::pkce_challenge()
    )
}

fn location(response: &warp::http::Response<warp::hyper::body::Bytes>) -> String {
    response
        .headers()
        .get("location")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_owned()
}

fn extract_code(redirect_url: &str) -> String {
    let query = redirect_url.split_once('?').unwrap().1;
    query
        .split('&')
        .find_map(|pair| pair.strip_prefix("code="))
        .unwrap()
        .to_owned()
}

#[tokio::test]
async fn happy_path_code_flow() {
    let harness = setup().await;
    let routes = oauth2_routes(harness.state());

    // Step 1: authorize redirects the anonymous browser to the password page
    let response = warp::test::request()
        .method("GET")
        .path(&authorize_path("openid%20email", "1"))
        .reply(&routes)
        .await;
    assert_eq!(response.status(), 302);
    assert_eq!(location(&response), "/auth/pwd");
    let flow = cookie_value(&response, "portico_flow").unwrap();

    // Step 2: password authentication moves the flow to consent
    let response = warp::test::request()
        .method("POST")
        .path("/auth/pwd")
        .header("content-type", "application/x-www-form-urlencoded")
        .header("cookie", format!("portico_flow={flow}"))
        .body(format!(
            "email={}&password={ADMIN_PASSWORD}",
            ADMIN_EMAIL.replace('@', "%40")
        ))
        .reply(&routes)
        .await;
    assert_eq!(response.status(), 302);
    assert_eq!(location(&response), "/auth/consent");
    let session = cookie_value(&response, "portico_session").unwrap();

    // Step 3: consent capture redirects back to the client with the code
    let response = warp::test::request()
        .method("POST")
        .path("/auth/consent")
        .header("content-type", "application/x-www-form-urlencoded")
        .header(
            "cookie",
            format!("portico_flow={flow}; portico_session={session}"),
        )
        .body("consent0=on&consent1=on&btnSubmit=submit")
        .reply(&routes)
        .await;
    assert_eq!(response.status(), 302);
    let redirect_url = location(&response);
    assert!(redirect_url.starts_with(&format!("{REDIRECT_URI}?code=")));
    assert!(redirect_url.ends_with("&state=a1b2c3"));

    let code = extract_code(&redirect_url);
    assert_eq!(code.len(), 128);

    // Step 4: the code exchanges for tokens bound to the request
    let tokens = harness.exchange_code(&code, PKCE_VERIFIER).await.unwrap();
    assert_eq!(tokens.token_type, "Bearer");
    assert_eq!(tokens.scope, "openid email");

    let id_token: IdTokenClaims = harness.decode_claims(&tokens.id_token.unwrap());
    assert_eq!(id_token.nonce.as_deref(), Some("m9n8b7"));
    assert_eq!(id_token.acr, "1");
    assert_eq!(id_token.amr, "pwd");
    assert_eq!(id_token.aud, CLIENT_ID);
    assert_eq!(id_token.sub, harness.user.subject.to_string());
    assert_eq!(id_token.email.as_deref(), Some(ADMIN_EMAIL));
}

#[tokio::test]
async fn code_replay_is_rejected() {
    let harness = setup().await;
    let code = harness
        .issue_code("openid email", &[AuthMethod::Pwd], None, Some("a1b2c3"))
        .await;

    harness.exchange_code(&code, PKCE_VERIFIER).await.unwrap();

    let error = harness
        .exchange_code(&code, PKCE_VERIFIER)
        .await
        .unwrap_err();
    assert_eq!(error.error, "invalid_grant");
}

#[tokio::test]
async fn pkce_mismatch_is_rejected() {
    let harness = setup().await;
    let code = harness
        .issue_code("openid", &[AuthMethod::Pwd], None, None)
        .await;

    let wrong_verifier = "a".repeat(43);
    let error = harness
        .exchange_code(&code, &wrong_verifier)
        .await
        .unwrap_err();
    assert_eq!(error.error, "invalid_grant");

    // The failed PKCE attempt consumed the code; it must not be retryable
    let error = harness
        .exchange_code(&code, PKCE_VERIFIER)
        .await
        .unwrap_err();
    assert_eq!(error.error, "invalid_grant");
}

#[tokio::test]
async fn expired_code_is_rejected() {
    let harness = setup().await;
    let code = harness
        .issue_code("openid", &[AuthMethod::Pwd], None, None)
        .await;

    // Move the code one second past its expiry
    sqlx::query("UPDATE auth_codes SET expires_at = datetime('now', '-1 seconds')")
        .execute(harness.pool())
        .await
        .unwrap();

    let error = harness
        .exchange_code(&code, PKCE_VERIFIER)
        .await
        .unwrap_err();
    assert_eq!(error.error, "invalid_grant");
}

#[tokio::test]
async fn wrong_password_does_not_create_a_session() {
    let harness = setup().await;
    let routes = oauth2_routes(harness.state());

    let response = warp::test::request()
        .method("GET")
        .path(&authorize_path("openid", "1"))
        .reply(&routes)
        .await;
    let flow = cookie_value(&response, "portico_flow").unwrap();

    let response = warp::test::request()
        .method("POST")
        .path("/auth/pwd")
        .header("content-type", "application/x-www-form-urlencoded")
        .header("cookie", format!("portico_flow={flow}"))
        .body("email=mauro%40x&password=wrong-password")
        .reply(&routes)
        .await;
    assert_eq!(response.status(), 401);
    assert!(cookie_value(&response, "portico_session").is_none());
}

#[tokio::test]
async fn unregistered_redirect_uri_renders_a_page_not_a_redirect() {
    let harness = setup().await;
    let routes = oauth2_routes(harness.state());

    let path = format!(
        "/auth/authorize?response_type=code&client_id={CLIENT_ID}\
         &redirect_uri=https%3A%2F%2Fevil%2Fcb&scope=openid&code_challenge={}\
         &code_challenge_method=S256",
        TestHarness::pkce_challenge()
    );
    let response = warp::test::request()
        .method("GET")
        .path(&path)
        .reply(&routes)
        .await;

    assert_eq!(response.status(), 400);
    assert!(response.headers().get("location").is_none());
    let body = String::from_utf8_lossy(response.body());
    assert!(body.contains("invalid_redirect_uri"));
}

#[tokio::test]
async fn unknown_scope_redirects_with_invalid_scope() {
    let harness = setup().await;
    let routes = oauth2_routes(harness.state());

    let response = warp::test::request()
        .method("GET")
        .path(&authorize_path("openid%20nonsense", "1"))
        .reply(&routes)
        .await;
    assert_eq!(response.status(), 302);
    let redirect_url = location(&response);
    assert!(redirect_url.starts_with(REDIRECT_URI));
    assert!(redirect_url.contains("error=invalid_scope"));
    assert!(redirect_url.contains("state=a1b2c3"));
}

#[tokio::test]
async fn plain_pkce_method_is_rejected() {
    let harness = setup().await;
    let routes = oauth2_routes(harness.state());

    let path = format!(
        "/auth/authorize?response_type=code&client_id={CLIENT_ID}\
         &redirect_uri={ENCODED_REDIRECT}&scope=openid&state=s\
         &code_challenge={}&code_challenge_method=plain",
        TestHarness::pkce_challenge()
    );
    let response = warp::test::request()
        .method("GET")
        .path(&path)
        .reply(&routes)
        .await;
    assert_eq!(response.status(), 302);
    assert!(location(&response).contains("error=invalid_request"));
}

#[tokio::test]
async fn acr_level_two_forces_the_otp_step() {
    let mut harness = setup().await;
    let secret = harness.enable_otp().await;
    let routes = oauth2_routes(harness.state());

    let response = warp::test::request()
        .method("GET")
        .path(&authorize_path("openid%20email", "2"))
        .reply(&routes)
        .await;
    assert_eq!(location(&response), "/auth/pwd");
    let flow = cookie_value(&response, "portico_flow").unwrap();

    let response = warp::test::request()
        .method("POST")
        .path("/auth/pwd")
        .header("content-type", "application/x-www-form-urlencoded")
        .header("cookie", format!("portico_flow={flow}"))
        .body(format!(
            "email={}&password={ADMIN_PASSWORD}",
            ADMIN_EMAIL.replace('@', "%40")
        ))
        .reply(&routes)
        .await;
    assert_eq!(location(&response), "/auth/otp");
    let session = cookie_value(&response, "portico_session").unwrap();

    let otp = crypto::totp::current_code(&secret).unwrap();
    let response = warp::test::request()
        .method("POST")
        .path("/auth/otp")
        .header("content-type", "application/x-www-form-urlencoded")
        .header(
            "cookie",
            format!("portico_flow={flow}; portico_session={session}"),
        )
        .body(format!("otp={otp}"))
        .reply(&routes)
        .await;
    assert_eq!(response.status(), 302);
    assert_eq!(location(&response), "/auth/consent");

    let response = warp::test::request()
        .method("POST")
        .path("/auth/consent")
        .header("content-type", "application/x-www-form-urlencoded")
        .header(
            "cookie",
            format!("portico_flow={flow}; portico_session={session}"),
        )
        .body("consent0=on&consent1=on&btnSubmit=submit")
        .reply(&routes)
        .await;
    assert_eq!(response.status(), 302);
    let code = extract_code(&location(&response));

    let tokens = harness.exchange_code(&code, PKCE_VERIFIER).await.unwrap();
    let id_token: IdTokenClaims = harness.decode_claims(&tokens.id_token.unwrap());
    assert_eq!(id_token.acr, "2");
    assert_eq!(id_token.amr, "pwd otp");
}

#[tokio::test]
async fn wrong_otp_code_is_rejected() {
    let mut harness = setup().await;
    let secret = harness.enable_otp().await;
    let routes = oauth2_routes(harness.state());

    let response = warp::test::request()
        .method("GET")
        .path(&authorize_path("openid", "2"))
        .reply(&routes)
        .await;
    let flow = cookie_value(&response, "portico_flow").unwrap();

    let response = warp::test::request()
        .method("POST")
        .path("/auth/pwd")
        .header("content-type", "application/x-www-form-urlencoded")
        .header("cookie", format!("portico_flow={flow}"))
        .body(format!(
            "email={}&password={ADMIN_PASSWORD}",
            ADMIN_EMAIL.replace('@', "%40")
        ))
        .reply(&routes)
        .await;
    let session = cookie_value(&response, "portico_session").unwrap();

    let valid = crypto::totp::current_code(&secret).unwrap();
    let wrong = if valid == "000000" { "000001" } else { "000000" };
    let response = warp::test::request()
        .method("POST")
        .path("/auth/otp")
        .header("content-type", "application/x-www-form-urlencoded")
        .header(
            "cookie",
            format!("portico_flow={flow}; portico_session={session}"),
        )
        .body(format!("otp={wrong}"))
        .reply(&routes)
        .await;
    assert_eq!(response.status(), 401);
}

#[tokio::test]
async fn consent_cancel_redirects_with_access_denied() {
    let harness = setup().await;
    let routes = oauth2_routes(harness.state());

    let response = warp::test::request()
        .method("GET")
        .path(&authorize_path("openid", "1"))
        .reply(&routes)
        .await;
    let flow = cookie_value(&response, "portico_flow").unwrap();

    let response = warp::test::request()
        .method("POST")
        .path("/auth/pwd")
        .header("content-type", "application/x-www-form-urlencoded")
        .header("cookie", format!("portico_flow={flow}"))
        .body(format!(
            "email={}&password={ADMIN_PASSWORD}",
            ADMIN_EMAIL.replace('@', "%40")
        ))
        .reply(&routes)
        .await;
    let session = cookie_value(&response, "portico_session").unwrap();

    let response = warp::test::request()
        .method("POST")
        .path("/auth/consent")
        .header("content-type", "application/x-www-form-urlencoded")
        .header(
            "cookie",
            format!("portico_flow={flow}; portico_session={session}"),
        )
        .body("btnCancel=cancel")
        .reply(&routes)
        .await;
    assert_eq!(response.status(), 302);
    let redirect_url = location(&response);
    assert!(redirect_url.starts_with(REDIRECT_URI));
    assert!(redirect_url.contains("error=access_denied"));
    assert!(redirect_url.contains("state=a1b2c3"));
}

#[tokio::test]
async fn partial_consent_issues_the_code_with_the_granted_subset() {
    let harness = setup().await;
    let routes = oauth2_routes(harness.state());

    let response = warp::test::request()
        .method("GET")
        .path(&authorize_path("openid%20email", "1"))
        .reply(&routes)
        .await;
    let flow = cookie_value(&response, "portico_flow").unwrap();

    let response = warp::test::request()
        .method("POST")
        .path("/auth/pwd")
        .header("content-type", "application/x-www-form-urlencoded")
        .header("cookie", format!("portico_flow={flow}"))
        .body(format!(
            "email={}&password={ADMIN_PASSWORD}",
            ADMIN_EMAIL.replace('@', "%40")
        ))
        .reply(&routes)
        .await;
    assert_eq!(location(&response), "/auth/consent");
    let session = cookie_value(&response, "portico_session").unwrap();

    // The user unchecks "email" and allows only "openid": the flow must
    // complete with the granted subset, not bounce back to consent
    let response = warp::test::request()
        .method("POST")
        .path("/auth/consent")
        .header("content-type", "application/x-www-form-urlencoded")
        .header(
            "cookie",
            format!("portico_flow={flow}; portico_session={session}"),
        )
        .body("consent0=on&btnSubmit=submit")
        .reply(&routes)
        .await;
    assert_eq!(response.status(), 302);
    let redirect_url = location(&response);
    assert!(redirect_url.starts_with(&format!("{REDIRECT_URI}?code=")));

    let code = extract_code(&redirect_url);
    let tokens = harness.exchange_code(&code, PKCE_VERIFIER).await.unwrap();
    assert_eq!(tokens.scope, "openid");

    let id_token: IdTokenClaims = harness.decode_claims(&tokens.id_token.unwrap());
    // email was not granted, so the email claims stay out of the ID token
    assert!(id_token.email.is_none());
}

#[tokio::test]
async fn consent_free_client_skips_the_consent_step() {
    let harness = common::setup_with_client(false).await;
    let routes = oauth2_routes(harness.state());

    let response = warp::test::request()
        .method("GET")
        .path(&authorize_path("openid", "1"))
        .reply(&routes)
        .await;
    let flow = cookie_value(&response, "portico_flow").unwrap();

    // Password is the only gate: the code comes straight back
    let response = warp::test::request()
        .method("POST")
        .path("/auth/pwd")
        .header("content-type", "application/x-www-form-urlencoded")
        .header("cookie", format!("portico_flow={flow}"))
        .body(format!(
            "email={}&password={ADMIN_PASSWORD}",
            ADMIN_EMAIL.replace('@', "%40")
        ))
        .reply(&routes)
        .await;
    assert_eq!(response.status(), 302);
    let redirect_url = location(&response);
    assert!(redirect_url.starts_with(&format!("{REDIRECT_URI}?code=")));
}
