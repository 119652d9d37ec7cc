// ABOUTME: Session lifecycle tests: idle and absolute expiry, touch throttling, logout revocation
// ABOUTME: Runs against the in-memory store through the session manager
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Portico Project

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![allow(missing_docs)]

mod common;

use chrono::{Duration, Utc};
use uuid::Uuid;

use common::setup;
use portico_server::context::RequestContext;
use portico_server::crypto;
use portico_server::database::DatabaseProvider;
use portico_server::models::{AcrLevel, AuthMethod, RefreshToken};
use portico_server::session::SessionManager;

#[tokio::test]
async fn sessions_resolve_while_fresh() {
    let harness = setup().await;
    let sessions = SessionManager::new(harness.db.clone());

    let session = sessions
        .create_session(harness.user.id, AuthMethod::Pwd, &RequestContext::anonymous())
        .await
        .unwrap();
    assert_eq!(session.acr_level, AcrLevel::Level1);
    assert_eq!(session.auth_methods, "pwd");

    let resolved = sessions
        .resolve(&session.session_identifier, &harness.settings)
        .await
        .unwrap();
    assert!(resolved.is_some());
}

#[tokio::test]
async fn recording_otp_raises_the_session_acr() {
    let harness = setup().await;
    let sessions = SessionManager::new(harness.db.clone());

    let mut session = sessions
        .create_session(harness.user.id, AuthMethod::Pwd, &RequestContext::anonymous())
        .await
        .unwrap();
    sessions
        .record_auth_method(&mut session, AuthMethod::Otp)
        .await
        .unwrap();

    let stored = harness
        .db
        .get_user_session(&session.session_identifier)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.acr_level, AcrLevel::Level2);
    assert_eq!(stored.auth_methods, "pwd otp");
}

#[tokio::test]
async fn idle_expiry_terminates_on_resolve() {
    let harness = setup().await;
    let sessions = SessionManager::new(harness.db.clone());

    let session = sessions
        .create_session(harness.user.id, AuthMethod::Pwd, &RequestContext::anonymous())
        .await
        .unwrap();

    // Push last access past the idle window (seeded at 1800 s)
    sqlx::query("UPDATE user_sessions SET last_accessed_at = datetime('now', '-1900 seconds')")
        .execute(harness.pool())
        .await
        .unwrap();

    let resolved = sessions
        .resolve(&session.session_identifier, &harness.settings)
        .await
        .unwrap();
    assert!(resolved.is_none());

    // The expired row was removed, not left behind
    let row = harness
        .db
        .get_user_session(&session.session_identifier)
        .await
        .unwrap();
    assert!(row.is_none());
}

#[tokio::test]
async fn absolute_expiry_wins_over_recent_activity() {
    let harness = setup().await;
    let sessions = SessionManager::new(harness.db.clone());

    let session = sessions
        .create_session(harness.user.id, AuthMethod::Pwd, &RequestContext::anonymous())
        .await
        .unwrap();

    // Recently active, but started before the absolute maximum (86400 s)
    sqlx::query("UPDATE user_sessions SET started_at = datetime('now', '-90000 seconds')")
        .execute(harness.pool())
        .await
        .unwrap();

    let resolved = sessions
        .resolve(&session.session_identifier, &harness.settings)
        .await
        .unwrap();
    assert!(resolved.is_none());
}

#[tokio::test]
async fn touch_is_throttled_to_once_per_second() {
    let harness = setup().await;
    let sessions = SessionManager::new(harness.db.clone());

    let mut session = sessions
        .create_session(harness.user.id, AuthMethod::Pwd, &RequestContext::anonymous())
        .await
        .unwrap();

    // Immediately after creation the touch is dropped
    let before = session.last_accessed_at;
    sessions.touch(&mut session).await.unwrap();
    assert_eq!(session.last_accessed_at, before);

    // Once the row is old enough the touch persists
    session.last_accessed_at = Utc::now() - Duration::seconds(30);
    sessions.touch(&mut session).await.unwrap();
    assert!(session.last_accessed_at > before - Duration::seconds(1));

    let stored = harness
        .db
        .get_user_session(&session.session_identifier)
        .await
        .unwrap()
        .unwrap();
    assert!(Utc::now() - stored.last_accessed_at < Duration::seconds(5));
}

#[tokio::test]
async fn logout_revokes_refresh_tokens_issued_under_the_session() {
    let harness = setup().await;
    let sessions = SessionManager::new(harness.db.clone());

    let session = sessions
        .create_session(harness.user.id, AuthMethod::Pwd, &RequestContext::anonymous())
        .await
        .unwrap();

    let token_hash = crypto::sha256_hex("an-opaque-refresh-token");
    let now = Utc::now();
    harness
        .db
        .create_refresh_token(&RefreshToken {
            id: Uuid::new_v4(),
            jti: Uuid::new_v4(),
            token_hash: token_hash.clone(),
            user_id: harness.user.id,
            client_id: harness.client.id,
            scope: "openid".to_owned(),
            session_identifier: Some(session.session_identifier.clone()),
            acr_level: AcrLevel::Level1,
            auth_methods: "pwd".to_owned(),
            issued_at: now,
            expires_at: now + Duration::days(30),
            revoked: false,
        })
        .await
        .unwrap();

    sessions.terminate(&session.session_identifier).await.unwrap();

    let row = harness
        .db
        .get_refresh_token_by_hash(&token_hash)
        .await
        .unwrap()
        .unwrap();
    assert!(row.revoked);

    let gone = harness
        .db
        .get_user_session(&session.session_identifier)
        .await
        .unwrap();
    assert!(gone.is_none());
}

#[tokio::test]
async fn sessions_can_be_listed_and_ended_per_user() {
    let harness = setup().await;
    let sessions = SessionManager::new(harness.db.clone());

    let first = sessions
        .create_session(harness.user.id, AuthMethod::Pwd, &RequestContext::anonymous())
        .await
        .unwrap();
    let second = sessions
        .create_session(harness.user.id, AuthMethod::Pwd, &RequestContext::anonymous())
        .await
        .unwrap();

    let listed = sessions.sessions_for_user(harness.user.id).await.unwrap();
    assert_eq!(listed.len(), 2);

    sessions.terminate(&first.session_identifier).await.unwrap();
    let listed = sessions.sessions_for_user(harness.user.id).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].session_identifier, second.session_identifier);
}
