// ABOUTME: The authentication ladder state machine: pwd -> otp -> consent -> issue_code
// ABOUTME: Pure transition logic keyed on session state, requested ACR, OTP enrollment, consent
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Portico Project

//! # Login Manager
//!
//! Decides the next step of an in-flight authorize request. The transitions
//! are driven by form posts and are idempotent given the session and auth
//! context rows: refreshing an intermediate page re-evaluates the same
//! decision.

use chrono::{Duration, Utc};

use super::models::LoginStep;
use crate::models::{
    AcrLevel, AuthContext, AuthMethod, Client, User, UserConsent, UserSession,
};

/// Everything the transition function looks at
#[derive(Debug)]
pub struct LoginInput<'a> {
    /// The in-flight authorize request
    pub auth_context: &'a AuthContext,
    /// The validated client
    pub client: &'a Client,
    /// The user, once known (from the session or the password step)
    pub user: Option<&'a User>,
    /// The live session, when the browser presented a valid cookie
    pub session: Option<&'a UserSession>,
    /// The user's recorded consent for this client, when any
    pub consent: Option<&'a UserConsent>,
    /// `prompt` parameter; `login` disables session reuse
    pub prompt: Option<&'a str>,
    /// `max_age` parameter; sessions older than this cannot skip `pwd`
    pub max_age: Option<i64>,
}

/// Chooses the next state for an authorize flow
#[derive(Clone, Copy, Default)]
pub struct LoginManager;

impl LoginManager {
    /// Create a new login manager
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Whether the requested level requires a TOTP step for this user
    #[must_use]
    pub fn otp_required(requested_acr: AcrLevel, user: &User) -> bool {
        match requested_acr {
            AcrLevel::Level1 => false,
            AcrLevel::Level2 => user.otp_enabled,
            AcrLevel::Level3 => true,
        }
    }

    /// Whether an existing session can satisfy authentication steps for
    /// this request, before looking at its ACR.
    fn session_usable(input: &LoginInput<'_>) -> bool {
        let Some(session) = input.session else {
            return false;
        };
        if input.prompt == Some("login") {
            return false;
        }
        if let Some(max_age) = input.max_age {
            if Utc::now() - session.started_at > Duration::seconds(max_age) {
                return false;
            }
        }
        true
    }

    /// The transition function.
    ///
    /// | Condition | Next |
    /// |---|---|
    /// | no usable session, or its ACR is below what the request needs | `pwd` |
    /// | password done, level needs TOTP (enabled at 2, always at 3) | `otp` |
    /// | auth done, consent not required, decided in this flow, or a prior grant covers the scope | `issue_code` |
    /// | auth done, no decision yet and no covering grant | `consent` |
    #[must_use]
    pub fn next_step(&self, input: &LoginInput<'_>) -> LoginStep {
        // Until the password step identifies the user, nothing else can run
        let Some(user) = input.user else {
            return LoginStep::Password;
        };

        let otp_required = Self::otp_required(input.auth_context.requested_acr, user);

        // A session covers the request when its ACR reaches the level the
        // required methods imply: 2 when TOTP is required, 1 otherwise.
        let session_covers = Self::session_usable(input)
            && input.session.is_some_and(|session| {
                let needed = if otp_required {
                    AcrLevel::Level2
                } else {
                    AcrLevel::Level1
                };
                session.acr_level >= needed
            });

        if !input.auth_context.pwd_completed && !session_covers {
            return LoginStep::Password;
        }

        if otp_required && !input.auth_context.otp_completed && !session_covers {
            return LoginStep::Otp;
        }

        if !input.client.consent_required {
            return LoginStep::IssueCode;
        }
        // A decision recorded in this flow settles the step even when the
        // user granted only a subset; the code issuer mints the narrowed
        // scope. Otherwise a prior consent must cover the full request.
        if input.auth_context.consented_scope.is_some() {
            return LoginStep::IssueCode;
        }
        let covered = input
            .consent
            .is_some_and(|consent| consent.covers(&input.auth_context.scope));
        if covered {
            LoginStep::IssueCode
        } else {
            LoginStep::Consent
        }
    }

    /// The ordered auth methods an issuing flow performed, combining what
    /// the session already carried with the steps of this flow.
    #[must_use]
    pub fn performed_methods(input: &LoginInput<'_>) -> Vec<AuthMethod> {
        let mut methods = Vec::new();
        if Self::session_usable(input) {
            if let Some(session) = input.session {
                methods = session.methods();
            }
        }
        if input.auth_context.pwd_completed && !methods.contains(&AuthMethod::Pwd) {
            methods.insert(0, AuthMethod::Pwd);
        }
        if input.auth_context.otp_completed && !methods.contains(&AuthMethod::Otp) {
            methods.push(AuthMethod::Otp);
        }
        methods
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn test_user(otp_enabled: bool) -> User {
        User {
            id: Uuid::new_v4(),
            subject: Uuid::new_v4(),
            email: "mauro@x".to_owned(),
            email_verified: true,
            password_hash: String::new(),
            otp_enabled,
            otp_secret: otp_enabled.then(|| "sealed".to_owned()),
            enabled: true,
            given_name: None,
            family_name: None,
            address: None,
            phone_number: None,
            phone_number_verified: false,
            permissions: Vec::new(),
            created_at: Utc::now(),
        }
    }

    fn test_client(consent_required: bool) -> Client {
        Client {
            id: Uuid::new_v4(),
            client_identifier: "test-client-1".to_owned(),
            description: String::new(),
            enabled: true,
            consent_required,
            is_public: false,
            client_secret_hash: None,
            default_acr_level: AcrLevel::Level1,
            authorization_code_enabled: true,
            client_credentials_enabled: false,
            access_token_seconds: None,
            refresh_token_seconds: None,
            redirect_uris: vec!["https://c/cb".to_owned()],
            permissions: Vec::new(),
            created_at: Utc::now(),
        }
    }

    fn test_context(requested_acr: AcrLevel, pwd: bool, otp: bool) -> AuthContext {
        let now = Utc::now();
        AuthContext {
            id: "flow".to_owned(),
            client_id: Uuid::new_v4(),
            user_id: None,
            scope: "openid email".to_owned(),
            consented_scope: None,
            redirect_uri: "https://c/cb".to_owned(),
            response_mode: "query".to_owned(),
            code_challenge: "c".repeat(43),
            code_challenge_method: "S256".to_owned(),
            nonce: None,
            state: None,
            requested_acr,
            pwd_completed: pwd,
            otp_completed: otp,
            pending_otp_secret: None,
            created_at: now,
            expires_at: now + Duration::seconds(600),
        }
    }

    fn test_session(user_id: Uuid, acr: AcrLevel, methods: &str) -> UserSession {
        let now = Utc::now();
        UserSession {
            id: Uuid::new_v4(),
            session_identifier: "sid".to_owned(),
            user_id,
            started_at: now,
            last_accessed_at: now,
            acr_level: acr,
            auth_methods: methods.to_owned(),
            ip_address: None,
            user_agent: None,
        }
    }

    fn input<'a>(
        ctx: &'a AuthContext,
        client: &'a Client,
        user: Option<&'a User>,
        session: Option<&'a UserSession>,
        consent: Option<&'a UserConsent>,
    ) -> LoginInput<'a> {
        LoginInput {
            auth_context: ctx,
            client,
            user,
            session,
            consent,
            prompt: None,
            max_age: None,
        }
    }

    #[test]
    fn anonymous_request_starts_at_password() {
        let ctx = test_context(AcrLevel::Level1, false, false);
        let client = test_client(true);
        let step = LoginManager::new().next_step(&input(&ctx, &client, None, None, None));
        assert_eq!(step, LoginStep::Password);
    }

    #[test]
    fn password_then_consent_for_level_one() {
        let ctx = test_context(AcrLevel::Level1, true, false);
        let client = test_client(true);
        let user = test_user(false);
        let step = LoginManager::new().next_step(&input(&ctx, &client, Some(&user), None, None));
        assert_eq!(step, LoginStep::Consent);
    }

    #[test]
    fn level_two_with_otp_enabled_forces_otp_after_password() {
        let ctx = test_context(AcrLevel::Level2, true, false);
        let client = test_client(true);
        let user = test_user(true);
        let step = LoginManager::new().next_step(&input(&ctx, &client, Some(&user), None, None));
        assert_eq!(step, LoginStep::Otp);
    }

    #[test]
    fn level_two_without_otp_skips_the_otp_step() {
        let ctx = test_context(AcrLevel::Level2, true, false);
        let client = test_client(false);
        let user = test_user(false);
        let step = LoginManager::new().next_step(&input(&ctx, &client, Some(&user), None, None));
        assert_eq!(step, LoginStep::IssueCode);
    }

    #[test]
    fn level_three_forces_enrollment_for_users_without_otp() {
        let ctx = test_context(AcrLevel::Level3, true, false);
        let client = test_client(false);
        let user = test_user(false);
        let step = LoginManager::new().next_step(&input(&ctx, &client, Some(&user), None, None));
        assert_eq!(step, LoginStep::Otp);
    }

    #[test]
    fn sufficient_session_skips_straight_to_issuance() {
        let ctx = test_context(AcrLevel::Level1, false, false);
        let client = test_client(false);
        let user = test_user(false);
        let session = test_session(user.id, AcrLevel::Level1, "pwd");
        let step =
            LoginManager::new().next_step(&input(&ctx, &client, Some(&user), Some(&session), None));
        assert_eq!(step, LoginStep::IssueCode);
    }

    #[test]
    fn weak_session_restarts_at_password_for_higher_acr() {
        let ctx = test_context(AcrLevel::Level2, false, false);
        let client = test_client(false);
        let user = test_user(true);
        let session = test_session(user.id, AcrLevel::Level1, "pwd");
        let step =
            LoginManager::new().next_step(&input(&ctx, &client, Some(&user), Some(&session), None));
        assert_eq!(step, LoginStep::Password);
    }

    #[test]
    fn prompt_login_disables_session_reuse() {
        let ctx = test_context(AcrLevel::Level1, false, false);
        let client = test_client(false);
        let user = test_user(false);
        let session = test_session(user.id, AcrLevel::Level1, "pwd");
        let mut login_input = input(&ctx, &client, Some(&user), Some(&session), None);
        login_input.prompt = Some("login");
        let step = LoginManager::new().next_step(&login_input);
        assert_eq!(step, LoginStep::Password);
    }

    #[test]
    fn full_consent_lets_the_code_issue() {
        let ctx = test_context(AcrLevel::Level1, true, false);
        let client = test_client(true);
        let user = test_user(false);
        let consent = UserConsent {
            id: Uuid::new_v4(),
            user_id: user.id,
            client_id: client.id,
            scope: "openid email profile".to_owned(),
            granted_at: Utc::now(),
        };
        let step =
            LoginManager::new().next_step(&input(&ctx, &client, Some(&user), None, Some(&consent)));
        assert_eq!(step, LoginStep::IssueCode);
    }

    #[test]
    fn stale_partial_consent_reprompts() {
        let ctx = test_context(AcrLevel::Level1, true, false);
        let client = test_client(true);
        let user = test_user(false);
        let consent = UserConsent {
            id: Uuid::new_v4(),
            user_id: user.id,
            client_id: client.id,
            scope: "openid".to_owned(),
            granted_at: Utc::now(),
        };
        let step =
            LoginManager::new().next_step(&input(&ctx, &client, Some(&user), None, Some(&consent)));
        assert_eq!(step, LoginStep::Consent);
    }

    #[test]
    fn partial_grant_decided_in_this_flow_issues_the_code() {
        // Requested "openid email", user unchecked email on the consent
        // page: the recorded decision ends the step, it must not reprompt
        let mut ctx = test_context(AcrLevel::Level1, true, false);
        ctx.consented_scope = Some("openid".to_owned());
        let client = test_client(true);
        let user = test_user(false);
        let consent = UserConsent {
            id: Uuid::new_v4(),
            user_id: user.id,
            client_id: client.id,
            scope: "openid".to_owned(),
            granted_at: Utc::now(),
        };
        let step =
            LoginManager::new().next_step(&input(&ctx, &client, Some(&user), None, Some(&consent)));
        assert_eq!(step, LoginStep::IssueCode);
    }

    #[test]
    fn performed_methods_preserve_pwd_before_otp() {
        let ctx = test_context(AcrLevel::Level2, true, true);
        let client = test_client(false);
        let user = test_user(true);
        let methods =
            LoginManager::performed_methods(&input(&ctx, &client, Some(&user), None, None));
        assert_eq!(methods, vec![AuthMethod::Pwd, AuthMethod::Otp]);
    }
}
