// ABOUTME: HTTP surface of the authorization server, built on warp filters
// ABOUTME: Discovery, JWKS, authorize, pwd/otp/consent steps, token, logout, userinfo
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Portico Project

//! Route layer.
//!
//! Browser-facing steps render minimal inline HTML; everything else speaks
//! JSON. CSRF protection for the form posts is supplied by the surrounding
//! HTTP framework; these handlers only require that rejected submissions
//! never reach them.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use warp::{Filter, Rejection, Reply};

use super::authorize::{AuthorizeError, AuthorizeValidator};
use super::code::{build_error_redirect, CodeIssuer, IssueCodeInput};
use super::endpoints::AuthorizationServer;
use super::login::{LoginInput, LoginManager};
use super::models::{AuthorizeRequest, LoginStep, OAuth2Error, TokenRequest};
use super::validation::{TokenError, TokenValidator};
use crate::cache::SettingsCache;
use crate::context::RequestContext;
use crate::crypto;
use crate::database::{Database, DatabaseProvider};
use crate::jwks::KeyManager;
use crate::models::{AuthContext, AuthMethod, Client, User, UserSession};
use crate::session::SessionManager;

/// Session cookie name
pub const SESSION_COOKIE: &str = "portico_session";
/// In-flight authorize flow cookie name
pub const FLOW_COOKIE: &str = "portico_flow";

/// Lifetime of an in-flight authorize flow
const FLOW_LIFETIME_SECONDS: i64 = 600;

/// Shared state injected into every handler
#[derive(Clone)]
pub struct RouteState {
    /// Repository handle
    pub db: Database,
    /// Signing-key manager
    pub keys: Arc<KeyManager>,
    /// Settings cache
    pub settings: Arc<SettingsCache>,
    /// Session manager
    pub sessions: SessionManager,
}

impl RouteState {
    /// Assemble route state over the shared managers
    #[must_use]
    pub fn new(db: Database, keys: Arc<KeyManager>, settings: Arc<SettingsCache>) -> Self {
        let sessions = SessionManager::new(db.clone());
        Self {
            db,
            keys,
            settings,
            sessions,
        }
    }
}

fn with_state(
    state: RouteState,
) -> impl Filter<Extract = (RouteState,), Error = std::convert::Infallible> + Clone {
    warp::any().map(move || state.clone())
}

/// All routes of the authorization server
pub fn oauth2_routes(
    state: RouteState,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    let discovery = warp::path!(".well-known" / "openid-configuration")
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(handle_discovery);

    let jwks_certs = warp::path!("certs")
        .and(warp::get())
        .and(warp::header::optional::<String>("if-none-match"))
        .and(with_state(state.clone()))
        .and_then(handle_jwks);

    let jwks_well_known = warp::path!(".well-known" / "jwks.json")
        .and(warp::get())
        .and(warp::header::optional::<String>("if-none-match"))
        .and(with_state(state.clone()))
        .and_then(handle_jwks);

    let authorize = warp::path!("auth" / "authorize")
        .and(warp::get())
        .and(warp::query::<HashMap<String, String>>())
        .and(warp::cookie::optional::<String>(SESSION_COOKIE))
        .and(with_state(state.clone()))
        .and_then(handle_authorize);

    let pwd_get = warp::path!("auth" / "pwd")
        .and(warp::get())
        .and(warp::cookie::optional::<String>(FLOW_COOKIE))
        .and(with_state(state.clone()))
        .and_then(handle_pwd_get);

    let pwd_post = warp::path!("auth" / "pwd")
        .and(warp::post())
        .and(warp::body::form::<HashMap<String, String>>())
        .and(warp::cookie::optional::<String>(FLOW_COOKIE))
        .and(warp::cookie::optional::<String>(SESSION_COOKIE))
        .and(with_state(state.clone()))
        .and_then(handle_pwd_post);

    let otp_get = warp::path!("auth" / "otp")
        .and(warp::get())
        .and(warp::cookie::optional::<String>(FLOW_COOKIE))
        .and(with_state(state.clone()))
        .and_then(handle_otp_get);

    let otp_post = warp::path!("auth" / "otp")
        .and(warp::post())
        .and(warp::body::form::<HashMap<String, String>>())
        .and(warp::cookie::optional::<String>(FLOW_COOKIE))
        .and(warp::cookie::optional::<String>(SESSION_COOKIE))
        .and(with_state(state.clone()))
        .and_then(handle_otp_post);

    let consent_get = warp::path!("auth" / "consent")
        .and(warp::get())
        .and(warp::cookie::optional::<String>(FLOW_COOKIE))
        .and(with_state(state.clone()))
        .and_then(handle_consent_get);

    let consent_post = warp::path!("auth" / "consent")
        .and(warp::post())
        .and(warp::body::form::<HashMap<String, String>>())
        .and(warp::cookie::optional::<String>(FLOW_COOKIE))
        .and(warp::cookie::optional::<String>(SESSION_COOKIE))
        .and(with_state(state.clone()))
        .and_then(handle_consent_post);

    let token = warp::path!("auth" / "token")
        .and(warp::post())
        .and(warp::body::form::<HashMap<String, String>>())
        .and(with_state(state.clone()))
        .and_then(handle_token);

    let logout = warp::path!("auth" / "logout")
        .and(warp::get())
        .and(warp::query::<HashMap<String, String>>())
        .and(warp::cookie::optional::<String>(SESSION_COOKIE))
        .and(with_state(state.clone()))
        .and_then(handle_logout);

    let userinfo = warp::path!("auth" / "userinfo")
        .and(warp::post())
        .and(warp::header::optional::<String>("authorization"))
        .and(with_state(state))
        .and_then(handle_userinfo);

    discovery
        .or(jwks_certs)
        .or(jwks_well_known)
        .or(authorize)
        .or(pwd_get)
        .or(pwd_post)
        .or(otp_get)
        .or(otp_post)
        .or(consent_get)
        .or(consent_post)
        .or(token)
        .or(logout)
        .or(userinfo)
}

// ================================
// Reply helpers
// ================================

fn redirect_to(location: &str) -> Box<dyn Reply> {
    Box::new(warp::reply::with_status(
        warp::reply::with_header(warp::reply(), "Location", location.to_owned()),
        warp::http::StatusCode::FOUND,
    ))
}

fn redirect_with_cookie(location: &str, cookie: String) -> Box<dyn Reply> {
    Box::new(warp::reply::with_status(
        warp::reply::with_header(
            warp::reply::with_header(warp::reply(), "Location", location.to_owned()),
            "Set-Cookie",
            cookie,
        ),
        warp::http::StatusCode::FOUND,
    ))
}

fn session_cookie(value: &str) -> String {
    format!("{SESSION_COOKIE}={value}; HttpOnly; Secure; Path=/; SameSite=Lax")
}

fn flow_cookie(value: &str) -> String {
    format!(
        "{FLOW_COOKIE}={value}; HttpOnly; Secure; Path=/auth; SameSite=Lax; Max-Age={FLOW_LIFETIME_SECONDS}"
    )
}

fn clear_session_cookie() -> String {
    format!("{SESSION_COOKIE}=; HttpOnly; Secure; Path=/; SameSite=Lax; Max-Age=0")
}

fn html_page(title: &str, body: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <title>Portico - {title}</title>
    <style>
        body {{ font-family: sans-serif; margin: 40px; }}
        .panel {{ max-width: 420px; margin: 0 auto; padding: 20px; border: 1px solid #ddd; border-radius: 8px; }}
        .form-group {{ margin-bottom: 15px; }}
        label {{ display: block; margin-bottom: 5px; font-weight: bold; }}
        input {{ width: 100%; padding: 8px; border: 1px solid #ccc; border-radius: 4px; }}
        button {{ padding: 10px 20px; border: none; border-radius: 4px; cursor: pointer; }}
        .error {{ color: #a00; background-color: #ffe6e6; padding: 10px; border-radius: 4px; margin-bottom: 15px; }}
    </style>
</head>
<body>
    <div class="panel">
{body}
    </div>
</body>
</html>"#
    )
}

fn error_page(error: &OAuth2Error, status: warp::http::StatusCode) -> Box<dyn Reply> {
    let description = error
        .error_description
        .as_deref()
        .unwrap_or("The request could not be processed.");
    let body = format!(
        "        <h2>Request error</h2>\n        <div class=\"error\"><strong>{}</strong>: {}</div>",
        error.error, description
    );
    Box::new(warp::reply::with_status(
        warp::reply::html(html_page("Error", &body)),
        status,
    ))
}

fn flow_expired_page() -> Box<dyn Reply> {
    error_page(
        &OAuth2Error::invalid_request(
            "The sign-in flow has expired. Return to the application and try again.",
        ),
        warp::http::StatusCode::BAD_REQUEST,
    )
}

fn server_error_page() -> Box<dyn Reply> {
    error_page(
        &OAuth2Error::server_error(),
        warp::http::StatusCode::INTERNAL_SERVER_ERROR,
    )
}

// ================================
// Discovery and JWKS
// ================================

async fn handle_discovery(state: RouteState) -> Result<Box<dyn Reply>, Rejection> {
    let settings = match state.settings.get().await {
        Ok(settings) => settings,
        Err(e) => {
            error!("discovery unavailable: {e}");
            return Ok(server_error_page());
        }
    };
    let issuer = settings.issuer.trim_end_matches('/').to_owned();

    let document = serde_json::json!({
        "issuer": issuer,
        "authorization_endpoint": format!("{issuer}/auth/authorize"),
        "token_endpoint": format!("{issuer}/auth/token"),
        "userinfo_endpoint": format!("{issuer}/auth/userinfo"),
        "end_session_endpoint": format!("{issuer}/auth/logout"),
        "jwks_uri": format!("{issuer}/certs"),
        "grant_types_supported": ["authorization_code", "refresh_token", "client_credentials"],
        "response_types_supported": ["code"],
        "response_modes_supported": ["query", "fragment"],
        "subject_types_supported": ["public"],
        "id_token_signing_alg_values_supported": ["RS256"],
        "scopes_supported": ["openid", "profile", "email", "offline_access", "address", "phone"],
        "acr_values_supported": ["1", "2", "3"],
        "token_endpoint_auth_methods_supported": ["client_secret_post"],
        "code_challenge_methods_supported": ["S256"],
        "claims_supported": [
            "iss", "sub", "aud", "exp", "iat", "auth_time", "nonce", "acr", "amr",
            "email", "email_verified", "name", "given_name", "family_name",
            "address", "phone_number", "phone_number_verified"
        ]
    });

    Ok(Box::new(warp::reply::json(&document)))
}

async fn handle_jwks(
    if_none_match: Option<String>,
    state: RouteState,
) -> Result<Box<dyn Reply>, Rejection> {
    let jwks = state.keys.jwks();
    debug!("JWKS endpoint accessed, returning {} keys", jwks.keys.len());

    let jwks_json = serde_json::to_string(&jwks).map_err(|e| {
        error!("failed to serialize JWKS: {e}");
        warp::reject::reject()
    })?;

    // ETag from content so rotation invalidates client caches immediately
    let mut hasher = Sha256::new();
    hasher.update(jwks_json.as_bytes());
    let hash = hasher.finalize();
    let etag = format!(r#""{}""#, hex::encode(&hash[..16]));

    if let Some(client_etag) = if_none_match {
        if client_etag == etag {
            return Ok(Box::new(warp::reply::with_status(
                warp::reply::with_header(warp::reply(), "ETag", etag),
                warp::http::StatusCode::NOT_MODIFIED,
            )));
        }
    }

    let json = warp::reply::json(&jwks);
    Ok(Box::new(warp::reply::with_header(
        warp::reply::with_header(json, "Cache-Control", "public, max-age=3600"),
        "ETag",
        etag,
    )))
}

// ================================
// Authorize entry point
// ================================

fn parse_authorize_request(
    params: &HashMap<String, String>,
) -> Result<AuthorizeRequest, OAuth2Error> {
    let response_type = params
        .get("response_type")
        .ok_or_else(|| OAuth2Error::invalid_request("Missing response_type parameter"))?
        .clone();
    let client_id = params
        .get("client_id")
        .ok_or_else(|| OAuth2Error::invalid_request("Missing client_id parameter"))?
        .clone();
    let redirect_uri = params
        .get("redirect_uri")
        .ok_or_else(|| OAuth2Error::invalid_request("Missing redirect_uri parameter"))?
        .clone();

    let max_age = match params.get("max_age") {
        None => None,
        Some(raw) => Some(raw.parse::<i64>().map_err(|_| {
            OAuth2Error::invalid_request("max_age must be an integer number of seconds")
        })?),
    };

    Ok(AuthorizeRequest {
        response_type,
        client_id,
        redirect_uri,
        scope: params.get("scope").cloned(),
        state: params.get("state").cloned(),
        nonce: params.get("nonce").cloned(),
        code_challenge: params.get("code_challenge").cloned(),
        code_challenge_method: params.get("code_challenge_method").cloned(),
        acr_values: params.get("acr_values").cloned(),
        response_mode: params.get("response_mode").cloned(),
        prompt: params.get("prompt").cloned(),
        max_age,
    })
}

async fn handle_authorize(
    params: HashMap<String, String>,
    session_cookie_value: Option<String>,
    state: RouteState,
) -> Result<Box<dyn Reply>, Rejection> {
    let request = match parse_authorize_request(&params) {
        Ok(request) => request,
        Err(error) => return Ok(error_page(&error, warp::http::StatusCode::BAD_REQUEST)),
    };

    let validator = AuthorizeValidator::new(state.db.clone());
    let validated = match validator.validate(&request).await {
        Ok(validated) => validated,
        Err(AuthorizeError::Page(error)) => {
            return Ok(error_page(&error, warp::http::StatusCode::BAD_REQUEST));
        }
        Err(AuthorizeError::Redirect {
            redirect_uri,
            response_mode,
            state: client_state,
            error,
        }) => {
            let url = build_error_redirect(
                &redirect_uri,
                &response_mode,
                &error,
                client_state.as_deref(),
            );
            return Ok(redirect_to(&url));
        }
    };

    let now = Utc::now();
    let mut context = AuthContext {
        id: match crypto::generate_session_identifier() {
            Ok(id) => id,
            Err(e) => {
                error!("flow id generation failed: {e}");
                return Ok(server_error_page());
            }
        },
        client_id: validated.client.id,
        user_id: None,
        scope: validated.scope.clone(),
        consented_scope: None,
        redirect_uri: validated.redirect_uri.clone(),
        response_mode: validated.response_mode.clone(),
        code_challenge: validated.code_challenge.clone(),
        code_challenge_method: validated.code_challenge_method.clone(),
        nonce: validated.nonce.clone(),
        state: validated.state.clone(),
        requested_acr: validated.requested_acr,
        pwd_completed: false,
        otp_completed: false,
        pending_otp_secret: None,
        created_at: now,
        expires_at: now + Duration::seconds(FLOW_LIFETIME_SECONDS),
    };

    // A live session may let the flow skip the pwd/otp steps entirely
    let session = resolve_session(&state, session_cookie_value.as_deref()).await;
    if let Some(session) = &session {
        context.user_id = Some(session.user_id);
    }

    if let Err(e) = state.db.create_auth_context(&context).await {
        error!("unable to persist auth context: {e:#}");
        return Ok(server_error_page());
    }

    let reply = advance_flow(
        &state,
        context,
        validated.client,
        session,
        validated.prompt.as_deref(),
        validated.max_age,
    )
    .await;
    Ok(reply)
}

async fn resolve_session(
    state: &RouteState,
    session_cookie_value: Option<&str>,
) -> Option<UserSession> {
    let identifier = session_cookie_value?;
    let settings = state.settings.get().await.ok()?;
    match state.sessions.resolve(identifier, &settings).await {
        Ok(Some(mut session)) => {
            // Any authorized route extends the idle window, throttled to
            // one write per second inside the session manager
            if let Err(e) = state.sessions.touch(&mut session).await {
                warn!("session touch failed: {e}");
            }
            Some(session)
        }
        Ok(None) => None,
        Err(e) => {
            warn!("session resolution failed: {e}");
            None
        }
    }
}

/// Re-evaluate the ladder and either redirect to the next step's page or
/// issue the code. Sets the flow cookie so the step pages can find the
/// context again.
async fn advance_flow(
    state: &RouteState,
    context: AuthContext,
    client: Client,
    session: Option<UserSession>,
    prompt: Option<&str>,
    max_age: Option<i64>,
) -> Box<dyn Reply> {
    let user = match context.user_id {
        Some(user_id) => match state.db.get_user(user_id).await {
            Ok(user) => user,
            Err(e) => {
                error!("user lookup failed: {e:#}");
                return server_error_page();
            }
        },
        None => None,
    };

    let consent = match user.as_ref() {
        Some(user) => match state.db.get_user_consent(user.id, client.id).await {
            Ok(consent) => consent,
            Err(e) => {
                error!("consent lookup failed: {e:#}");
                return server_error_page();
            }
        },
        None => None,
    };

    let input = LoginInput {
        auth_context: &context,
        client: &client,
        user: user.as_ref(),
        session: session.as_ref(),
        consent: consent.as_ref(),
        prompt,
        max_age,
    };

    match LoginManager::new().next_step(&input) {
        LoginStep::Password => redirect_with_cookie("/auth/pwd", flow_cookie(&context.id)),
        LoginStep::Otp => redirect_with_cookie("/auth/otp", flow_cookie(&context.id)),
        LoginStep::Consent => redirect_with_cookie("/auth/consent", flow_cookie(&context.id)),
        LoginStep::IssueCode => {
            let methods = LoginManager::performed_methods(&input);
            let Some(user) = user.as_ref() else {
                // next_step never returns IssueCode without a user
                return server_error_page();
            };
            issue_code_and_redirect(state, &context, &client, user, session.as_ref(), &methods)
                .await
        }
    }
}

async fn issue_code_and_redirect(
    state: &RouteState,
    context: &AuthContext,
    client: &Client,
    user: &User,
    session: Option<&UserSession>,
    methods: &[AuthMethod],
) -> Box<dyn Reply> {
    let settings = match state.settings.get().await {
        Ok(settings) => settings,
        Err(e) => {
            error!("settings unavailable: {e}");
            return server_error_page();
        }
    };

    let issuer = CodeIssuer::new(state.db.clone());
    let issued = match issuer
        .issue(IssueCodeInput {
            auth_context: context,
            client,
            user,
            session,
            methods,
            code_lifetime_seconds: settings.auth_code_seconds,
        })
        .await
    {
        Ok(issued) => issued,
        Err(e) => {
            error!("code issuance failed: {e}");
            return server_error_page();
        }
    };

    // The flow is complete; its context must not be replayable
    if let Err(e) = state.db.delete_auth_context(&context.id).await {
        warn!("unable to delete completed auth context: {e:#}");
    }

    redirect_to(&issued.redirect_url)
}

async fn load_flow(
    state: &RouteState,
    flow_cookie_value: Option<&str>,
) -> Result<Option<AuthContext>, Box<dyn Reply>> {
    let Some(flow_id) = flow_cookie_value else {
        return Ok(None);
    };
    match state.db.get_auth_context(flow_id).await {
        Ok(Some(context)) if context.expires_at > Utc::now() => Ok(Some(context)),
        Ok(_) => Ok(None),
        Err(e) => {
            error!("auth context lookup failed: {e:#}");
            Err(server_error_page())
        }
    }
}

async fn load_flow_client(
    state: &RouteState,
    context: &AuthContext,
) -> Result<Client, Box<dyn Reply>> {
    match state.db.get_client(context.client_id).await {
        Ok(Some(client)) => Ok(client),
        Ok(None) => {
            warn!("client vanished mid-flow");
            Err(flow_expired_page())
        }
        Err(e) => {
            error!("client lookup failed: {e:#}");
            Err(server_error_page())
        }
    }
}

// ================================
// Password step
// ================================

fn pwd_form_html(error: Option<&str>) -> String {
    let error_html = error.map_or(String::new(), |message| {
        format!("        <div class=\"error\">{message}</div>\n")
    });
    let body = format!(
        r#"        <h2>Sign in</h2>
{error_html}        <form method="post" action="/auth/pwd">
            <div class="form-group">
                <label for="email">Email</label>
                <input type="email" id="email" name="email" required autofocus>
            </div>
            <div class="form-group">
                <label for="password">Password</label>
                <input type="password" id="password" name="password" required>
            </div>
            <button type="submit">Sign in</button>
        </form>"#
    );
    html_page("Sign in", &body)
}

async fn handle_pwd_get(
    flow_cookie_value: Option<String>,
    state: RouteState,
) -> Result<Box<dyn Reply>, Rejection> {
    match load_flow(&state, flow_cookie_value.as_deref()).await {
        Ok(Some(_)) => Ok(Box::new(warp::reply::html(pwd_form_html(None)))),
        Ok(None) => Ok(flow_expired_page()),
        Err(reply) => Ok(reply),
    }
}

async fn handle_pwd_post(
    form: HashMap<String, String>,
    flow_cookie_value: Option<String>,
    session_cookie_value: Option<String>,
    state: RouteState,
) -> Result<Box<dyn Reply>, Rejection> {
    let mut context = match load_flow(&state, flow_cookie_value.as_deref()).await {
        Ok(Some(context)) => context,
        Ok(None) => return Ok(flow_expired_page()),
        Err(reply) => return Ok(reply),
    };
    let client = match load_flow_client(&state, &context).await {
        Ok(client) => client,
        Err(reply) => return Ok(reply),
    };

    let (Some(email), Some(password)) = (form.get("email"), form.get("password")) else {
        return Ok(Box::new(warp::reply::with_status(
            warp::reply::html(pwd_form_html(Some("Email and password are required."))),
            warp::http::StatusCode::BAD_REQUEST,
        )));
    };

    let user = match state.db.get_user_by_email(email).await {
        Ok(user) => user.filter(|user| user.enabled),
        Err(e) => {
            error!("user lookup failed: {e:#}");
            return Ok(server_error_page());
        }
    };

    let Some(user) = user else {
        warn!("password authentication failed: unknown or disabled account");
        return Ok(Box::new(warp::reply::with_status(
            warp::reply::html(pwd_form_html(Some("Invalid email or password."))),
            warp::http::StatusCode::UNAUTHORIZED,
        )));
    };

    if !crypto::password::verify_password(password, &user.password_hash).await {
        warn!(user_id = %user.id, "password authentication failed");
        return Ok(Box::new(warp::reply::with_status(
            warp::reply::html(pwd_form_html(Some("Invalid email or password."))),
            warp::http::StatusCode::UNAUTHORIZED,
        )));
    }

    context.user_id = Some(user.id);
    context.pwd_completed = true;
    if let Err(e) = state.db.update_auth_context(&context).await {
        error!("unable to update auth context: {e:#}");
        return Ok(server_error_page());
    }

    // Extend an existing session for the same user, otherwise start one
    let existing = resolve_session(&state, session_cookie_value.as_deref()).await;
    let session = match existing {
        Some(mut session) if session.user_id == user.id => {
            if let Err(e) = state
                .sessions
                .record_auth_method(&mut session, AuthMethod::Pwd)
                .await
            {
                error!("unable to record auth method: {e}");
                return Ok(server_error_page());
            }
            session
        }
        _ => {
            let request_context = RequestContext::anonymous();
            match state
                .sessions
                .create_session(user.id, AuthMethod::Pwd, &request_context)
                .await
            {
                Ok(session) => session,
                Err(e) => {
                    error!("unable to create session: {e}");
                    return Ok(server_error_page());
                }
            }
        }
    };

    let cookie = session_cookie(&session.session_identifier);
    let reply = advance_flow(&state, context, client, Some(session), None, None).await;
    Ok(Box::new(warp::reply::with_header(reply, "Set-Cookie", cookie)))
}

// ================================
// OTP step
// ================================

fn otp_form_html(enrollment: Option<(&str, &str)>, error: Option<&str>) -> String {
    let error_html = error.map_or(String::new(), |message| {
        format!("        <div class=\"error\">{message}</div>\n")
    });
    let enrollment_html = enrollment.map_or(String::new(), |(qr, secret)| {
        format!(
            r#"        <p>Scan the QR code with your authenticator app, or enter the secret manually.</p>
        <img src="{qr}" alt="TOTP enrollment QR code" width="180" height="180">
        <pre class="text-center">{secret}</pre>
"#
        )
    });
    let body = format!(
        r#"        <h2>One-time code</h2>
{error_html}{enrollment_html}        <form method="post" action="/auth/otp">
            <div class="form-group">
                <label for="otp">Code</label>
                <input type="text" id="otp" name="otp" inputmode="numeric" autocomplete="one-time-code" required autofocus>
            </div>
            <button type="submit">Verify</button>
        </form>"#
    );
    html_page("One-time code", &body)
}

async fn handle_otp_get(
    flow_cookie_value: Option<String>,
    state: RouteState,
) -> Result<Box<dyn Reply>, Rejection> {
    let mut context = match load_flow(&state, flow_cookie_value.as_deref()).await {
        Ok(Some(context)) => context,
        Ok(None) => return Ok(flow_expired_page()),
        Err(reply) => return Ok(reply),
    };

    let user = match context.user_id {
        Some(user_id) => match state.db.get_user(user_id).await {
            Ok(Some(user)) => user,
            Ok(None) => return Ok(flow_expired_page()),
            Err(e) => {
                error!("user lookup failed: {e:#}");
                return Ok(server_error_page());
            }
        },
        None => return Ok(flow_expired_page()),
    };

    if user.otp_enabled {
        return Ok(Box::new(warp::reply::html(otp_form_html(None, None))));
    }

    // Forced enrollment: generate a secret, seal it into the flow, and show
    // the provisioning QR. The secret only lands on the user row after the
    // first valid code.
    let settings = match state.settings.get().await {
        Ok(settings) => settings,
        Err(e) => {
            error!("settings unavailable: {e}");
            return Ok(server_error_page());
        }
    };
    let enrollment = match crypto::totp::generate_enrollment(&settings.app_name, &user.email) {
        Ok(enrollment) => enrollment,
        Err(e) => {
            error!("totp enrollment generation failed: {e}");
            return Ok(server_error_page());
        }
    };
    let aes_key = match decode_aes_key(&settings.aes_encryption_key) {
        Ok(key) => key,
        Err(reply) => return Ok(reply),
    };
    let sealed = match crypto::seal_secret(&enrollment.secret_base32, &aes_key) {
        Ok(sealed) => sealed,
        Err(e) => {
            error!("unable to seal totp secret: {e}");
            return Ok(server_error_page());
        }
    };

    context.pending_otp_secret = Some(sealed);
    if let Err(e) = state.db.update_auth_context(&context).await {
        error!("unable to update auth context: {e:#}");
        return Ok(server_error_page());
    }

    Ok(Box::new(warp::reply::html(otp_form_html(
        Some((&enrollment.qr_data_url, &enrollment.secret_base32)),
        None,
    ))))
}

fn decode_aes_key(encoded: &str) -> Result<Vec<u8>, Box<dyn Reply>> {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    STANDARD.decode(encoded).map_err(|e| {
        error!("settings AES key is not valid base64: {e}");
        server_error_page()
    })
}

async fn handle_otp_post(
    form: HashMap<String, String>,
    flow_cookie_value: Option<String>,
    session_cookie_value: Option<String>,
    state: RouteState,
) -> Result<Box<dyn Reply>, Rejection> {
    let mut context = match load_flow(&state, flow_cookie_value.as_deref()).await {
        Ok(Some(context)) => context,
        Ok(None) => return Ok(flow_expired_page()),
        Err(reply) => return Ok(reply),
    };
    let client = match load_flow_client(&state, &context).await {
        Ok(client) => client,
        Err(reply) => return Ok(reply),
    };

    let mut user = match context.user_id {
        Some(user_id) => match state.db.get_user(user_id).await {
            Ok(Some(user)) => user,
            Ok(None) => return Ok(flow_expired_page()),
            Err(e) => {
                error!("user lookup failed: {e:#}");
                return Ok(server_error_page());
            }
        },
        None => return Ok(flow_expired_page()),
    };

    let Some(code) = form.get("otp") else {
        return Ok(Box::new(warp::reply::with_status(
            warp::reply::html(otp_form_html(None, Some("A code is required."))),
            warp::http::StatusCode::BAD_REQUEST,
        )));
    };

    let settings = match state.settings.get().await {
        Ok(settings) => settings,
        Err(e) => {
            error!("settings unavailable: {e}");
            return Ok(server_error_page());
        }
    };
    let aes_key = match decode_aes_key(&settings.aes_encryption_key) {
        Ok(key) => key,
        Err(reply) => return Ok(reply),
    };

    let (sealed_secret, enrolling) = if user.otp_enabled {
        match &user.otp_secret {
            Some(sealed) => (sealed.clone(), false),
            None => {
                error!(user_id = %user.id, "otp enabled but no secret stored");
                return Ok(server_error_page());
            }
        }
    } else {
        match &context.pending_otp_secret {
            Some(sealed) => (sealed.clone(), true),
            // Enrollment starts on the GET; a bare POST has nothing to verify
            None => return Ok(flow_expired_page()),
        }
    };

    let secret = match crypto::open_secret(&sealed_secret, &aes_key) {
        Ok(secret) => secret,
        Err(e) => {
            error!("unable to open totp secret: {e}");
            return Ok(server_error_page());
        }
    };

    if !crypto::totp::verify_code(&secret, code) {
        warn!(user_id = %user.id, "totp verification failed");
        return Ok(Box::new(warp::reply::with_status(
            warp::reply::html(otp_form_html(None, Some("That code was not valid."))),
            warp::http::StatusCode::UNAUTHORIZED,
        )));
    }

    if enrolling {
        user.otp_enabled = true;
        user.otp_secret = Some(sealed_secret);
        if let Err(e) = state.db.update_user(&user).await {
            error!("unable to persist otp enrollment: {e:#}");
            return Ok(server_error_page());
        }
        info!(
            target: "audit",
            event = "otp_enrolled",
            user_id = %user.id,
            "totp enrollment completed"
        );
    }

    context.otp_completed = true;
    context.pending_otp_secret = None;
    if let Err(e) = state.db.update_auth_context(&context).await {
        error!("unable to update auth context: {e:#}");
        return Ok(server_error_page());
    }

    let session = match resolve_session(&state, session_cookie_value.as_deref()).await {
        Some(mut session) if session.user_id == user.id => {
            if let Err(e) = state
                .sessions
                .record_auth_method(&mut session, AuthMethod::Otp)
                .await
            {
                error!("unable to record auth method: {e}");
                return Ok(server_error_page());
            }
            Some(session)
        }
        other => other,
    };

    let reply = advance_flow(&state, context, client, session, None, None).await;
    Ok(reply)
}

// ================================
// Consent step
// ================================

fn consent_form_html(client_description: &str, scope_tokens: &[&str]) -> String {
    let mut checkboxes = String::new();
    for (index, token) in scope_tokens.iter().enumerate() {
        checkboxes.push_str(&format!(
            r#"            <div class="form-group">
                <label><input type="checkbox" name="consent{index}" checked> {token}</label>
            </div>
"#
        ));
    }
    let body = format!(
        r#"        <h2>Consent</h2>
        <p><strong>{client_description}</strong> is requesting access to:</p>
        <form method="post" action="/auth/consent">
{checkboxes}            <button type="submit" name="btnSubmit" value="submit">Allow</button>
            <button type="submit" name="btnCancel" value="cancel">Cancel</button>
        </form>"#
    );
    html_page("Consent", &body)
}

async fn handle_consent_get(
    flow_cookie_value: Option<String>,
    state: RouteState,
) -> Result<Box<dyn Reply>, Rejection> {
    let context = match load_flow(&state, flow_cookie_value.as_deref()).await {
        Ok(Some(context)) => context,
        Ok(None) => return Ok(flow_expired_page()),
        Err(reply) => return Ok(reply),
    };
    let client = match load_flow_client(&state, &context).await {
        Ok(client) => client,
        Err(reply) => return Ok(reply),
    };

    let tokens: Vec<&str> = context.scope.split_whitespace().collect();
    Ok(Box::new(warp::reply::html(consent_form_html(
        &client.description,
        &tokens,
    ))))
}

async fn handle_consent_post(
    form: HashMap<String, String>,
    flow_cookie_value: Option<String>,
    session_cookie_value: Option<String>,
    state: RouteState,
) -> Result<Box<dyn Reply>, Rejection> {
    let mut context = match load_flow(&state, flow_cookie_value.as_deref()).await {
        Ok(Some(context)) => context,
        Ok(None) => return Ok(flow_expired_page()),
        Err(reply) => return Ok(reply),
    };
    let client = match load_flow_client(&state, &context).await {
        Ok(client) => client,
        Err(reply) => return Ok(reply),
    };

    let tokens: Vec<&str> = context.scope.split_whitespace().collect();

    let cancelled = form.contains_key("btnCancel");
    let granted: Vec<&str> = tokens
        .iter()
        .enumerate()
        .filter(|(index, _)| form.contains_key(&format!("consent{index}")))
        .map(|(_, token)| *token)
        .collect();

    if cancelled || granted.is_empty() {
        if let Err(e) = state.db.delete_auth_context(&context.id).await {
            warn!("unable to delete cancelled auth context: {e:#}");
        }
        let url = build_error_redirect(
            &context.redirect_uri,
            &context.response_mode,
            &OAuth2Error::access_denied("The user declined the request"),
            context.state.as_deref(),
        );
        return Ok(redirect_to(&url));
    }

    let Some(user_id) = context.user_id else {
        return Ok(flow_expired_page());
    };

    let consented_scope = granted.join(" ");
    let consent = crate::models::UserConsent {
        id: Uuid::new_v4(),
        user_id,
        client_id: client.id,
        scope: consented_scope.clone(),
        granted_at: Utc::now(),
    };
    if let Err(e) = state.db.save_user_consent(&consent).await {
        error!("unable to save consent: {e:#}");
        return Ok(server_error_page());
    }

    context.consented_scope = Some(consented_scope);
    if let Err(e) = state.db.update_auth_context(&context).await {
        error!("unable to update auth context: {e:#}");
        return Ok(server_error_page());
    }

    let session = resolve_session(&state, session_cookie_value.as_deref()).await;
    let reply = advance_flow(&state, context, client, session, None, None).await;
    Ok(reply)
}

// ================================
// Token endpoint
// ================================

fn parse_token_request(form: &HashMap<String, String>) -> Result<TokenRequest, OAuth2Error> {
    let grant_type = form
        .get("grant_type")
        .ok_or_else(|| OAuth2Error::invalid_request("Missing grant_type parameter"))?
        .clone();
    let client_id = form
        .get("client_id")
        .ok_or_else(|| OAuth2Error::invalid_request("Missing client_id parameter"))?
        .clone();

    Ok(TokenRequest {
        grant_type,
        code: form.get("code").cloned(),
        redirect_uri: form.get("redirect_uri").cloned(),
        client_id,
        client_secret: form.get("client_secret").cloned(),
        scope: form.get("scope").cloned(),
        refresh_token: form.get("refresh_token").cloned(),
        code_verifier: form.get("code_verifier").cloned(),
    })
}

async fn handle_token(
    form: HashMap<String, String>,
    state: RouteState,
) -> Result<Box<dyn Reply>, Rejection> {
    let request = match parse_token_request(&form) {
        Ok(request) => request,
        Err(error) => {
            let status = warp::http::StatusCode::from_u16(error.http_status())
                .unwrap_or(warp::http::StatusCode::BAD_REQUEST);
            return Ok(Box::new(warp::reply::with_status(
                warp::reply::json(&error),
                status,
            )));
        }
    };

    let server = AuthorizationServer::new(
        state.db.clone(),
        state.keys.clone(),
        state.settings.clone(),
    );

    match server.token(request).await {
        Ok(response) => Ok(Box::new(warp::reply::with_status(
            warp::reply::json(&response),
            warp::http::StatusCode::OK,
        ))),
        Err(error) => {
            let status = warp::http::StatusCode::from_u16(error.http_status())
                .unwrap_or(warp::http::StatusCode::BAD_REQUEST);
            Ok(Box::new(warp::reply::with_status(
                warp::reply::json(&error),
                status,
            )))
        }
    }
}

// ================================
// Logout
// ================================

async fn handle_logout(
    params: HashMap<String, String>,
    session_cookie_value: Option<String>,
    state: RouteState,
) -> Result<Box<dyn Reply>, Rejection> {
    if let Some(identifier) = session_cookie_value.as_deref() {
        if let Err(e) = state.sessions.terminate(identifier).await {
            error!("logout failed: {e}");
            return Ok(server_error_page());
        }
        info!(target: "audit", event = "logout", "user logged out");
    }

    // The post-logout redirect is honored only when it is a registered
    // redirect URI of the named client; anything else falls back to /.
    let destination = match (
        params.get("client_id"),
        params.get("post_logout_redirect_uri"),
    ) {
        (Some(client_id), Some(uri)) => {
            match state.db.get_client_by_identifier(client_id).await {
                Ok(Some(client)) if client.has_redirect_uri(uri) => uri.clone(),
                _ => "/".to_owned(),
            }
        }
        _ => "/".to_owned(),
    };

    Ok(redirect_with_cookie(&destination, clear_session_cookie()))
}

// ================================
// Userinfo
// ================================

fn unauthorized_bearer(error: &TokenError) -> Box<dyn Reply> {
    let body = OAuth2Error::invalid_token(&error.to_string());
    Box::new(warp::reply::with_status(
        warp::reply::with_header(
            warp::reply::json(&body),
            "WWW-Authenticate",
            format!(r#"Bearer error="invalid_token", error_description="{}""#, error.code()),
        ),
        warp::http::StatusCode::UNAUTHORIZED,
    ))
}

async fn handle_userinfo(
    auth_header: Option<String>,
    state: RouteState,
) -> Result<Box<dyn Reply>, Rejection> {
    let Some(token) = auth_header
        .as_deref()
        .and_then(|header| header.strip_prefix("Bearer "))
    else {
        let body = OAuth2Error::invalid_token("Bearer token is required");
        return Ok(Box::new(warp::reply::with_status(
            warp::reply::with_header(
                warp::reply::json(&body),
                "WWW-Authenticate",
                r#"Bearer error="invalid_token""#,
            ),
            warp::http::StatusCode::UNAUTHORIZED,
        )));
    };

    let settings = match state.settings.get().await {
        Ok(settings) => settings,
        Err(e) => {
            error!("settings unavailable: {e}");
            return Ok(server_error_page());
        }
    };

    let claims = match TokenValidator::new().validate(
        &state.keys,
        &settings.issuer,
        token,
        None,
        Some("openid"),
    ) {
        Ok(claims) => claims,
        Err(error) => {
            debug!("userinfo token rejected: {error}");
            return Ok(unauthorized_bearer(&error));
        }
    };

    let subject = match Uuid::parse_str(&claims.sub) {
        Ok(subject) => subject,
        Err(_) => {
            return Ok(unauthorized_bearer(&TokenError::Malformed {
                details: "subject is not a user".to_owned(),
            }));
        }
    };

    let user = match state.db.get_user_by_subject(subject).await {
        Ok(Some(user)) if user.enabled => user,
        Ok(_) => {
            return Ok(unauthorized_bearer(&TokenError::Malformed {
                details: "subject no longer resolves to an enabled user".to_owned(),
            }));
        }
        Err(e) => {
            error!("user lookup failed: {e:#}");
            return Ok(server_error_page());
        }
    };

    let has = |scope: &str| claims.scope.split_whitespace().any(|token| token == scope);
    let mut map = serde_json::Map::new();
    map.insert("sub".to_owned(), serde_json::json!(claims.sub));
    if has("email") {
        map.insert("email".to_owned(), serde_json::json!(user.email));
        map.insert(
            "email_verified".to_owned(),
            serde_json::json!(user.email_verified),
        );
    }
    if has("profile") {
        if let Some(name) = user.full_name() {
            map.insert("name".to_owned(), serde_json::json!(name));
        }
        if let Some(given_name) = &user.given_name {
            map.insert("given_name".to_owned(), serde_json::json!(given_name));
        }
        if let Some(family_name) = &user.family_name {
            map.insert("family_name".to_owned(), serde_json::json!(family_name));
        }
    }
    if has("address") {
        if let Some(address) = &user.address {
            map.insert("address".to_owned(), serde_json::json!(address));
        }
    }
    if has("phone") {
        if let Some(phone_number) = &user.phone_number {
            map.insert("phone_number".to_owned(), serde_json::json!(phone_number));
            map.insert(
                "phone_number_verified".to_owned(),
                serde_json::json!(user.phone_number_verified),
            );
        }
    }

    Ok(Box::new(warp::reply::json(&serde_json::Value::Object(map))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authorize_request_requires_core_parameters() {
        let mut params = HashMap::new();
        params.insert("response_type".to_owned(), "code".to_owned());
        params.insert("client_id".to_owned(), "c".to_owned());
        assert!(parse_authorize_request(&params).is_err());

        params.insert("redirect_uri".to_owned(), "https://c/cb".to_owned());
        assert!(parse_authorize_request(&params).is_ok());
    }

    #[test]
    fn malformed_max_age_is_rejected() {
        let mut params = HashMap::new();
        params.insert("response_type".to_owned(), "code".to_owned());
        params.insert("client_id".to_owned(), "c".to_owned());
        params.insert("redirect_uri".to_owned(), "https://c/cb".to_owned());
        params.insert("max_age".to_owned(), "soon".to_owned());
        assert!(parse_authorize_request(&params).is_err());
    }

    #[test]
    fn token_request_parses_optional_fields() {
        let mut form = HashMap::new();
        form.insert("grant_type".to_owned(), "authorization_code".to_owned());
        form.insert("client_id".to_owned(), "c".to_owned());
        let request = parse_token_request(&form).unwrap();
        assert!(request.client_secret.is_none());
        assert!(request.code.is_none());
    }
}
