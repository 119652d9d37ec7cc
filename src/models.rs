// ABOUTME: Core domain entities for the authorization server
// ABOUTME: Users, clients, codes, sessions, consents, refresh tokens, key pairs, settings
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Portico Project

//! Domain model shared by the authorize pipeline, token pipeline, session
//! manager, and repository layer. These are the persisted shapes; wire types
//! live in [`crate::oauth2::models`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{AppError, AppResult};

/// Authentication Context Class Reference level.
///
/// Level 1 is password only, level 2 adds TOTP when the user has it enabled,
/// level 3 requires TOTP and forces enrollment when missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AcrLevel {
    /// Password only
    Level1,
    /// Password, plus TOTP when enabled
    Level2,
    /// Password plus TOTP, enrolling if necessary
    Level3,
}

impl AcrLevel {
    /// String form used in `acr` claims and `acr_values` parameters
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Level1 => "1",
            Self::Level2 => "2",
            Self::Level3 => "3",
        }
    }

    /// Parse a single `acr_values` token
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "1" => Some(Self::Level1),
            "2" => Some(Self::Level2),
            "3" => Some(Self::Level3),
            _ => None,
        }
    }
}

/// Authentication method reference (`amr` claim member)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthMethod {
    /// Password authentication
    Pwd,
    /// Time-based one-time password
    Otp,
}

impl AuthMethod {
    /// String form used in `amr` claims
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pwd => "pwd",
            Self::Otp => "otp",
        }
    }

    /// Parse a single `amr` token
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pwd" => Some(Self::Pwd),
            "otp" => Some(Self::Otp),
            _ => None,
        }
    }
}

/// Join an ordered set of auth methods into the space-separated `amr` form
#[must_use]
pub fn join_auth_methods(methods: &[AuthMethod]) -> String {
    methods
        .iter()
        .map(|m| m.as_str())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parse a space-separated `amr` string, dropping unknown tokens
#[must_use]
pub fn parse_auth_methods(value: &str) -> Vec<AuthMethod> {
    value.split_whitespace().filter_map(AuthMethod::parse).collect()
}

/// The minimum ACR level that a set of performed auth methods satisfies
#[must_use]
pub fn acr_for_methods(methods: &[AuthMethod]) -> AcrLevel {
    if methods.contains(&AuthMethod::Otp) {
        AcrLevel::Level2
    } else {
        AcrLevel::Level1
    }
}

/// Signing key lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyState {
    /// Retired signing key, retained for verification only
    Previous,
    /// The active signing key
    Current,
    /// Pre-published key, promoted to current on rotation
    Next,
}

impl KeyState {
    /// Stable string form persisted in the key store
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Previous => "previous",
            Self::Current => "current",
            Self::Next => "next",
        }
    }

    /// Parse the persisted form
    pub fn parse(value: &str) -> AppResult<Self> {
        match value {
            "previous" => Ok(Self::Previous),
            "current" => Ok(Self::Current),
            "next" => Ok(Self::Next),
            other => Err(AppError::internal(format!("unknown key state: {other}"))),
        }
    }
}

/// End-user account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    /// Primary key
    pub id: Uuid,
    /// Stable OIDC subject identifier
    pub subject: Uuid,
    /// Email address (login identifier)
    pub email: String,
    /// Whether the email address has been verified
    pub email_verified: bool,
    /// bcrypt password hash
    pub password_hash: String,
    /// Whether TOTP is enabled for this user
    pub otp_enabled: bool,
    /// TOTP secret, AES-256-GCM encrypted with the settings key (base64)
    pub otp_secret: Option<String>,
    /// Whether the account can authenticate
    pub enabled: bool,
    /// Given name (`profile` scope)
    pub given_name: Option<String>,
    /// Family name (`profile` scope)
    pub family_name: Option<String>,
    /// Postal address (`address` scope)
    pub address: Option<String>,
    /// Phone number (`phone` scope)
    pub phone_number: Option<String>,
    /// Whether the phone number has been verified
    pub phone_number_verified: bool,
    /// Permissions granted directly to the user
    pub permissions: Vec<Permission>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

impl User {
    /// Full display name assembled from profile fields
    #[must_use]
    pub fn full_name(&self) -> Option<String> {
        match (&self.given_name, &self.family_name) {
            (Some(given), Some(family)) => Some(format!("{given} {family}")),
            (Some(given), None) => Some(given.clone()),
            (None, Some(family)) => Some(family.clone()),
            (None, None) => None,
        }
    }
}

/// Registered OAuth client application
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Client {
    /// Primary key
    pub id: Uuid,
    /// Public client identifier (`client_id` on the wire)
    pub client_identifier: String,
    /// Free-form description shown on the consent page
    pub description: String,
    /// Whether the client may participate in any flow
    pub enabled: bool,
    /// Whether the consent step is required for this client
    pub consent_required: bool,
    /// Public clients have no secret and must use PKCE
    pub is_public: bool,
    /// bcrypt hash of the client secret (confidential clients only)
    pub client_secret_hash: Option<String>,
    /// ACR level applied when the request carries no `acr_values`
    pub default_acr_level: AcrLevel,
    /// Whether the authorization-code grant is enabled
    pub authorization_code_enabled: bool,
    /// Whether the client-credentials grant is enabled
    pub client_credentials_enabled: bool,
    /// Access-token lifetime override in seconds
    pub access_token_seconds: Option<i64>,
    /// Refresh-token lifetime override in seconds
    pub refresh_token_seconds: Option<i64>,
    /// Registered redirect URIs (exact-match set)
    pub redirect_uris: Vec<String>,
    /// Permissions the client itself holds (client-credentials audience)
    pub permissions: Vec<Permission>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

impl Client {
    /// Whether `redirect_uri` exactly matches a registered URI
    #[must_use]
    pub fn has_redirect_uri(&self, redirect_uri: &str) -> bool {
        self.redirect_uris.iter().any(|uri| uri == redirect_uri)
    }
}

/// Protected resource (API) that permissions belong to
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    /// Primary key
    pub id: Uuid,
    /// Identifier used as the left side of `resource:permission` scopes
    pub resource_identifier: String,
    /// Free-form description
    pub description: String,
}

/// Permission on a resource; flat projection of the resource join
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Permission {
    /// Primary key
    pub id: Uuid,
    /// Identifier used as the right side of `resource:permission` scopes
    pub permission_identifier: String,
    /// Free-form description shown on the consent page
    pub description: String,
    /// Owning resource
    pub resource_id: Uuid,
    /// Owning resource's identifier, joined in by the repository
    pub resource_identifier: String,
}

impl Permission {
    /// The `resource:permission` scope token for this permission
    #[must_use]
    pub fn scope_token(&self) -> String {
        format!("{}:{}", self.resource_identifier, self.permission_identifier)
    }
}

/// Authorization code issued by the authorize pipeline.
///
/// Only the SHA-256 hash of the code is ever persisted; the plaintext exists
/// solely inside the redirect to the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthCode {
    /// Primary key
    pub id: Uuid,
    /// SHA-256 of the plaintext code, hex encoded
    pub code_hash: String,
    /// Issuing client
    pub client_id: Uuid,
    /// Authenticated user
    pub user_id: Uuid,
    /// Granted scope (consented subset of the request)
    pub scope: String,
    /// Redirect URI the code was issued for
    pub redirect_uri: String,
    /// PKCE challenge (base64url, no padding)
    pub code_challenge: String,
    /// PKCE challenge method; always `S256`
    pub code_challenge_method: String,
    /// OIDC nonce echoed into the ID token
    pub nonce: Option<String>,
    /// Client state echoed on the redirect
    pub state: Option<String>,
    /// ACR level satisfied when the code was issued
    pub acr_level: AcrLevel,
    /// Ordered auth methods performed, space-joined (`pwd otp`)
    pub auth_methods: String,
    /// Session the code was issued under
    pub session_identifier: Option<String>,
    /// Moment of the authentication, for the `auth_time` claim
    pub auth_time: DateTime<Utc>,
    /// Issuance timestamp
    pub issued_at: DateTime<Utc>,
    /// Expiry; at most 60 seconds after issuance
    pub expires_at: DateTime<Utc>,
    /// Whether the code has been consumed
    pub used: bool,
}

/// Server-side authenticated session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSession {
    /// Primary key
    pub id: Uuid,
    /// Opaque 192-bit identifier stored in the session cookie
    pub session_identifier: String,
    /// Owning user
    pub user_id: Uuid,
    /// Session start
    pub started_at: DateTime<Utc>,
    /// Last activity; drives idle expiry
    pub last_accessed_at: DateTime<Utc>,
    /// ACR level the accumulated auth methods satisfy
    pub acr_level: AcrLevel,
    /// Ordered auth methods performed, space-joined
    pub auth_methods: String,
    /// Client IP captured at creation
    pub ip_address: Option<String>,
    /// User agent captured at creation
    pub user_agent: Option<String>,
}

impl UserSession {
    /// Parsed auth-method set
    #[must_use]
    pub fn methods(&self) -> Vec<AuthMethod> {
        parse_auth_methods(&self.auth_methods)
    }
}

/// Recorded user consent for a client/scope pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConsent {
    /// Primary key
    pub id: Uuid,
    /// Consenting user
    pub user_id: Uuid,
    /// Client the consent was granted to
    pub client_id: Uuid,
    /// Granted scope (subset of what the client may request)
    pub scope: String,
    /// Grant timestamp
    pub granted_at: DateTime<Utc>,
}

impl UserConsent {
    /// Whether this consent covers every token of `requested_scope`
    #[must_use]
    pub fn covers(&self, requested_scope: &str) -> bool {
        let granted: Vec<&str> = self.scope.split_whitespace().collect();
        requested_scope
            .split_whitespace()
            .all(|token| granted.contains(&token))
    }
}

/// Refresh token row; the opaque token itself is stored hashed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshToken {
    /// Primary key
    pub id: Uuid,
    /// Unique token identifier, also embedded in the access token as `jti`
    pub jti: Uuid,
    /// SHA-256 of the opaque token, hex encoded
    pub token_hash: String,
    /// Subject user; `None` is never issued today but kept for symmetry
    pub user_id: Uuid,
    /// Issuing client
    pub client_id: Uuid,
    /// Scope carried over from the code exchange
    pub scope: String,
    /// Session the token was issued under; revoked together on logout
    pub session_identifier: Option<String>,
    /// ACR level at issuance, propagated on rotation
    pub acr_level: AcrLevel,
    /// Auth methods at issuance, space-joined
    pub auth_methods: String,
    /// Issuance timestamp
    pub issued_at: DateTime<Utc>,
    /// Expiry timestamp
    pub expires_at: DateTime<Utc>,
    /// Whether the token has been rotated away or revoked
    pub revoked: bool,
}

/// RSA signing key pair with lifecycle state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyPair {
    /// Primary key
    pub id: Uuid,
    /// Key identifier published in JWS headers and the JWKS
    pub kid: String,
    /// Lifecycle state
    pub state: KeyState,
    /// Signing algorithm; always RS256
    pub algorithm: String,
    /// PKCS#8 private key PEM
    pub private_key_pem: String,
    /// SPKI public key PEM
    pub public_key_pem: String,
    /// Public JWK document (JSON)
    pub public_key_jwk: String,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

/// Password complexity policy applied at registration and password change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PasswordPolicy {
    /// Minimum 6 characters
    Low,
    /// Minimum 8 characters, at least one digit
    Medium,
    /// Minimum 12 characters, at least one digit and one uppercase letter
    High,
}

impl PasswordPolicy {
    /// Stable string form persisted in settings
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    /// Parse the persisted form
    pub fn parse(value: &str) -> AppResult<Self> {
        match value {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(AppError::internal(format!(
                "unknown password policy: {other}"
            ))),
        }
    }

    /// Check a candidate password against the policy
    #[must_use]
    pub fn accepts(self, password: &str) -> bool {
        let has_digit = password.chars().any(|c| c.is_ascii_digit());
        let has_upper = password.chars().any(char::is_uppercase);
        match self {
            Self::Low => password.len() >= 6,
            Self::Medium => password.len() >= 8 && has_digit,
            Self::High => password.len() >= 12 && has_digit && has_upper,
        }
    }
}

/// Singleton server settings, seeded at first boot and mutable by admins
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Primary key (always the same row)
    pub id: Uuid,
    /// Application name shown in TOTP provisioning
    pub app_name: String,
    /// Token issuer (`iss` claim)
    pub issuer: String,
    /// Password complexity policy
    pub password_policy: PasswordPolicy,
    /// AES-256-GCM key for secrets at rest (base64)
    pub aes_encryption_key: String,
    /// HMAC key for the cookie layer (base64)
    pub session_authentication_key: String,
    /// Encryption key for the cookie layer (base64)
    pub session_encryption_key: String,
    /// Access-token lifetime in seconds
    pub access_token_seconds: i64,
    /// Refresh-token lifetime in seconds
    pub refresh_token_seconds: i64,
    /// Authorization-code lifetime in seconds
    pub auth_code_seconds: i64,
    /// Session idle timeout in seconds
    pub session_idle_seconds: i64,
    /// Session absolute lifetime in seconds
    pub session_max_seconds: i64,
}

/// In-flight authorize request, persisted server-side between the
/// authorize redirect and the pwd/otp/consent form posts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthContext {
    /// Opaque identifier stored in the flow cookie
    pub id: String,
    /// Target client
    pub client_id: Uuid,
    /// Authenticated user, set after the password step
    pub user_id: Option<Uuid>,
    /// Requested scope
    pub scope: String,
    /// Scope the user actually consented to
    pub consented_scope: Option<String>,
    /// Validated redirect URI
    pub redirect_uri: String,
    /// Response mode: `query` or `fragment`
    pub response_mode: String,
    /// PKCE challenge
    pub code_challenge: String,
    /// PKCE method; always `S256`
    pub code_challenge_method: String,
    /// OIDC nonce
    pub nonce: Option<String>,
    /// Client state
    pub state: Option<String>,
    /// Highest requested ACR level
    pub requested_acr: AcrLevel,
    /// Whether the password step completed in this flow
    pub pwd_completed: bool,
    /// Whether the TOTP step completed in this flow
    pub otp_completed: bool,
    /// Sealed TOTP secret awaiting enrollment confirmation
    pub pending_otp_secret: Option<String>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Flow expiry; stale flows are swept
    pub expires_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acr_levels_order_by_strength() {
        assert!(AcrLevel::Level1 < AcrLevel::Level2);
        assert!(AcrLevel::Level2 < AcrLevel::Level3);
        assert_eq!(AcrLevel::parse("2"), Some(AcrLevel::Level2));
        assert_eq!(AcrLevel::parse("urn:unknown"), None);
    }

    #[test]
    fn auth_methods_round_trip_the_amr_form() {
        let methods = vec![AuthMethod::Pwd, AuthMethod::Otp];
        let joined = join_auth_methods(&methods);
        assert_eq!(joined, "pwd otp");
        assert_eq!(parse_auth_methods(&joined), methods);
    }

    #[test]
    fn accumulated_methods_determine_acr() {
        assert_eq!(acr_for_methods(&[AuthMethod::Pwd]), AcrLevel::Level1);
        assert_eq!(
            acr_for_methods(&[AuthMethod::Pwd, AuthMethod::Otp]),
            AcrLevel::Level2
        );
    }

    #[test]
    fn consent_coverage_is_subset_based() {
        let consent = UserConsent {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            client_id: Uuid::new_v4(),
            scope: "openid email authserver:account".to_owned(),
            granted_at: Utc::now(),
        };
        assert!(consent.covers("openid email"));
        assert!(consent.covers("authserver:account openid"));
        assert!(!consent.covers("openid profile"));
    }

    #[test]
    fn password_policy_thresholds() {
        assert!(PasswordPolicy::Low.accepts("abc123"));
        assert!(!PasswordPolicy::Low.accepts("abc"));
        assert!(PasswordPolicy::Medium.accepts("abcdefg1"));
        assert!(!PasswordPolicy::Medium.accepts("abcdefgh"));
        assert!(PasswordPolicy::High.accepts("Abcdefghijk1"));
        assert!(!PasswordPolicy::High.accepts("abcdefghijk1"));
    }
}
