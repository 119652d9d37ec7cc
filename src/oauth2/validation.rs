// ABOUTME: Access-token validation with typed errors for precise failure reporting
// ABOUTME: Two-phase check: signature first, then expiry/issuer/audience/scope
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Portico Project

use std::fmt::{self, Display};

use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, Validation};
use tracing::debug;

use super::models::AccessTokenClaims;
use crate::jwks::KeyManager;

/// Typed validation failure
#[derive(Debug, Clone)]
pub enum TokenError {
    /// Not a parseable JWS, or missing required header fields
    Malformed {
        /// What was wrong with it
        details: String,
    },
    /// The header `kid` is not in the key ring
    UnknownKid {
        /// The unrecognised key id
        kid: String,
    },
    /// Signature verification failed
    InvalidSignature,
    /// The token has expired
    Expired {
        /// When the token expired
        expired_at: DateTime<Utc>,
    },
    /// `nbf` lies in the future
    NotYetValid,
    /// `iss` does not equal the configured issuer
    IssuerMismatch,
    /// The required audience is not in `aud`
    AudienceMismatch {
        /// The audience the caller required
        required: String,
    },
    /// The required scope token is not in `scope`
    ScopeMissing {
        /// The scope the caller required
        required: String,
    },
}

impl TokenError {
    /// Stable error identifier, used in logs and `WWW-Authenticate` output
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Malformed { .. } => "malformed",
            Self::UnknownKid { .. } => "unknown_kid",
            Self::InvalidSignature => "invalid_signature",
            Self::Expired { .. } => "expired",
            Self::NotYetValid => "not_yet_valid",
            Self::IssuerMismatch => "issuer_mismatch",
            Self::AudienceMismatch { .. } => "audience_mismatch",
            Self::ScopeMissing { .. } => "scope_missing",
        }
    }
}

impl Display for TokenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed { details } => write!(f, "token is malformed: {details}"),
            Self::UnknownKid { kid } => write!(f, "token kid '{kid}' is not a known key"),
            Self::InvalidSignature => write!(f, "token signature verification failed"),
            Self::Expired { expired_at } => {
                write!(f, "token expired at {}", expired_at.to_rfc3339())
            }
            Self::NotYetValid => write!(f, "token is not yet valid (nbf in the future)"),
            Self::IssuerMismatch => write!(f, "token issuer does not match this server"),
            Self::AudienceMismatch { required } => {
                write!(f, "token audience does not include '{required}'")
            }
            Self::ScopeMissing { required } => {
                write!(f, "token scope does not include '{required}'")
            }
        }
    }
}

impl std::error::Error for TokenError {}

/// Validates access tokens against the key ring and configured issuer
#[derive(Clone, Copy, Default)]
pub struct TokenValidator;

impl TokenValidator {
    /// Create a new validator
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validate a token: signature, issuer, expiry, `nbf`, and optionally
    /// audience membership and scope containment.
    ///
    /// # Errors
    /// Returns a [`TokenError`] naming the first check that failed.
    pub fn validate(
        &self,
        keys: &KeyManager,
        issuer: &str,
        token: &str,
        required_audience: Option<&str>,
        required_scope: Option<&str>,
    ) -> Result<AccessTokenClaims, TokenError> {
        let claims = Self::decode_claims(keys, token)?;

        let now = Utc::now();
        if claims.exp <= now.timestamp() {
            let expired_at = DateTime::from_timestamp(claims.exp, 0).unwrap_or(now);
            debug!(sub = %claims.sub, "token expired");
            return Err(TokenError::Expired { expired_at });
        }
        if let Some(nbf) = claims.nbf {
            if nbf > now.timestamp() {
                return Err(TokenError::NotYetValid);
            }
        }

        if claims.iss != issuer {
            return Err(TokenError::IssuerMismatch);
        }

        if let Some(audience) = required_audience {
            if !claims.aud.iter().any(|a| a == audience) {
                return Err(TokenError::AudienceMismatch {
                    required: audience.to_owned(),
                });
            }
        }

        if let Some(scope) = required_scope {
            if !claims.scope.split_whitespace().any(|token| token == scope) {
                return Err(TokenError::ScopeMissing {
                    required: scope.to_owned(),
                });
            }
        }

        Ok(claims)
    }

    /// Decode and signature-check a token without expiry validation, so the
    /// caller can produce a precise expiry error.
    fn decode_claims(keys: &KeyManager, token: &str) -> Result<AccessTokenClaims, TokenError> {
        let header = jsonwebtoken::decode_header(token).map_err(|e| TokenError::Malformed {
            details: format!("failed to decode header: {e}"),
        })?;
        let kid = header.kid.ok_or_else(|| TokenError::Malformed {
            details: "header is missing kid".to_owned(),
        })?;

        let decoding_key = keys
            .decoding_key(&kid)
            .ok_or(TokenError::UnknownKid { kid })?;

        // Expiry, audience, and issuer are checked manually above for
        // typed errors; here only the signature and shape matter.
        let mut validation = Validation::new(Algorithm::RS256);
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.leeway = 0;

        jsonwebtoken::decode::<AccessTokenClaims>(token, &decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::InvalidSignature => TokenError::InvalidSignature,
                _ => TokenError::Malformed {
                    details: e.to_string(),
                },
            })
    }
}
