// ABOUTME: TOTP enrollment and verification (RFC 6238, SHA1/6 digits/30s step)
// ABOUTME: Produces the provisioning QR as a base64 PNG data URL for the otp page
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Portico Project

use totp_rs::{Algorithm, Secret, TOTP};

use crate::errors::{AppError, AppResult};

/// Material handed to the user during TOTP enrollment
#[derive(Debug, Clone)]
pub struct TotpEnrollment {
    /// Base32 secret for manual entry
    pub secret_base32: String,
    /// `otpauth://` provisioning URI
    pub otpauth_url: String,
    /// QR code of the provisioning URI as a `data:image/png;base64,` URL
    pub qr_data_url: String,
}

fn build_totp(secret_bytes: Vec<u8>, issuer: &str, account: &str) -> AppResult<TOTP> {
    TOTP::new(
        Algorithm::SHA1,
        6,
        1,
        30,
        secret_bytes,
        Some(issuer.to_owned()),
        account.to_owned(),
    )
    .map_err(|e| AppError::internal(format!("totp init error: {e}")))
}

/// Generate a fresh secret and the provisioning material for enrollment.
///
/// # Errors
/// Returns an error if secret generation or QR rendering fails.
pub fn generate_enrollment(issuer: &str, account: &str) -> AppResult<TotpEnrollment> {
    let secret = Secret::generate_secret();
    let secret_bytes = secret
        .to_bytes()
        .map_err(|e| AppError::internal(format!("totp secret error: {e:?}")))?;

    let totp = build_totp(secret_bytes, issuer, account)?;

    let qr = totp
        .get_qr_base64()
        .map_err(|e| AppError::internal(format!("qr render error: {e}")))?;

    Ok(TotpEnrollment {
        secret_base32: totp.get_secret_base32(),
        otpauth_url: totp.get_url(),
        qr_data_url: format!("data:image/png;base64,{qr}"),
    })
}

/// Verify a submitted code against a base32 secret.
///
/// Clock skew of one 30-second step in either direction is accepted.
/// Malformed secrets verify as `false`.
#[must_use]
pub fn verify_code(secret_base32: &str, code: &str) -> bool {
    let Ok(secret_bytes) = Secret::Encoded(secret_base32.to_owned()).to_bytes() else {
        return false;
    };

    // Issuer and account do not affect code verification
    let Ok(totp) = build_totp(secret_bytes, "verify", "verify") else {
        return false;
    };

    totp.check_current(code).unwrap_or(false)
}

/// Generate the code currently valid for a secret; test support for the
/// otp step without waiting on wall-clock alignment.
///
/// # Errors
/// Returns an error if the secret is malformed or the system clock is
/// unavailable.
pub fn current_code(secret_base32: &str) -> AppResult<String> {
    let secret_bytes = Secret::Encoded(secret_base32.to_owned())
        .to_bytes()
        .map_err(|e| AppError::internal(format!("totp secret error: {e:?}")))?;
    let totp = build_totp(secret_bytes, "verify", "verify")?;
    totp.generate_current()
        .map_err(|e| AppError::internal(format!("system clock error: {e}")))
}
