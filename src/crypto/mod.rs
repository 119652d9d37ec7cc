// ABOUTME: Cryptographic primitives shared across the authorization core
// ABOUTME: Secure randomness, code/token hashing, and secret encryption at rest
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Portico Project

//! Cryptographic adapters.
//!
//! Everything here is pure with respect to the domain: no repository access,
//! no HTTP. The authorize and token pipelines call into this module for
//! random material, hashing, and secret sealing.

pub mod password;
pub mod totp;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::rand::{SecureRandom, SystemRandom};
use sha2::{Digest, Sha256};
use tracing::error;

use crate::errors::{AppError, AppResult};

/// Length in characters of authorization codes and refresh tokens.
///
/// 96 random bytes encode to exactly 128 base64url characters.
pub const OPAQUE_TOKEN_LEN: usize = 128;

const OPAQUE_TOKEN_BYTES: usize = 96;

/// Length in bytes of session identifiers (192 bits)
pub const SESSION_ID_BYTES: usize = 24;

/// Fill a buffer from the system RNG
///
/// # Errors
/// Returns an error if the system RNG fails; the server cannot operate
/// securely without working randomness, so callers surface this as fatal.
pub fn fill_random(buf: &mut [u8]) -> AppResult<()> {
    let rng = SystemRandom::new();
    rng.fill(buf).map_err(|e| {
        error!("system RNG failure: {:?}", e);
        AppError::internal("system RNG failure")
    })
}

/// Generate `len` random bytes
///
/// # Errors
/// Returns an error if the system RNG fails.
pub fn random_bytes(len: usize) -> AppResult<Vec<u8>> {
    let mut bytes = vec![0u8; len];
    fill_random(&mut bytes)?;
    Ok(bytes)
}

/// Generate an opaque 128-character token (authorization code, refresh token)
///
/// # Errors
/// Returns an error if the system RNG fails.
pub fn generate_opaque_token() -> AppResult<String> {
    let bytes = random_bytes(OPAQUE_TOKEN_BYTES)?;
    let token = URL_SAFE_NO_PAD.encode(&bytes);
    debug_assert_eq!(token.len(), OPAQUE_TOKEN_LEN);
    Ok(token)
}

/// Generate an opaque session identifier (192 bits, base64url)
///
/// # Errors
/// Returns an error if the system RNG fails.
pub fn generate_session_identifier() -> AppResult<String> {
    let bytes = random_bytes(SESSION_ID_BYTES)?;
    Ok(URL_SAFE_NO_PAD.encode(&bytes))
}

/// SHA-256 of a string, hex encoded; the at-rest form of codes and tokens
#[must_use]
pub fn sha256_hex(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    hex::encode(hasher.finalize())
}

/// SHA-256 of a string, base64url without padding; the PKCE transform
#[must_use]
pub fn sha256_base64url(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// Encrypt a secret with AES-256-GCM, prepending the nonce to the
/// ciphertext and base64url encoding the result.
///
/// # Errors
/// Returns an error if the key is not 32 bytes or encryption fails.
pub fn seal_secret(plaintext: &str, key: &[u8]) -> AppResult<String> {
    let mut nonce_bytes = [0u8; 12];
    fill_random(&mut nonce_bytes)?;
    let nonce = Nonce::assume_unique_for_key(nonce_bytes);

    let unbound = UnboundKey::new(&AES_256_GCM, key)?;
    let sealing_key = LessSafeKey::new(unbound);

    let mut data = plaintext.as_bytes().to_vec();
    sealing_key.seal_in_place_append_tag(nonce, Aad::empty(), &mut data)?;

    let mut combined = nonce_bytes.to_vec();
    combined.extend(data);
    Ok(URL_SAFE_NO_PAD.encode(combined))
}

/// Decrypt a secret sealed by [`seal_secret`]
///
/// # Errors
/// Returns an error if the payload is malformed or authentication fails.
pub fn open_secret(sealed: &str, key: &[u8]) -> AppResult<String> {
    let combined = URL_SAFE_NO_PAD
        .decode(sealed)
        .map_err(|e| AppError::internal(format!("sealed secret is not base64url: {e}")))?;
    if combined.len() < 12 {
        return Err(AppError::internal("sealed secret is too short"));
    }

    let (nonce_bytes, ciphertext) = combined.split_at(12);
    let nonce_arr: [u8; 12] = nonce_bytes
        .try_into()
        .map_err(|_| AppError::internal("sealed secret nonce is malformed"))?;
    let nonce = Nonce::assume_unique_for_key(nonce_arr);

    let unbound = UnboundKey::new(&AES_256_GCM, key)?;
    let opening_key = LessSafeKey::new(unbound);

    let mut data = ciphertext.to_vec();
    let plaintext = opening_key.open_in_place(nonce, Aad::empty(), &mut data)?;
    String::from_utf8(plaintext.to_vec())
        .map_err(|_| AppError::internal("decrypted secret is not UTF-8"))
}
