// ABOUTME: Password and client-secret hashing built on bcrypt
// ABOUTME: CPU-heavy hashing runs on the blocking pool, off the async executor
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Portico Project

use crate::errors::{AppError, AppResult};

/// Hash a password with bcrypt at the default cost.
///
/// Runs on the blocking pool because bcrypt is CPU-intensive.
///
/// # Errors
/// Returns an error if hashing fails or the blocking task is cancelled.
pub async fn hash_password(password: &str) -> AppResult<String> {
    let password = password.to_owned();
    tokio::task::spawn_blocking(move || bcrypt::hash(&password, bcrypt::DEFAULT_COST))
        .await
        .map_err(|e| AppError::internal(format!("hashing task failed: {e}")))?
        .map_err(AppError::from)
}

/// Verify a password against a bcrypt hash.
///
/// Any bcrypt error (malformed hash included) verifies as `false`; callers
/// treat that identically to a wrong password.
pub async fn verify_password(password: &str, hash: &str) -> bool {
    let password = password.to_owned();
    let hash = hash.to_owned();

    tokio::task::spawn_blocking(move || bcrypt::verify(&password, &hash).unwrap_or(false))
        .await
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hash_and_verify_round_trip() {
        let hash = hash_password("abc123").await.unwrap();
        assert!(verify_password("abc123", &hash).await);
        assert!(!verify_password("abc124", &hash).await);
    }

    #[tokio::test]
    async fn malformed_hash_verifies_false() {
        assert!(!verify_password("abc123", "not-a-bcrypt-hash").await);
    }
}
