// ABOUTME: Signing-key lifecycle management and JWKS publication
// ABOUTME: Holds the previous/current/next RSA key ring behind a reader-writer guard
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Portico Project

//! # Key Manager
//!
//! This module provides:
//! - RSA key pair generation for RS256 JWT signing
//! - The previous/current/next key lifecycle with stable `kid` publication
//! - JWKS output for public key distribution (`current` and `next`, so
//!   clients can pre-fetch before a rotation)
//! - Idempotent rotation, atomic with respect to concurrent signing
//!
//! ## Security model
//!
//! - Private keys never leave the server; only public JWKs are published
//! - `previous` keys are retained for verification only, so tokens minted
//!   before a rotation keep verifying for a full rotation period
//! - Signers hold a read lock for the duration of one JWS operation;
//!   rotation takes the write lock only for the pointer swap

use std::collections::HashMap;
use std::sync::RwLock;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header};
use rsa::{
    pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey},
    traits::PublicKeyParts,
    RsaPrivateKey, RsaPublicKey,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::database::{Database, DatabaseProvider};
use crate::errors::{AppError, AppResult};
use crate::models::{KeyPair, KeyState};

/// RSA key size in bits (4096 on generation per the security baseline)
pub const RSA_KEY_SIZE: usize = 4096;

/// JWK (JSON Web Key) representation for the JWKS endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonWebKey {
    /// Key type (always "RSA")
    pub kty: String,
    /// Public key use (always "sig")
    #[serde(rename = "use")]
    pub key_use: String,
    /// Key ID for rotation tracking
    pub kid: String,
    /// Algorithm (RS256)
    pub alg: String,
    /// RSA modulus (base64url encoded)
    pub n: String,
    /// RSA exponent (base64url encoded)
    pub e: String,
}

/// JWKS (JSON Web Key Set) container
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonWebKeySet {
    /// Array of public keys
    pub keys: Vec<JsonWebKey>,
}

/// An RSA key pair with its lifecycle metadata, held in memory
#[derive(Clone)]
pub struct SigningKey {
    /// Key identifier published in JWS headers
    pub kid: String,
    /// Lifecycle state
    pub state: KeyState,
    private_key: RsaPrivateKey,
    public_key: RsaPublicKey,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

impl SigningKey {
    /// Generate a new key pair with a random UUID `kid`
    ///
    /// # Errors
    /// Returns an error if RSA key generation fails.
    pub fn generate(state: KeyState, key_size_bits: usize) -> AppResult<Self> {
        use rand::rngs::OsRng;

        let mut rng = OsRng;
        let private_key = RsaPrivateKey::new(&mut rng, key_size_bits)
            .map_err(|e| AppError::internal(format!("failed to generate RSA key: {e}")))?;
        let public_key = RsaPublicKey::from(&private_key);

        Ok(Self {
            kid: Uuid::new_v4().to_string(),
            state,
            private_key,
            public_key,
            created_at: Utc::now(),
        })
    }

    /// Import a key pair from its persisted row
    ///
    /// # Errors
    /// Returns an error if the private key PEM cannot be parsed.
    pub fn from_key_pair(row: &KeyPair) -> AppResult<Self> {
        let private_key = RsaPrivateKey::from_pkcs8_pem(&row.private_key_pem)
            .map_err(|e| AppError::internal(format!("failed to parse private key PEM: {e}")))?;
        let public_key = RsaPublicKey::from(&private_key);

        Ok(Self {
            kid: row.kid.clone(),
            state: row.state,
            private_key,
            public_key,
            created_at: row.created_at,
        })
    }

    /// Convert the public half to JWK format
    #[must_use]
    pub fn to_jwk(&self) -> JsonWebKey {
        let n = self.public_key.n().to_bytes_be();
        let e = self.public_key.e().to_bytes_be();

        JsonWebKey {
            kty: "RSA".to_owned(),
            key_use: "sig".to_owned(),
            kid: self.kid.clone(),
            alg: "RS256".to_owned(),
            n: URL_SAFE_NO_PAD.encode(n),
            e: URL_SAFE_NO_PAD.encode(e),
        }
    }

    /// Export as a persistable row
    ///
    /// # Errors
    /// Returns an error if PEM or JWK serialization fails.
    pub fn to_key_pair(&self) -> AppResult<KeyPair> {
        let private_key_pem = self
            .private_key
            .to_pkcs8_pem(rsa::pkcs8::LineEnding::LF)
            .map_err(|e| AppError::internal(format!("failed to export private key PEM: {e}")))?
            .to_string();
        let public_key_pem = self
            .public_key
            .to_public_key_pem(rsa::pkcs8::LineEnding::LF)
            .map_err(|e| AppError::internal(format!("failed to export public key PEM: {e}")))?;
        let public_key_jwk = serde_json::to_string(&self.to_jwk())?;

        Ok(KeyPair {
            id: Uuid::new_v4(),
            kid: self.kid.clone(),
            state: self.state,
            algorithm: "RS256".to_owned(),
            private_key_pem,
            public_key_pem,
            public_key_jwk,
            created_at: self.created_at,
        })
    }

    /// Encoding key for JWT signing
    ///
    /// # Errors
    /// Returns an error if the key cannot be exported; callers surface this
    /// as `server_error` since signing is impossible without it.
    pub fn encoding_key(&self) -> AppResult<EncodingKey> {
        let pem = self
            .private_key
            .to_pkcs8_pem(rsa::pkcs8::LineEnding::LF)
            .map_err(|e| AppError::internal(format!("failed to export private key PEM: {e}")))?;
        EncodingKey::from_rsa_pem(pem.as_bytes()).map_err(AppError::from)
    }

    /// Decoding key for JWT verification
    ///
    /// # Errors
    /// Returns an error if the public key cannot be exported.
    pub fn decoding_key(&self) -> AppResult<DecodingKey> {
        let pem = self
            .public_key
            .to_public_key_pem(rsa::pkcs8::LineEnding::LF)
            .map_err(|e| AppError::internal(format!("failed to export public key PEM: {e}")))?;
        DecodingKey::from_rsa_pem(pem.as_bytes()).map_err(AppError::from)
    }
}

struct KeyRing {
    keys: HashMap<String, SigningKey>,
    current_kid: String,
    next_kid: Option<String>,
}

/// Outcome of a rotation request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RotationOutcome {
    /// Keys were promoted; contains the new current `kid`
    Rotated {
        /// `kid` now in the `current` state
        new_current: String,
    },
    /// The observed current key was already stale; nothing changed
    AlreadyRotated,
}

/// Process-wide key manager.
///
/// Loaded from the key store at boot; `sign` takes a read lock, `rotate`
/// a write lock, so a signing operation never observes a half-rotated ring.
pub struct KeyManager {
    ring: RwLock<KeyRing>,
}

impl KeyManager {
    /// Build the manager from persisted key pairs.
    ///
    /// # Errors
    /// Returns an error if no key is in the `current` state, more than one
    /// is, or any PEM fails to parse.
    pub fn from_key_pairs(rows: &[KeyPair]) -> AppResult<Self> {
        let mut keys = HashMap::new();
        let mut current_kid = None;
        let mut next_kid = None;

        for row in rows {
            let key = SigningKey::from_key_pair(row)?;
            match key.state {
                KeyState::Current => {
                    if current_kid.replace(key.kid.clone()).is_some() {
                        return Err(AppError::internal("multiple keys in the current state"));
                    }
                }
                KeyState::Next => {
                    if next_kid.replace(key.kid.clone()).is_some() {
                        return Err(AppError::internal("multiple keys in the next state"));
                    }
                }
                KeyState::Previous => {}
            }
            keys.insert(key.kid.clone(), key);
        }

        let current_kid =
            current_kid.ok_or_else(|| AppError::internal("no key in the current state"))?;

        Ok(Self {
            ring: RwLock::new(KeyRing {
                keys,
                current_kid,
                next_kid,
            }),
        })
    }

    /// Load the manager from the key store
    ///
    /// # Errors
    /// Returns an error if the store cannot be read or holds an invalid ring.
    pub async fn load(db: &Database) -> AppResult<Self> {
        let rows = db.get_key_pairs().await?;
        Self::from_key_pairs(&rows)
    }

    /// `kid` of the active signing key
    ///
    /// # Panics
    /// Panics if the ring lock is poisoned, which only happens after another
    /// thread panicked while rotating.
    #[must_use]
    pub fn current_kid(&self) -> String {
        self.ring
            .read()
            .expect("key ring lock poisoned")
            .current_kid
            .clone()
    }

    /// Sign claims with the current key, embedding its `kid` in the header.
    ///
    /// Returns the JWS and the `kid` it was signed with.
    ///
    /// # Errors
    /// Returns an error only if the current key is unusable; callers map
    /// this to `server_error`.
    pub fn sign<T: Serialize>(&self, claims: &T) -> AppResult<(String, String)> {
        let ring = self.ring.read().expect("key ring lock poisoned");
        let key = ring
            .keys
            .get(&ring.current_kid)
            .ok_or_else(|| AppError::internal("current signing key missing from ring"))?;

        let mut header = Header::new(jsonwebtoken::Algorithm::RS256);
        header.kid = Some(key.kid.clone());

        let encoding_key = key.encoding_key()?;
        let jws = jsonwebtoken::encode(&header, claims, &encoding_key)?;
        Ok((jws, key.kid.clone()))
    }

    /// Decoding key for a `kid`, if the ring knows it.
    ///
    /// Accepts keys in any state: `previous` keys keep verifying tokens
    /// minted before rotation.
    #[must_use]
    pub fn decoding_key(&self, kid: &str) -> Option<DecodingKey> {
        let ring = self.ring.read().expect("key ring lock poisoned");
        ring.keys.get(kid).and_then(|key| key.decoding_key().ok())
    }

    /// Published JWKS: `current` and `next` only
    #[must_use]
    pub fn jwks(&self) -> JsonWebKeySet {
        let ring = self.ring.read().expect("key ring lock poisoned");
        let mut keys = Vec::with_capacity(2);
        if let Some(key) = ring.keys.get(&ring.current_kid) {
            keys.push(key.to_jwk());
        }
        if let Some(next_kid) = &ring.next_kid {
            if let Some(key) = ring.keys.get(next_kid) {
                keys.push(key.to_jwk());
            }
        }
        JsonWebKeySet { keys }
    }

    /// Rotate the ring with production-grade 4096-bit generation for the
    /// new `next` key. See [`KeyManager::rotate_with_size`].
    ///
    /// # Errors
    /// Returns an error if key generation or persistence fails.
    pub async fn rotate(&self, db: &Database, observed_current: &str) -> AppResult<RotationOutcome> {
        self.rotate_with_size(db, observed_current, RSA_KEY_SIZE).await
    }

    /// Rotate the ring: `next` becomes `current`, the former `current`
    /// becomes `previous`, and a freshly generated key becomes `next`.
    ///
    /// `observed_current` is the `kid` the caller believes is active. When
    /// it is stale (a concurrent caller already rotated) this is a no-op,
    /// which makes concurrent rotation idempotent.
    ///
    /// Key generation and persistence happen before the write lock is
    /// taken, so signers are only blocked for the in-memory swap.
    ///
    /// Tests pass 2048 bits to keep generation fast.
    ///
    /// # Errors
    /// Returns an error if key generation or persistence fails.
    pub async fn rotate_with_size(
        &self,
        db: &Database,
        observed_current: &str,
        key_size_bits: usize,
    ) -> AppResult<RotationOutcome> {
        let (promote_kid, demote_kid) = {
            let ring = self.ring.read().expect("key ring lock poisoned");
            if ring.current_kid != observed_current {
                warn!(
                    observed = %observed_current,
                    current = %ring.current_kid,
                    "rotation requested against a stale current key; skipping"
                );
                return Ok(RotationOutcome::AlreadyRotated);
            }
            let next = ring
                .next_kid
                .clone()
                .ok_or_else(|| AppError::internal("no next key available for rotation"))?;
            (next, ring.current_kid.clone())
        };

        // RSA generation is slow; keep it off the async executor and
        // outside the ring lock.
        let new_next = tokio::task::spawn_blocking(move || {
            SigningKey::generate(KeyState::Next, key_size_bits)
        })
        .await
        .map_err(|e| AppError::internal(format!("key generation task failed: {e}")))??;

        let new_next_row = new_next.to_key_pair()?;
        db.rotate_key_pairs(&demote_kid, &promote_kid, &new_next_row)
            .await?;

        {
            let mut ring = self.ring.write().expect("key ring lock poisoned");
            // A concurrent rotation may have won between our check and the
            // database write; the conditional update above would have failed
            // in that case, so reaching here means we own the promotion.
            if let Some(old_current) = ring.keys.get_mut(&demote_kid) {
                old_current.state = KeyState::Previous;
            }
            if let Some(promoted) = ring.keys.get_mut(&promote_kid) {
                promoted.state = KeyState::Current;
            }
            ring.current_kid = promote_kid.clone();
            ring.next_kid = Some(new_next.kid.clone());
            ring.keys.insert(new_next.kid.clone(), new_next);
        }

        info!(new_current = %promote_kid, "signing keys rotated");
        Ok(RotationOutcome::Rotated {
            new_current: promote_kid,
        })
    }

    /// Reload the ring from the key store; used by the periodic refresher
    /// after out-of-process changes.
    ///
    /// # Errors
    /// Returns an error if the store cannot be read or holds an invalid ring.
    pub async fn refresh(&self, db: &Database) -> AppResult<()> {
        let reloaded = Self::load(db).await?;
        let fresh = reloaded.ring.into_inner().expect("key ring lock poisoned");
        let mut ring = self.ring.write().expect("key ring lock poisoned");
        *ring = fresh;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_manager() -> KeyManager {
        // 2048-bit keys keep the test fast; production generation is 4096
        let current = SigningKey::generate(KeyState::Current, 2048).unwrap();
        let next = SigningKey::generate(KeyState::Next, 2048).unwrap();
        let rows = vec![
            current.to_key_pair().unwrap(),
            next.to_key_pair().unwrap(),
        ];
        KeyManager::from_key_pairs(&rows).unwrap()
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct TestClaims {
        sub: String,
        exp: i64,
    }

    #[test]
    fn sign_embeds_current_kid() {
        let manager = test_manager();
        let claims = TestClaims {
            sub: "user-1".to_owned(),
            exp: (Utc::now() + chrono::Duration::minutes(5)).timestamp(),
        };
        let (jws, kid) = manager.sign(&claims).unwrap();
        assert_eq!(kid, manager.current_kid());

        let header = jsonwebtoken::decode_header(&jws).unwrap();
        assert_eq!(header.kid.as_deref(), Some(kid.as_str()));
    }

    #[test]
    fn jwks_publishes_current_and_next() {
        let manager = test_manager();
        let jwks = manager.jwks();
        assert_eq!(jwks.keys.len(), 2);
        assert!(jwks.keys.iter().all(|k| k.kty == "RSA" && k.alg == "RS256"));
        assert!(jwks.keys.iter().any(|k| k.kid == manager.current_kid()));
    }

    #[test]
    fn ring_requires_exactly_one_current() {
        let a = SigningKey::generate(KeyState::Current, 2048).unwrap();
        let b = SigningKey::generate(KeyState::Current, 2048).unwrap();
        let rows = vec![a.to_key_pair().unwrap(), b.to_key_pair().unwrap()];
        assert!(KeyManager::from_key_pairs(&rows).is_err());

        let only_next = SigningKey::generate(KeyState::Next, 2048).unwrap();
        let rows = vec![only_next.to_key_pair().unwrap()];
        assert!(KeyManager::from_key_pairs(&rows).is_err());
    }

    #[test]
    fn key_pair_rows_round_trip_through_pem() {
        let key = SigningKey::generate(KeyState::Current, 2048).unwrap();
        let row = key.to_key_pair().unwrap();
        let imported = SigningKey::from_key_pair(&row).unwrap();
        assert_eq!(imported.kid, key.kid);
        assert_eq!(imported.to_jwk().n, key.to_jwk().n);
    }
}
