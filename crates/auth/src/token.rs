//! Bearer token signing/verification.
//!
//! Tokens are opaque to callers. Only the codec and the session lifecycle
//! manager ever see raw token text; everything else (storage included) works
//! with [`TokenHash`].

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, errors::ErrorKind};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::{Claims, validate_claims};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("malformed token: {0}")]
    Malformed(String),

    #[error("token has expired")]
    Expired,

    #[error("token signature does not match")]
    InvalidSignature,

    #[error("token signing failed: {0}")]
    Signing(String),
}

/// Issues and verifies signed bearer tokens. Stateless.
pub trait TokenCodec: Send + Sync {
    fn issue(&self, claims: &Claims) -> Result<String, TokenError>;

    /// Verify signature and structure, then the time window against `now`.
    fn verify(&self, token: &str, now: DateTime<Utc>) -> Result<Claims, TokenError>;
}

/// HS256 JWT codec keyed by a server-held secret.
///
/// An empty secret yields a codec that cannot sign (`Signing`) and rejects
/// every token (`InvalidSignature`).
pub struct Hs256TokenCodec {
    keys: Option<(EncodingKey, DecodingKey)>,
    validation: Validation,
}

impl Hs256TokenCodec {
    pub fn new(secret: &SecretString) -> Self {
        let bytes = secret.expose_secret().as_bytes();
        let keys = (!bytes.is_empty())
            .then(|| (EncodingKey::from_secret(bytes), DecodingKey::from_secret(bytes)));

        // Expiry is checked against the injected clock in `validate_claims`.
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims = HashSet::new();
        validation.leeway = 0;

        Self { keys, validation }
    }
}

impl core::fmt::Debug for Hs256TokenCodec {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Hs256TokenCodec")
            .field("keyed", &self.keys.is_some())
            .finish()
    }
}

impl TokenCodec for Hs256TokenCodec {
    fn issue(&self, claims: &Claims) -> Result<String, TokenError> {
        let (encoding, _) = self
            .keys
            .as_ref()
            .ok_or_else(|| TokenError::Signing("signing secret is not configured".to_string()))?;

        if claims.expires_at <= claims.issued_at {
            return Err(TokenError::Malformed("expires_at <= issued_at".to_string()));
        }

        jsonwebtoken::encode(&Header::new(Algorithm::HS256), claims, encoding)
            .map_err(|e| TokenError::Signing(e.to_string()))
    }

    fn verify(&self, token: &str, now: DateTime<Utc>) -> Result<Claims, TokenError> {
        let (_, decoding) = self.keys.as_ref().ok_or(TokenError::InvalidSignature)?;

        let data = jsonwebtoken::decode::<Claims>(token, decoding, &self.validation).map_err(|e| {
            match e.kind() {
                ErrorKind::InvalidSignature => TokenError::InvalidSignature,
                ErrorKind::ExpiredSignature => TokenError::Expired,
                _ => TokenError::Malformed(e.to_string()),
            }
        })?;

        validate_claims(&data.claims, now)?;
        Ok(data.claims)
    }
}

/// One-way hash of a raw token (SHA-256, lowercase hex).
///
/// This is the only form of a token that storage ever sees.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenHash(String);

impl TokenHash {
    pub fn of(token: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(token.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    /// Wrap an already-computed hash (as loaded from storage).
    pub fn from_hex(hash: impl Into<String>) -> Self {
        Self(hash.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for TokenHash {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}
