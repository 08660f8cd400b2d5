//! Credential verification for login.
//!
//! Passwords are stored as argon2id PHC strings. Hashing and verification run
//! on the blocking pool so they never stall the async workers.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, instrument};

use larder_auth::Principal;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CredentialError {
    #[error("invalid password hashing parameters: {0}")]
    InvalidParameters(String),

    #[error("password hashing failed: {0}")]
    Hashing(String),

    #[error("user '{0}' already exists")]
    DuplicateUser(String),

    #[error("credential store failure: {0}")]
    Backend(String),
}

/// Argon2id cost parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PasswordHashing {
    memory_kib: u32,
    iterations: u32,
}

impl Default for PasswordHashing {
    fn default() -> Self {
        Self {
            memory_kib: Params::DEFAULT_M_COST,
            iterations: Params::DEFAULT_T_COST,
        }
    }
}

impl PasswordHashing {
    pub fn new(memory_kib: u32, iterations: u32) -> Result<Self, CredentialError> {
        let hashing = Self {
            memory_kib,
            iterations,
        };
        hashing.hasher()?;
        Ok(hashing)
    }

    fn hasher(&self) -> Result<Argon2<'static>, CredentialError> {
        let params = Params::new(self.memory_kib, self.iterations, 1, None)
            .map_err(|e| CredentialError::InvalidParameters(e.to_string()))?;
        Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
    }

    /// Hash `password` into a PHC string with a fresh random salt.
    pub fn hash(&self, password: &str) -> Result<String, CredentialError> {
        let mut salt_bytes = [0u8; 16];
        getrandom::getrandom(&mut salt_bytes).map_err(|e| CredentialError::Hashing(e.to_string()))?;
        let salt =
            SaltString::encode_b64(&salt_bytes).map_err(|e| CredentialError::Hashing(e.to_string()))?;

        Ok(self
            .hasher()?
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| CredentialError::Hashing(e.to_string()))?
            .to_string())
    }

    /// Check `password` against a stored PHC string. The cost parameters
    /// recorded in the hash are used, not the current ones.
    pub fn verify(phc: &str, password: &str) -> bool {
        match PasswordHash::new(phc) {
            Ok(parsed) => Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok(),
            Err(_) => false,
        }
    }
}

/// Source of truth for "who is this username/password pair".
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// `Ok(None)` for unknown users and wrong passwords alike.
    async fn verify(&self, username: &str, password: &str)
    -> Result<Option<Principal>, CredentialError>;
}

#[async_trait]
impl<C> CredentialStore for Arc<C>
where
    C: CredentialStore + ?Sized,
{
    async fn verify(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Option<Principal>, CredentialError> {
        (**self).verify(username, password).await
    }
}

#[derive(Debug, Clone)]
struct Account {
    principal: Principal,
    password_hash: String,
}

/// In-memory credential store keyed by username.
#[derive(Debug)]
pub struct InMemoryCredentialStore {
    hashing: PasswordHashing,
    accounts: RwLock<HashMap<String, Account>>,
    /// Verified against when the username is unknown, so both paths cost the same.
    dummy_hash: String,
}

impl InMemoryCredentialStore {
    pub fn new(hashing: PasswordHashing) -> Result<Self, CredentialError> {
        Ok(Self {
            dummy_hash: hashing.hash("larder-dummy-password")?,
            hashing,
            accounts: RwLock::new(HashMap::new()),
        })
    }

    /// Register an account. Usernames are unique.
    #[instrument(skip(self, principal, password), fields(username = %principal.username))]
    pub async fn add_user(&self, principal: Principal, password: &str) -> Result<(), CredentialError> {
        let hashing = self.hashing;
        let password = password.to_owned();
        let password_hash = tokio::task::spawn_blocking(move || hashing.hash(&password))
            .await
            .map_err(|e| CredentialError::Backend(format!("hashing task failed: {e}")))??;

        let mut accounts = self
            .accounts
            .write()
            .map_err(|_| CredentialError::Backend("lock poisoned".to_string()))?;
        if accounts.contains_key(&principal.username) {
            return Err(CredentialError::DuplicateUser(principal.username));
        }
        accounts.insert(
            principal.username.clone(),
            Account {
                principal,
                password_hash,
            },
        );
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    #[instrument(skip(self, password), err)]
    async fn verify(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Option<Principal>, CredentialError> {
        let account = self
            .accounts
            .read()
            .map_err(|_| CredentialError::Backend("lock poisoned".to_string()))?
            .get(username)
            .cloned();

        let phc = account
            .as_ref()
            .map_or_else(|| self.dummy_hash.clone(), |a| a.password_hash.clone());
        let password = password.to_owned();
        let matches = tokio::task::spawn_blocking(move || PasswordHashing::verify(&phc, &password))
            .await
            .map_err(|e| CredentialError::Backend(format!("verification task failed: {e}")))?;

        match account {
            Some(account) if matches => Ok(Some(account.principal)),
            _ => {
                debug!("credential check failed");
                Ok(None)
            }
        }
    }
}
