use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use larder_auth::{PermissionSet, Principal, Role, TokenHash};
use larder_core::{SessionId, UserId};

/// Persisted record of a single authenticated login.
///
/// ## Invariants
///
/// - `session_id` is immutable once created
/// - `token_hash` is unique among active sessions (the raw token is never stored)
/// - `is_active` transitions `true → false` exactly once and never back
/// - `last_activity <= now`
///
/// Expired and explicitly deactivated sessions share the same terminal state
/// (`is_active = false`); the only observable difference is whether
/// `expires_at` had already passed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub username: String,
    pub role_name: Role,
    /// Denormalized copy of the claims' permissions at issuance time.
    pub permissions: PermissionSet,
    pub token_hash: TokenHash,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub is_active: bool,
}

impl Session {
    /// A fresh, active session for `principal`.
    pub fn new(
        session_id: SessionId,
        principal: &Principal,
        token_hash: TokenHash,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            session_id,
            user_id: principal.user_id,
            username: principal.username.clone(),
            role_name: principal.role.clone(),
            permissions: principal.permissions.clone(),
            token_hash,
            created_at,
            expires_at,
            last_activity: created_at,
            is_active: true,
        }
    }

    /// Whether the expiry sweep would deactivate this session at `now`
    /// (the boundary is exclusive: `expires_at == now` is still live).
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

/// New expiry and replacement token hash applied by a refresh that extends
/// a session. Both change in the same store step, so the previous token stops
/// resolving at the moment the new expiry takes effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRenewal {
    pub expires_at: DateTime<Utc>,
    pub token_hash: TokenHash,
}

/// Session store operation error.
///
/// Backends translate their own failures into this type; nothing
/// backend-specific crosses the trait boundary.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("session not found")]
    NotFound,

    #[error("token hash already belongs to an active session")]
    DuplicateTokenHash,

    #[error("session is no longer active")]
    Inactive,

    #[error("session store call timed out")]
    Timeout,

    #[error("session store backend failure: {0}")]
    Backend(String),
}

/// Storage-agnostic persistence for session records.
///
/// ## Implementation Requirements
///
/// Implementations must:
/// - make each mutation a single atomic step (one lock acquisition, one SQL
///   statement or transaction, one server-side script), so a caller that
///   abandons the future never leaves a half-applied change
/// - never reactivate a deactivated session
/// - return `list_active_by_user` oldest-first by `created_at` (eviction relies on it)
/// - treat the `deactivate_expired` boundary as exclusive (`expires_at < now`)
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Persist a new session. Fails with `DuplicateTokenHash` if the hash
    /// already belongs to an active session.
    async fn insert(&self, session: &Session) -> Result<(), StoreError>;

    async fn get_by_id(&self, session_id: SessionId) -> Result<Session, StoreError>;

    /// Most-recently-created **active** session with this hash.
    async fn get_by_token_hash(&self, token_hash: &TokenHash) -> Result<Session, StoreError>;

    /// Active sessions for a user, oldest first.
    async fn list_active_by_user(&self, user_id: UserId) -> Result<Vec<Session>, StoreError>;

    /// Idempotent. `NotFound` only if the session never existed.
    async fn deactivate(&self, session_id: SessionId) -> Result<(), StoreError>;

    /// Returns how many sessions were deactivated.
    async fn deactivate_all_for_user(&self, user_id: UserId) -> Result<u64, StoreError>;

    /// Deactivate every active session with `expires_at < now`.
    async fn deactivate_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn count_active_by_user(&self, user_id: UserId) -> Result<usize, StoreError>;

    /// Record activity on an active session and, with a renewal, move its
    /// expiry and rotate its token hash.
    ///
    /// Fails with `NotFound` for unknown ids, `Inactive` for deactivated ones
    /// and `DuplicateTokenHash` if the new hash belongs to another active session.
    async fn touch(
        &self,
        session_id: SessionId,
        last_activity: DateTime<Utc>,
        renewal: Option<SessionRenewal>,
    ) -> Result<Session, StoreError>;
}

#[async_trait]
impl<S> SessionStore for Arc<S>
where
    S: SessionStore + ?Sized,
{
    async fn insert(&self, session: &Session) -> Result<(), StoreError> {
        (**self).insert(session).await
    }

    async fn get_by_id(&self, session_id: SessionId) -> Result<Session, StoreError> {
        (**self).get_by_id(session_id).await
    }

    async fn get_by_token_hash(&self, token_hash: &TokenHash) -> Result<Session, StoreError> {
        (**self).get_by_token_hash(token_hash).await
    }

    async fn list_active_by_user(&self, user_id: UserId) -> Result<Vec<Session>, StoreError> {
        (**self).list_active_by_user(user_id).await
    }

    async fn deactivate(&self, session_id: SessionId) -> Result<(), StoreError> {
        (**self).deactivate(session_id).await
    }

    async fn deactivate_all_for_user(&self, user_id: UserId) -> Result<u64, StoreError> {
        (**self).deactivate_all_for_user(user_id).await
    }

    async fn deactivate_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        (**self).deactivate_expired(now).await
    }

    async fn count_active_by_user(&self, user_id: UserId) -> Result<usize, StoreError> {
        (**self).count_active_by_user(user_id).await
    }

    async fn touch(
        &self,
        session_id: SessionId,
        last_activity: DateTime<Utc>,
        renewal: Option<SessionRenewal>,
    ) -> Result<Session, StoreError> {
        (**self).touch(session_id, last_activity, renewal).await
    }
}
