//! Session lifecycle: creation under a per-user concurrency cap, validation,
//! refresh, termination and the expiry sweep.
//!
//! ## State machine
//!
//! ```text
//!            time passes
//!   Active ───────────────► Expired      (is_active = false once swept)
//!     │
//!     └───── logout / eviction ──► Deactivated (is_active = false)
//! ```
//!
//! A refresh that extends a session also rotates its token: the replacement
//! carries the new expiry, and the previous token stops resolving in the same
//! store step. Stored expiry and token expiry therefore always agree.
//!
//! Every store call is bounded by `store_timeout`. A mutation that fails part
//! way through is not compensated: an eviction followed by a failed insert
//! leaves the evicted session deactivated.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, instrument, warn};

use larder_auth::{Claims, Principal, TokenCodec, TokenError, TokenHash};
use larder_core::{Clock, DomainError, SessionId, UserId};

use super::r#trait::{Session, SessionRenewal, SessionStore, StoreError};

/// Upper bound accepted for any configured session lifetime.
const MAX_LIFETIME: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

/// Session lifecycle tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub default_expiration: Duration,
    pub remember_me_expiration: Duration,
    /// Refresh only extends a session whose remaining lifetime is below this.
    pub refresh_threshold: Duration,
    /// Interval of the background expiry sweep.
    pub cleanup_interval: Duration,
    pub max_concurrent_sessions: usize,
    /// Deadline applied to every individual store call.
    pub store_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_expiration: Duration::from_secs(24 * 60 * 60),
            remember_me_expiration: Duration::from_secs(30 * 24 * 60 * 60),
            refresh_threshold: Duration::from_secs(60 * 60),
            cleanup_interval: Duration::from_secs(5 * 60),
            max_concurrent_sessions: 5,
            store_timeout: Duration::from_secs(2),
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), DomainError> {
        for (name, value) in [
            ("default_expiration", self.default_expiration),
            ("remember_me_expiration", self.remember_me_expiration),
        ] {
            if value < Duration::from_secs(1) {
                return Err(DomainError::validation(format!("{name} must be at least one second")));
            }
            if value > MAX_LIFETIME {
                return Err(DomainError::validation(format!("{name} exceeds ten years")));
            }
        }
        if self.refresh_threshold > MAX_LIFETIME {
            return Err(DomainError::validation("refresh_threshold exceeds ten years"));
        }
        if self.cleanup_interval.is_zero() {
            return Err(DomainError::validation("cleanup_interval must be positive"));
        }
        if self.store_timeout.is_zero() {
            return Err(DomainError::validation("store_timeout must be positive"));
        }
        if self.max_concurrent_sessions == 0 {
            return Err(DomainError::validation("max_concurrent_sessions must be at least 1"));
        }
        Ok(())
    }
}

/// Session lifecycle error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("malformed token: {0}")]
    MalformedToken(String),

    #[error("token has expired")]
    ExpiredToken,

    #[error("token signature is invalid")]
    InvalidSignature,

    #[error("token signing failed: {0}")]
    Signing(String),

    #[error("session has been revoked")]
    SessionRevoked,

    #[error("session not found")]
    SessionNotFound,

    #[error("session storage failed: {0}")]
    Storage(StoreError),
}

impl SessionError {
    /// Whether the caller should be told "invalid or expired session".
    pub fn is_authentication_failure(&self) -> bool {
        matches!(
            self,
            Self::MalformedToken(_)
                | Self::ExpiredToken
                | Self::InvalidSignature
                | Self::SessionRevoked
                | Self::SessionNotFound
        )
    }
}

impl From<TokenError> for SessionError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::Malformed(msg) => Self::MalformedToken(msg),
            TokenError::Expired => Self::ExpiredToken,
            TokenError::InvalidSignature => Self::InvalidSignature,
            TokenError::Signing(msg) => Self::Signing(msg),
        }
    }
}

impl From<StoreError> for SessionError {
    fn from(err: StoreError) -> Self {
        Self::Storage(err)
    }
}

/// A freshly created session and the raw token handed to the caller.
///
/// The token is never persisted; only `session.token_hash` is.
#[derive(Clone)]
pub struct IssuedSession {
    pub token: String,
    pub session: Session,
}

impl core::fmt::Debug for IssuedSession {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IssuedSession")
            .field("token", &"<redacted>")
            .field("session", &self.session)
            .finish()
    }
}

/// Result of [`SessionLifecycleManager::refresh`].
///
/// `token` is set only when the session was extended; the caller must switch
/// to it, since the token used so far no longer validates.
#[derive(Clone, PartialEq, Eq)]
pub struct Refreshed {
    pub expires_at: DateTime<Utc>,
    pub token: Option<String>,
}

impl core::fmt::Debug for Refreshed {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Refreshed")
            .field("expires_at", &self.expires_at)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Outcome of the capacity check inside `create`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Capacity {
    Available,
    Exceeded { active: usize },
}

type UserLocks = StdMutex<HashMap<UserId, Arc<Mutex<()>>>>;

/// Holds one user's creation lock; drops the map entry once nobody else wants it.
struct UserSlot<'a> {
    locks: &'a UserLocks,
    user_id: UserId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for UserSlot<'_> {
    fn drop(&mut self) {
        let Some(guard) = self.guard.take() else {
            return;
        };
        let lock = OwnedMutexGuard::mutex(&guard).clone();
        drop(guard);

        if let Ok(mut locks) = self.locks.lock() {
            // One reference in the map, one in `lock`.
            if Arc::strong_count(&lock) == 2 {
                locks.remove(&self.user_id);
            }
        }
    }
}

/// Orchestrates the session lifecycle over a [`SessionStore`].
pub struct SessionLifecycleManager<S> {
    store: S,
    codec: Arc<dyn TokenCodec>,
    clock: Arc<dyn Clock>,
    config: SessionConfig,
    user_locks: UserLocks,
}

impl<S> core::fmt::Debug for SessionLifecycleManager<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SessionLifecycleManager")
            .field("clock", &self.clock)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<S: SessionStore> SessionLifecycleManager<S> {
    pub fn new(
        store: S,
        codec: Arc<dyn TokenCodec>,
        clock: Arc<dyn Clock>,
        config: SessionConfig,
    ) -> Result<Self, DomainError> {
        config.validate()?;
        Ok(Self {
            store,
            codec,
            clock,
            config,
            user_locks: StdMutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Issue a token for `principal` and persist its session, evicting the
    /// user's oldest sessions first if the concurrency cap is reached.
    #[instrument(skip(self, principal), fields(user_id = %principal.user_id, session_id))]
    pub async fn create(
        &self,
        principal: &Principal,
        remember_me: bool,
    ) -> Result<IssuedSession, SessionError> {
        let lifetime = if remember_me {
            self.config.remember_me_expiration
        } else {
            self.config.default_expiration
        };

        let session_id = SessionId::new();
        tracing::Span::current().record("session_id", tracing::field::display(session_id));

        let _slot = self.lock_user(principal.user_id).await;

        // Read under the lock so `created_at` follows insertion order.
        let now = self.clock.now();
        let claims = Claims::for_principal(principal, session_id, now, now + span(lifetime));
        let token = self.codec.issue(&claims)?;
        let session = Session::new(
            session_id,
            principal,
            TokenHash::of(&token),
            now,
            claims.expires_at,
        );

        if let Capacity::Exceeded { active } = self.capacity(principal.user_id).await? {
            debug!(active, max = self.config.max_concurrent_sessions, "session cap reached");
            let excess = active + 1 - self.config.max_concurrent_sessions;
            let oldest = self
                .call("list_active_by_user", self.store.list_active_by_user(principal.user_id))
                .await?;
            for victim in oldest.into_iter().take(excess) {
                self.call("deactivate", self.store.deactivate(victim.session_id))
                    .await?;
                info!(evicted_session_id = %victim.session_id, "evicted oldest session");
            }
        }

        self.call("insert", self.store.insert(&session)).await?;
        info!(remember_me, expires_at = %session.expires_at, "session created");

        Ok(IssuedSession { token, session })
    }

    /// Resolve a raw bearer token to its claims.
    ///
    /// Token expiry and signature are checked before storage is consulted.
    /// Read-only.
    #[instrument(skip(self, token))]
    pub async fn validate(&self, token: &str) -> Result<Claims, SessionError> {
        let now = self.clock.now();
        let claims = self.codec.verify(token, now)?;

        let session = match self
            .call("get_by_token_hash", self.store.get_by_token_hash(&TokenHash::of(token)))
            .await
        {
            Ok(session) => session,
            Err(SessionError::Storage(StoreError::NotFound)) => {
                debug!(session_id = %claims.session_id, "no active session for token");
                return Err(SessionError::SessionRevoked);
            }
            Err(e) => return Err(e),
        };

        if session.session_id != claims.session_id || session.user_id != claims.sub {
            warn!(session_id = %session.session_id, "token hash matched a different session");
            return Err(SessionError::SessionRevoked);
        }
        if session.expires_at <= now {
            return Err(SessionError::ExpiredToken);
        }

        Ok(claims)
    }

    /// Record activity and extend the session if it is close to expiring.
    ///
    /// Extension issues a replacement token whose expiry matches the new
    /// stored expiry; the old token is revoked by the same store call.
    #[instrument(skip(self))]
    pub async fn refresh(&self, session_id: SessionId) -> Result<Refreshed, SessionError> {
        let user_id = self
            .call("get_by_id", self.store.get_by_id(session_id))
            .await
            .map_err(not_found_as(SessionError::SessionNotFound))?
            .user_id;

        let _slot = self.lock_user(user_id).await;

        // Re-read under the lock; a concurrent refresh may have rotated the token.
        let session = self
            .call("get_by_id", self.store.get_by_id(session_id))
            .await
            .map_err(not_found_as(SessionError::SessionNotFound))?;
        let now = self.clock.now();

        if !session.is_active {
            return Err(SessionError::SessionRevoked);
        }
        if session.expires_at <= now {
            return Err(SessionError::ExpiredToken);
        }

        let (renewal, token) = if session.expires_at - now < span(self.config.refresh_threshold) {
            let principal = Principal::new(
                session.user_id,
                session.username.clone(),
                session.role_name.clone(),
                session.permissions.clone(),
            );
            let claims = Claims::for_principal(
                &principal,
                session_id,
                now,
                now + span(self.config.default_expiration),
            );
            let token = self.codec.issue(&claims)?;
            let renewal = SessionRenewal {
                expires_at: claims.expires_at,
                token_hash: TokenHash::of(&token),
            };
            (Some(renewal), Some(token))
        } else {
            (None, None)
        };

        let updated = self
            .call("touch", self.store.touch(session_id, now, renewal))
            .await
            .map_err(|e| match e {
                SessionError::Storage(StoreError::Inactive) => SessionError::SessionRevoked,
                SessionError::Storage(StoreError::NotFound) => SessionError::SessionNotFound,
                other => other,
            })?;

        debug!(extended = token.is_some(), expires_at = %updated.expires_at, "session refreshed");
        Ok(Refreshed {
            expires_at: updated.expires_at,
            token,
        })
    }

    #[instrument(skip(self))]
    pub async fn logout(&self, session_id: SessionId) -> Result<(), SessionError> {
        self.call("deactivate", self.store.deactivate(session_id))
            .await
            .map_err(not_found_as(SessionError::SessionNotFound))?;
        info!("session logged out");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn logout_all(&self, user_id: UserId) -> Result<u64, SessionError> {
        let deactivated = self
            .call("deactivate_all_for_user", self.store.deactivate_all_for_user(user_id))
            .await?;
        info!(deactivated, "all sessions logged out");
        Ok(deactivated)
    }

    /// Deactivate every session whose expiry is strictly before now.
    #[instrument(skip(self))]
    pub async fn sweep_expired(&self) -> Result<u64, SessionError> {
        let now = self.clock.now();
        let swept = self
            .call("deactivate_expired", self.store.deactivate_expired(now))
            .await?;
        if swept > 0 {
            info!(swept, "expired sessions deactivated");
        }
        Ok(swept)
    }

    /// Active sessions for a user, oldest first.
    #[instrument(skip(self))]
    pub async fn active_sessions(&self, user_id: UserId) -> Result<Vec<Session>, SessionError> {
        self.call("list_active_by_user", self.store.list_active_by_user(user_id))
            .await
    }

    async fn capacity(&self, user_id: UserId) -> Result<Capacity, SessionError> {
        let active = self
            .call("count_active_by_user", self.store.count_active_by_user(user_id))
            .await?;
        Ok(if active >= self.config.max_concurrent_sessions {
            Capacity::Exceeded { active }
        } else {
            Capacity::Available
        })
    }

    async fn lock_user(&self, user_id: UserId) -> UserSlot<'_> {
        let lock = {
            let mut locks = self
                .user_locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            locks.entry(user_id).or_default().clone()
        };

        UserSlot {
            locks: &self.user_locks,
            user_id,
            guard: Some(lock.lock_owned().await),
        }
    }

    async fn call<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, SessionError> {
        match tokio::time::timeout(self.config.store_timeout, fut).await {
            Ok(result) => result.map_err(SessionError::Storage),
            Err(_) => {
                warn!(operation, timeout_ms = self.config.store_timeout.as_millis() as u64, "session store call timed out");
                Err(SessionError::Storage(StoreError::Timeout))
            }
        }
    }
}

fn span(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d.min(MAX_LIFETIME)).unwrap_or_else(|_| chrono::Duration::zero())
}

fn not_found_as(replacement: SessionError) -> impl FnOnce(SessionError) -> SessionError {
    move |e| match e {
        SessionError::Storage(StoreError::NotFound) => replacement,
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::InMemorySessionStore;
    use chrono::Duration as ChronoDuration;
    use larder_auth::{Hs256TokenCodec, PermissionSet, Role};
    use larder_core::ManualClock;
    use secrecy::SecretString;

    fn codec() -> Arc<dyn TokenCodec> {
        Arc::new(Hs256TokenCodec::new(&SecretString::from("test-secret".to_string())))
    }

    fn principal() -> Principal {
        Principal::new(UserId::new(), "prep", Role::new("staff"), PermissionSet::new())
    }

    fn manager(
        config: SessionConfig,
    ) -> (SessionLifecycleManager<Arc<InMemorySessionStore>>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(InMemorySessionStore::new());
        let m = SessionLifecycleManager::new(store, codec(), clock.clone(), config).unwrap();
        (m, clock)
    }

    #[test]
    fn default_config_is_valid() {
        let config = SessionConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_concurrent_sessions, 5);
        assert_eq!(config.default_expiration, Duration::from_secs(86_400));
    }

    #[test]
    fn zero_cap_is_rejected() {
        let config = SessionConfig {
            max_concurrent_sessions: 0,
            ..SessionConfig::default()
        };
        assert!(matches!(config.validate(), Err(DomainError::Validation(_))));
    }

    #[tokio::test]
    async fn remember_me_uses_the_longer_lifetime() {
        let (m, clock) = manager(SessionConfig::default());
        let p = principal();

        let short = m.create(&p, false).await.unwrap();
        let long = m.create(&p, true).await.unwrap();

        let now = clock.now();
        assert!(short.session.expires_at <= now + ChronoDuration::days(1));
        assert!(short.session.expires_at > now + ChronoDuration::days(1) - ChronoDuration::seconds(2));
        assert!(long.session.expires_at > now + ChronoDuration::days(29));
        assert_ne!(short.token, long.token);
    }

    #[tokio::test]
    async fn stored_session_holds_only_the_hash() {
        let (m, _) = manager(SessionConfig::default());
        let issued = m.create(&principal(), false).await.unwrap();

        let stored = m.store().get_by_id(issued.session.session_id).await.unwrap();
        assert_eq!(stored.token_hash, TokenHash::of(&issued.token));
        assert_ne!(stored.token_hash.as_str(), issued.token);
        assert!(!format!("{issued:?}").contains(&issued.token));
    }

    #[tokio::test]
    async fn validate_returns_the_issued_claims() {
        let (m, _) = manager(SessionConfig::default());
        let p = principal();
        let issued = m.create(&p, false).await.unwrap();

        let claims = m.validate(&issued.token).await.unwrap();
        assert_eq!(claims.sub, p.user_id);
        assert_eq!(claims.session_id, issued.session.session_id);
    }

    #[tokio::test]
    async fn validate_rejects_expired_tokens_before_storage() {
        let (m, clock) = manager(SessionConfig::default());
        let issued = m.create(&principal(), false).await.unwrap();

        clock.advance(ChronoDuration::days(2));
        assert_eq!(m.validate(&issued.token).await, Err(SessionError::ExpiredToken));
    }

    #[tokio::test]
    async fn validate_rejects_garbage() {
        let (m, _) = manager(SessionConfig::default());
        assert!(matches!(
            m.validate("garbage").await,
            Err(SessionError::MalformedToken(_))
        ));
    }

    #[tokio::test]
    async fn signing_failure_persists_nothing() {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(InMemorySessionStore::new());
        let unkeyed: Arc<dyn TokenCodec> =
            Arc::new(Hs256TokenCodec::new(&SecretString::from(String::new())));
        let m = SessionLifecycleManager::new(store.clone(), unkeyed, clock, SessionConfig::default())
            .unwrap();
        let p = principal();

        assert!(matches!(m.create(&p, false).await, Err(SessionError::Signing(_))));
        assert_eq!(store.count_active_by_user(p.user_id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn refresh_of_unknown_session_is_not_found() {
        let (m, _) = manager(SessionConfig::default());
        assert_eq!(m.refresh(SessionId::new()).await, Err(SessionError::SessionNotFound));
        assert_eq!(m.logout(SessionId::new()).await, Err(SessionError::SessionNotFound));
    }

    #[tokio::test]
    async fn refresh_of_logged_out_session_is_revoked() {
        let (m, _) = manager(SessionConfig::default());
        let issued = m.create(&principal(), false).await.unwrap();
        m.logout(issued.session.session_id).await.unwrap();

        assert_eq!(
            m.refresh(issued.session.session_id).await,
            Err(SessionError::SessionRevoked)
        );
    }

    #[tokio::test]
    async fn refresh_updates_last_activity() {
        let (m, clock) = manager(SessionConfig::default());
        let issued = m.create(&principal(), false).await.unwrap();

        clock.advance(ChronoDuration::minutes(10));
        m.refresh(issued.session.session_id).await.unwrap();

        let stored = m.store().get_by_id(issued.session.session_id).await.unwrap();
        assert_eq!(stored.last_activity, clock.now());
    }

    #[tokio::test]
    async fn refresh_far_from_expiry_keeps_the_token() {
        let (m, clock) = manager(SessionConfig::default());
        let issued = m.create(&principal(), false).await.unwrap();

        clock.advance(ChronoDuration::hours(1));
        let refreshed = m.refresh(issued.session.session_id).await.unwrap();
        assert_eq!(refreshed.token, None);
        assert!(m.validate(&issued.token).await.is_ok());
    }

    #[tokio::test]
    async fn created_at_is_read_after_the_user_lock() {
        let (m, clock) = manager(SessionConfig::default());
        let m = Arc::new(m);
        let p = principal();

        let slot = m.lock_user(p.user_id).await;
        let waiting = tokio::spawn({
            let (m, p) = (m.clone(), p.clone());
            async move { m.create(&p, false).await }
        });
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }

        clock.advance(ChronoDuration::seconds(30));
        let released_at = clock.now();
        drop(slot);

        let issued = waiting.await.unwrap().unwrap();
        assert_eq!(issued.session.created_at, released_at);
    }

    #[tokio::test]
    async fn lock_map_is_pruned_after_create() {
        let (m, _) = manager(SessionConfig::default());
        m.create(&principal(), false).await.unwrap();
        assert!(m.user_locks.lock().unwrap().is_empty());
    }

    #[derive(Debug, Default)]
    struct StalledStore;

    #[async_trait::async_trait]
    impl SessionStore for StalledStore {
        async fn insert(&self, _: &Session) -> Result<(), StoreError> {
            std::future::pending().await
        }
        async fn get_by_id(&self, _: SessionId) -> Result<Session, StoreError> {
            std::future::pending().await
        }
        async fn get_by_token_hash(&self, _: &TokenHash) -> Result<Session, StoreError> {
            std::future::pending().await
        }
        async fn list_active_by_user(&self, _: UserId) -> Result<Vec<Session>, StoreError> {
            std::future::pending().await
        }
        async fn deactivate(&self, _: SessionId) -> Result<(), StoreError> {
            std::future::pending().await
        }
        async fn deactivate_all_for_user(&self, _: UserId) -> Result<u64, StoreError> {
            std::future::pending().await
        }
        async fn deactivate_expired(&self, _: DateTime<Utc>) -> Result<u64, StoreError> {
            std::future::pending().await
        }
        async fn count_active_by_user(&self, _: UserId) -> Result<usize, StoreError> {
            std::future::pending().await
        }
        async fn touch(
            &self,
            _: SessionId,
            _: DateTime<Utc>,
            _: Option<SessionRenewal>,
        ) -> Result<Session, StoreError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_store_surfaces_timeout() {
        let config = SessionConfig {
            store_timeout: Duration::from_millis(50),
            ..SessionConfig::default()
        };
        let m = SessionLifecycleManager::new(
            StalledStore,
            codec(),
            Arc::new(ManualClock::default()),
            config,
        )
        .unwrap();

        assert_eq!(
            m.create(&principal(), false).await.unwrap_err(),
            SessionError::Storage(StoreError::Timeout)
        );
        assert_eq!(
            m.sweep_expired().await,
            Err(SessionError::Storage(StoreError::Timeout))
        );
    }
}
