//! Integration tests for the full session lifecycle.
//!
//! Tests: Principal → SessionLifecycleManager → TokenCodec + SessionStore → sweep
//!
//! Verifies:
//! - The concurrency cap evicts oldest-first and holds under parallel logins
//! - Logout revokes a token before its own expiry
//! - Refresh only extends sessions below the threshold, rotating the token
//! - The sweep boundary is exclusive

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
    use secrecy::SecretString;

    use larder_auth::{Hs256TokenCodec, PermissionSet, Principal, Role, TokenCodec, TokenHash};
    use larder_core::{Clock, ManualClock, SessionId, SystemClock, UserId};

    use crate::sessions::{
        InMemorySessionStore, Session, SessionConfig, SessionError, SessionLifecycleManager,
        SessionRenewal, SessionStore, StoreError,
    };

    type Manager = SessionLifecycleManager<Arc<InMemorySessionStore>>;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
    }

    fn codec() -> Arc<dyn TokenCodec> {
        Arc::new(Hs256TokenCodec::new(&SecretString::from("integration-secret".to_string())))
    }

    fn capped(max_concurrent_sessions: usize) -> SessionConfig {
        SessionConfig {
            max_concurrent_sessions,
            ..SessionConfig::default()
        }
    }

    fn setup(max_concurrent_sessions: usize) -> (Arc<Manager>, Arc<InMemorySessionStore>, Arc<ManualClock>) {
        let store = Arc::new(InMemorySessionStore::new());
        let clock = Arc::new(ManualClock::new(start()));
        let manager =
            SessionLifecycleManager::new(store.clone(), codec(), clock.clone(), capped(max_concurrent_sessions))
                .unwrap();
        (Arc::new(manager), store, clock)
    }

    /// Store wrapper that records the highest per-user active count seen
    /// right after any insert.
    #[derive(Debug, Default)]
    struct PeakTracking {
        inner: InMemorySessionStore,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl SessionStore for PeakTracking {
        async fn insert(&self, session: &Session) -> Result<(), StoreError> {
            self.inner.insert(session).await?;
            let active = self.inner.count_active_by_user(session.user_id).await?;
            self.peak.fetch_max(active, Ordering::SeqCst);
            Ok(())
        }
        async fn get_by_id(&self, id: SessionId) -> Result<Session, StoreError> {
            self.inner.get_by_id(id).await
        }
        async fn get_by_token_hash(&self, hash: &TokenHash) -> Result<Session, StoreError> {
            self.inner.get_by_token_hash(hash).await
        }
        async fn list_active_by_user(&self, user_id: UserId) -> Result<Vec<Session>, StoreError> {
            self.inner.list_active_by_user(user_id).await
        }
        async fn deactivate(&self, id: SessionId) -> Result<(), StoreError> {
            self.inner.deactivate(id).await
        }
        async fn deactivate_all_for_user(&self, user_id: UserId) -> Result<u64, StoreError> {
            self.inner.deactivate_all_for_user(user_id).await
        }
        async fn deactivate_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
            self.inner.deactivate_expired(now).await
        }
        async fn count_active_by_user(&self, user_id: UserId) -> Result<usize, StoreError> {
            self.inner.count_active_by_user(user_id).await
        }
        async fn touch(
            &self,
            id: SessionId,
            last_activity: DateTime<Utc>,
            renewal: Option<SessionRenewal>,
        ) -> Result<Session, StoreError> {
            self.inner.touch(id, last_activity, renewal).await
        }
    }

    fn principal(name: &str) -> Principal {
        let perms = PermissionSet::from_strings(["orders:create", "reports:view"]).unwrap();
        Principal::new(UserId::new(), name, Role::new("staff"), perms)
    }

    async fn active_ids(store: &InMemorySessionStore, user_id: UserId) -> Vec<SessionId> {
        store
            .list_active_by_user(user_id)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.session_id)
            .collect()
    }

    #[tokio::test]
    async fn oldest_sessions_are_evicted_past_the_cap() {
        for (max, k) in [(1, 1), (2, 3), (5, 4)] {
            let (manager, store, clock) = setup(max);
            let p = principal("line");

            let mut created = Vec::new();
            for _ in 0..max + k {
                created.push(manager.create(&p, false).await.unwrap().session.session_id);
                clock.advance(ChronoDuration::seconds(1));
            }

            let expected: Vec<_> = created[k..].to_vec();
            assert_eq!(active_ids(&store, p.user_id).await, expected, "max={max} k={k}");
            for evicted in &created[..k] {
                assert!(!store.get_by_id(*evicted).await.unwrap().is_active);
            }
        }
    }

    #[tokio::test]
    async fn logout_revokes_an_unexpired_token() {
        let (manager, _, _) = setup(5);
        let issued = manager.create(&principal("pastry"), false).await.unwrap();

        assert!(manager.validate(&issued.token).await.is_ok());

        manager.logout(issued.session.session_id).await.unwrap();
        assert_eq!(
            manager.validate(&issued.token).await,
            Err(SessionError::SessionRevoked)
        );

        // Idempotent.
        manager.logout(issued.session.session_id).await.unwrap();
    }

    #[tokio::test]
    async fn refresh_extends_only_below_the_threshold() {
        let (manager, store, clock) = setup(5);
        let issued = manager.create(&principal("grill"), false).await.unwrap();
        let id = issued.session.session_id;
        let original_expiry = issued.session.expires_at;

        // Plenty of lifetime left: only last_activity moves.
        clock.advance(ChronoDuration::hours(2));
        let refreshed = manager.refresh(id).await.unwrap();
        assert_eq!(refreshed.expires_at, original_expiry);
        assert!(refreshed.token.is_none());
        let stored = store.get_by_id(id).await.unwrap();
        assert_eq!(stored.expires_at, original_expiry);
        assert_eq!(stored.last_activity, clock.now());

        // Exactly at the threshold is still not "below" it.
        clock.set(original_expiry - ChronoDuration::hours(1));
        assert_eq!(manager.refresh(id).await.unwrap().expires_at, original_expiry);

        // Below the threshold: extended to now + default lifetime.
        clock.set(original_expiry - ChronoDuration::minutes(30));
        let extended = manager.refresh(id).await.unwrap();
        assert_eq!(extended.expires_at, clock.now() + ChronoDuration::days(1));
        assert!(extended.token.is_some());
        assert_eq!(store.get_by_id(id).await.unwrap().expires_at, extended.expires_at);
    }

    #[tokio::test]
    async fn refreshed_session_outlives_its_original_expiry() {
        let (manager, store, clock) = setup(5);
        let p = principal("saucier");
        let issued = manager.create(&p, false).await.unwrap();
        let id = issued.session.session_id;
        let original_expiry = issued.session.expires_at;

        clock.set(original_expiry - ChronoDuration::minutes(30));
        let refreshed = manager.refresh(id).await.unwrap();
        let renewed = refreshed.token.clone().unwrap();
        assert!(!format!("{refreshed:?}").contains(&renewed));

        // The replaced token is revoked at once.
        assert_eq!(
            manager.validate(&issued.token).await,
            Err(SessionError::SessionRevoked)
        );

        clock.set(original_expiry + ChronoDuration::seconds(1));
        let claims = manager.validate(&renewed).await.unwrap();
        assert_eq!(claims.session_id, id);
        assert_eq!(claims.expires_at, refreshed.expires_at);

        // Still one session holding one cap slot, and the sweep leaves it alone.
        assert_eq!(manager.sweep_expired().await.unwrap(), 0);
        assert_eq!(active_ids(&store, p.user_id).await, vec![id]);

        clock.set(refreshed.expires_at);
        assert_eq!(
            manager.validate(&renewed).await,
            Err(SessionError::ExpiredToken)
        );
    }

    #[tokio::test]
    async fn refresh_never_resurrects_an_expired_session() {
        let (manager, _, clock) = setup(5);
        let issued = manager.create(&principal("garde"), false).await.unwrap();

        clock.set(issued.session.expires_at + ChronoDuration::seconds(1));
        assert_eq!(
            manager.refresh(issued.session.session_id).await,
            Err(SessionError::ExpiredToken)
        );
    }

    #[tokio::test]
    async fn sweep_deactivates_strictly_expired_sessions() {
        let (manager, store, clock) = setup(10);
        let p = principal("dish");

        let a = manager.create(&p, false).await.unwrap().session;
        clock.advance(ChronoDuration::minutes(1));
        let b = manager.create(&p, false).await.unwrap().session;
        clock.advance(ChronoDuration::minutes(1));
        let c = manager.create(&p, true).await.unwrap().session;

        // Exactly at b's expiry: a is past, b sits on the boundary.
        clock.set(b.expires_at);
        assert_eq!(manager.sweep_expired().await.unwrap(), 1);
        assert_eq!(active_ids(&store, p.user_id).await, vec![b.session_id, c.session_id]);
        assert!(!store.get_by_id(a.session_id).await.unwrap().is_active);

        clock.advance(ChronoDuration::nanoseconds(1));
        assert_eq!(manager.sweep_expired().await.unwrap(), 1);
        assert_eq!(active_ids(&store, p.user_id).await, vec![c.session_id]);
    }

    #[tokio::test]
    async fn validate_reports_unswept_expiry_as_expired() {
        let (manager, _, clock) = setup(5);
        let issued = manager.create(&principal("tournant"), false).await.unwrap();

        clock.set(issued.session.expires_at);
        assert_eq!(
            manager.validate(&issued.token).await,
            Err(SessionError::ExpiredToken)
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn parallel_logins_never_exceed_the_cap() {
        let store = Arc::new(PeakTracking::default());
        let manager = Arc::new(
            SessionLifecycleManager::new(store.clone(), codec(), Arc::new(SystemClock), capped(3))
                .unwrap(),
        );
        let p = principal("expo");

        let handles: Vec<_> = (0..24)
            .map(|_| {
                let manager = manager.clone();
                let p = p.clone();
                tokio::spawn(async move { manager.create(&p, false).await })
            })
            .collect();

        let mut tokens = HashSet::new();
        for h in handles {
            tokens.insert(h.await.unwrap().unwrap().token);
        }

        assert_eq!(tokens.len(), 24);
        assert_eq!(store.count_active_by_user(p.user_id).await.unwrap(), 3);
        assert_eq!(store.peak.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn logout_all_ends_every_session_for_that_user_only() {
        let (manager, store, _) = setup(5);
        let (u1, u2) = (principal("u1"), principal("u2"));
        for _ in 0..3 {
            manager.create(&u1, false).await.unwrap();
        }
        let other = manager.create(&u2, false).await.unwrap();

        assert_eq!(manager.logout_all(u1.user_id).await.unwrap(), 3);
        assert!(active_ids(&store, u1.user_id).await.is_empty());
        assert!(manager.validate(&other.token).await.is_ok());
    }

    #[tokio::test]
    async fn end_to_end_cap_logout_and_sweep() {
        let (manager, store, clock) = setup(2);
        let u1 = principal("u1");

        let a = manager.create(&u1, false).await.unwrap();
        clock.advance(ChronoDuration::seconds(1));
        let b = manager.create(&u1, false).await.unwrap();
        clock.advance(ChronoDuration::seconds(1));
        let c = manager.create(&u1, false).await.unwrap();

        assert!(!store.get_by_id(a.session.session_id).await.unwrap().is_active);
        assert_eq!(
            active_ids(&store, u1.user_id).await,
            vec![b.session.session_id, c.session.session_id]
        );
        assert_eq!(manager.validate(&a.token).await, Err(SessionError::SessionRevoked));

        manager.logout(b.session.session_id).await.unwrap();
        assert_eq!(active_ids(&store, u1.user_id).await, vec![c.session.session_id]);

        clock.set(c.session.expires_at + ChronoDuration::seconds(1));
        manager.sweep_expired().await.unwrap();
        assert!(active_ids(&store, u1.user_id).await.is_empty());
        assert_eq!(
            manager.active_sessions(u1.user_id).await.unwrap(),
            Vec::new()
        );
    }
}
