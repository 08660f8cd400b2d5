use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use larder_auth::TokenHash;
use larder_core::{SessionId, UserId};

use super::r#trait::{Session, SessionRenewal, SessionStore, StoreError};

#[derive(Debug)]
struct Entry {
    /// Insertion order; breaks `created_at` ties deterministically.
    seq: u64,
    session: Session,
}

#[derive(Debug, Default)]
struct Inner {
    sessions: HashMap<SessionId, Entry>,
    /// Secondary index. Holds every session ever inserted with a given hash,
    /// active or not; readers filter on `is_active`.
    by_hash: HashMap<TokenHash, Vec<SessionId>>,
    next_seq: u64,
}

impl Inner {
    fn active_for_user(&self, user_id: UserId) -> Vec<&Entry> {
        let mut entries: Vec<&Entry> = self
            .sessions
            .values()
            .filter(|e| e.session.is_active && e.session.user_id == user_id)
            .collect();
        entries.sort_by_key(|e| (e.session.created_at, e.seq));
        entries
    }
}

/// In-memory session store.
///
/// Intended for tests/dev and single-process deployments. Every operation
/// takes the lock exactly once, so each mutation is atomic.
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    inner: RwLock<Inner>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Inner>, StoreError> {
        self.inner
            .read()
            .map_err(|_| StoreError::Backend("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Inner>, StoreError> {
        self.inner
            .write()
            .map_err(|_| StoreError::Backend("lock poisoned".to_string()))
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn insert(&self, session: &Session) -> Result<(), StoreError> {
        let mut inner = self.write()?;

        if inner.sessions.contains_key(&session.session_id) {
            return Err(StoreError::Backend(format!(
                "session id {} already exists",
                session.session_id
            )));
        }

        let hash_taken = inner
            .by_hash
            .get(&session.token_hash)
            .into_iter()
            .flatten()
            .filter_map(|id| inner.sessions.get(id))
            .any(|e| e.session.is_active);
        if hash_taken {
            return Err(StoreError::DuplicateTokenHash);
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner
            .by_hash
            .entry(session.token_hash.clone())
            .or_default()
            .push(session.session_id);
        inner.sessions.insert(
            session.session_id,
            Entry {
                seq,
                session: session.clone(),
            },
        );
        Ok(())
    }

    async fn get_by_id(&self, session_id: SessionId) -> Result<Session, StoreError> {
        let inner = self.read()?;
        inner
            .sessions
            .get(&session_id)
            .map(|e| e.session.clone())
            .ok_or(StoreError::NotFound)
    }

    async fn get_by_token_hash(&self, token_hash: &TokenHash) -> Result<Session, StoreError> {
        let inner = self.read()?;
        inner
            .by_hash
            .get(token_hash)
            .into_iter()
            .flatten()
            .filter_map(|id| inner.sessions.get(id))
            .filter(|e| e.session.is_active)
            .max_by_key(|e| (e.session.created_at, e.seq))
            .map(|e| e.session.clone())
            .ok_or(StoreError::NotFound)
    }

    async fn list_active_by_user(&self, user_id: UserId) -> Result<Vec<Session>, StoreError> {
        let inner = self.read()?;
        Ok(inner
            .active_for_user(user_id)
            .into_iter()
            .map(|e| e.session.clone())
            .collect())
    }

    async fn deactivate(&self, session_id: SessionId) -> Result<(), StoreError> {
        let mut inner = self.write()?;
        let entry = inner.sessions.get_mut(&session_id).ok_or(StoreError::NotFound)?;
        entry.session.is_active = false;
        Ok(())
    }

    async fn deactivate_all_for_user(&self, user_id: UserId) -> Result<u64, StoreError> {
        let mut inner = self.write()?;
        let mut count = 0;
        for entry in inner.sessions.values_mut() {
            if entry.session.is_active && entry.session.user_id == user_id {
                entry.session.is_active = false;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn deactivate_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut inner = self.write()?;
        let mut count = 0;
        for entry in inner.sessions.values_mut() {
            if entry.session.is_active && entry.session.is_expired_at(now) {
                entry.session.is_active = false;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn count_active_by_user(&self, user_id: UserId) -> Result<usize, StoreError> {
        let inner = self.read()?;
        Ok(inner
            .sessions
            .values()
            .filter(|e| e.session.is_active && e.session.user_id == user_id)
            .count())
    }

    async fn touch(
        &self,
        session_id: SessionId,
        last_activity: DateTime<Utc>,
        renewal: Option<SessionRenewal>,
    ) -> Result<Session, StoreError> {
        let mut inner = self.write()?;
        let entry = inner.sessions.get(&session_id).ok_or(StoreError::NotFound)?;
        if !entry.session.is_active {
            return Err(StoreError::Inactive);
        }
        let old_hash = entry.session.token_hash.clone();

        if let Some(renewal) = &renewal {
            let hash_taken = inner
                .by_hash
                .get(&renewal.token_hash)
                .into_iter()
                .flatten()
                .filter(|id| **id != session_id)
                .filter_map(|id| inner.sessions.get(id))
                .any(|e| e.session.is_active);
            if hash_taken {
                return Err(StoreError::DuplicateTokenHash);
            }

            if let Some(ids) = inner.by_hash.get_mut(&old_hash) {
                ids.retain(|id| *id != session_id);
                if ids.is_empty() {
                    inner.by_hash.remove(&old_hash);
                }
            }
            inner
                .by_hash
                .entry(renewal.token_hash.clone())
                .or_default()
                .push(session_id);
        }

        let entry = inner.sessions.get_mut(&session_id).ok_or(StoreError::NotFound)?;
        entry.session.last_activity = last_activity;
        if let Some(renewal) = renewal {
            entry.session.expires_at = renewal.expires_at;
            entry.session.token_hash = renewal.token_hash;
        }
        Ok(entry.session.clone())
    }
}
