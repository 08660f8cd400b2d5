//! Redis-backed session store (external cache backend).
//!
//! ## Layout
//!
//! - `{prefix}:session:{id}`: HASH: `doc` (immutable JSON part), `token_hash`,
//!   `user_id`, `expires_at`, `last_activity` (µs since epoch), `is_active` (`1`/`0`)
//! - `{prefix}:hash:{token_hash}`: STRING: id of the active session holding the hash
//! - `{prefix}:user:{user_id}`: ZSET of active session ids scored by `created_at` (µs)
//! - `{prefix}:expiry`: ZSET of active session ids scored by `expires_at` (µs)
//!
//! Every mutation runs as one server-side Lua script, so it is atomic and a
//! caller that stops waiting never observes half an update. Calls go through
//! the async multiplexed connection: dropping the future (for example on a
//! store timeout) before the command is written means the script never runs,
//! and nothing is left queued on a thread pool to run later. The scripts derive
//! index keys from the prefix, which assumes a single Redis node (no cluster
//! slot routing).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use larder_auth::{PermissionSet, Role, TokenHash};
use larder_core::{SessionId, UserId};

use super::r#trait::{Session, SessionRenewal, SessionStore, StoreError};

/// Default key prefix.
const DEFAULT_PREFIX: &str = "larder:sessions";

/// Shared Lua helper: deactivate one session and drop it from every index.
/// Returns -1 (unknown), 0 (already inactive) or 1 (deactivated).
const DEACTIVATE_FN: &str = r#"
local function deactivate(prefix, id)
  local key = prefix .. ':session:' .. id
  if redis.call('EXISTS', key) == 0 then return -1 end
  if redis.call('HGET', key, 'is_active') ~= '1' then return 0 end
  redis.call('HSET', key, 'is_active', '0')
  local hash_key = prefix .. ':hash:' .. redis.call('HGET', key, 'token_hash')
  if redis.call('GET', hash_key) == id then redis.call('DEL', hash_key) end
  redis.call('ZREM', prefix .. ':user:' .. redis.call('HGET', key, 'user_id'), id)
  redis.call('ZREM', prefix .. ':expiry', id)
  return 1
end
"#;

const INSERT_SCRIPT: &str = r#"
local prefix, id = ARGV[1], ARGV[2]
local key = prefix .. ':session:' .. id
local hash_key = prefix .. ':hash:' .. ARGV[4]
if redis.call('EXISTS', hash_key) == 1 then return 0 end
if redis.call('EXISTS', key) == 1 then return -1 end
redis.call('SET', hash_key, id)
redis.call('HSET', key, 'doc', ARGV[3], 'token_hash', ARGV[4], 'user_id', ARGV[5],
  'expires_at', ARGV[7], 'last_activity', ARGV[8], 'is_active', '1')
redis.call('ZADD', prefix .. ':user:' .. ARGV[5], ARGV[6], id)
redis.call('ZADD', prefix .. ':expiry', ARGV[7], id)
return 1
"#;

/// Returns -1 (unknown), 0 (inactive), -2 (new hash already held) or 1.
const TOUCH_SCRIPT: &str = r#"
local prefix, id = ARGV[1], ARGV[2]
local key = prefix .. ':session:' .. id
if redis.call('EXISTS', key) == 0 then return -1 end
if redis.call('HGET', key, 'is_active') ~= '1' then return 0 end
if ARGV[4] ~= '' then
  local new_hash_key = prefix .. ':hash:' .. ARGV[5]
  local holder = redis.call('GET', new_hash_key)
  if holder and holder ~= id then return -2 end
  local old_hash_key = prefix .. ':hash:' .. redis.call('HGET', key, 'token_hash')
  if redis.call('GET', old_hash_key) == id then redis.call('DEL', old_hash_key) end
  redis.call('SET', new_hash_key, id)
  redis.call('HSET', key, 'token_hash', ARGV[5], 'expires_at', ARGV[4])
  redis.call('ZADD', prefix .. ':expiry', ARGV[4], id)
end
redis.call('HSET', key, 'last_activity', ARGV[3])
return 1
"#;

/// Immutable part of a session, stored as JSON in the `doc` field.
#[derive(Debug, Serialize, Deserialize)]
struct SessionDoc {
    session_id: SessionId,
    user_id: UserId,
    username: String,
    role_name: Role,
    permissions: PermissionSet,
    created_at: DateTime<Utc>,
}

struct Scripts {
    insert: redis::Script,
    deactivate: redis::Script,
    deactivate_user: redis::Script,
    deactivate_expired: redis::Script,
    touch: redis::Script,
}

impl Scripts {
    fn new() -> Self {
        Self {
            insert: redis::Script::new(INSERT_SCRIPT),
            deactivate: redis::Script::new(&format!(
                "{DEACTIVATE_FN}\nreturn deactivate(ARGV[1], ARGV[2])"
            )),
            deactivate_user: redis::Script::new(&format!(
                r#"{DEACTIVATE_FN}
local ids = redis.call('ZRANGE', ARGV[1] .. ':user:' .. ARGV[2], 0, -1)
local n = 0
for _, id in ipairs(ids) do
  if deactivate(ARGV[1], id) == 1 then n = n + 1 end
end
return n"#
            )),
            deactivate_expired: redis::Script::new(&format!(
                r#"{DEACTIVATE_FN}
local ids = redis.call('ZRANGEBYSCORE', ARGV[1] .. ':expiry', '-inf', '(' .. ARGV[2])
local n = 0
for _, id in ipairs(ids) do
  if deactivate(ARGV[1], id) == 1 then n = n + 1 end
end
return n"#
            )),
            touch: redis::Script::new(TOUCH_SCRIPT),
        }
    }
}

struct Inner {
    client: redis::Client,
    prefix: String,
    scripts: Scripts,
}

impl Inner {
    fn session_key(&self, id: SessionId) -> String {
        format!("{}:session:{}", self.prefix, id)
    }

    fn hash_key(&self, hash: &TokenHash) -> String {
        format!("{}:hash:{}", self.prefix, hash)
    }

    fn user_key(&self, user_id: UserId) -> String {
        format!("{}:user:{}", self.prefix, user_id)
    }

    async fn load(
        &self,
        conn: &mut MultiplexedConnection,
        id: SessionId,
    ) -> Result<Session, StoreError> {
        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(self.session_key(id))
            .query_async(conn)
            .await
            .map_err(|e| map_redis_error("HGETALL", e))?;
        if fields.is_empty() {
            return Err(StoreError::NotFound);
        }
        session_from_fields(&fields)
    }
}

/// Redis-backed session store.
///
/// Opens one multiplexed async connection per call.
#[derive(Clone)]
pub struct RedisSessionStore {
    inner: Arc<Inner>,
}

impl core::fmt::Debug for RedisSessionStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisSessionStore")
            .field("prefix", &self.inner.prefix)
            .finish()
    }
}

impl RedisSessionStore {
    /// Create a new Redis session store.
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `prefix` - key prefix (default: "larder:sessions")
    pub fn new(redis_url: impl AsRef<str>, prefix: Option<String>) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| StoreError::Backend(format!("redis connection error: {e}")))?;

        Ok(Self {
            inner: Arc::new(Inner {
                client,
                prefix: prefix.unwrap_or_else(|| DEFAULT_PREFIX.to_string()),
                scripts: Scripts::new(),
            }),
        })
    }

    async fn connection(&self) -> Result<MultiplexedConnection, StoreError> {
        self.inner
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| map_redis_error("connect", e))
    }
}

#[async_trait]
impl SessionStore for RedisSessionStore {
    #[instrument(skip(self, session), fields(session_id = %session.session_id, user_id = %session.user_id), err)]
    async fn insert(&self, session: &Session) -> Result<(), StoreError> {
        let doc = serde_json::to_string(&SessionDoc {
            session_id: session.session_id,
            user_id: session.user_id,
            username: session.username.clone(),
            role_name: session.role_name.clone(),
            permissions: session.permissions.clone(),
            created_at: session.created_at,
        })
        .map_err(|e| StoreError::Backend(format!("session serialization failed: {e}")))?;

        let inner = &self.inner;
        let mut conn = self.connection().await?;
        let outcome: i64 = inner
            .scripts
            .insert
            .arg(&inner.prefix)
            .arg(session.session_id.to_string())
            .arg(doc)
            .arg(session.token_hash.as_str())
            .arg(session.user_id.to_string())
            .arg(session.created_at.timestamp_micros())
            .arg(session.expires_at.timestamp_micros())
            .arg(session.last_activity.timestamp_micros())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("insert", e))?;

        match outcome {
            1 => Ok(()),
            0 => Err(StoreError::DuplicateTokenHash),
            _ => Err(StoreError::Backend(format!(
                "session id {} already exists",
                session.session_id
            ))),
        }
    }

    #[instrument(skip(self), err)]
    async fn get_by_id(&self, session_id: SessionId) -> Result<Session, StoreError> {
        let mut conn = self.connection().await?;
        self.inner.load(&mut conn, session_id).await
    }

    #[instrument(skip(self, token_hash), err)]
    async fn get_by_token_hash(&self, token_hash: &TokenHash) -> Result<Session, StoreError> {
        let mut conn = self.connection().await?;
        let id: Option<String> = redis::cmd("GET")
            .arg(self.inner.hash_key(token_hash))
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("GET", e))?;
        let id: SessionId = id
            .ok_or(StoreError::NotFound)?
            .parse()
            .map_err(|e| StoreError::Backend(format!("corrupt hash index: {e}")))?;

        let session = self.inner.load(&mut conn, id).await?;
        if session.is_active && &session.token_hash == token_hash {
            Ok(session)
        } else {
            Err(StoreError::NotFound)
        }
    }

    #[instrument(skip(self), err)]
    async fn list_active_by_user(&self, user_id: UserId) -> Result<Vec<Session>, StoreError> {
        let mut conn = self.connection().await?;
        // ZRANGE is ascending by score (created_at): oldest first.
        let ids: Vec<String> = redis::cmd("ZRANGE")
            .arg(self.inner.user_key(user_id))
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("ZRANGE", e))?;

        let mut sessions = Vec::with_capacity(ids.len());
        for id in ids {
            let id: SessionId = id
                .parse()
                .map_err(|e| StoreError::Backend(format!("corrupt user index: {e}")))?;
            match self.inner.load(&mut conn, id).await {
                Ok(s) if s.is_active => sessions.push(s),
                Ok(_) | Err(StoreError::NotFound) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(sessions)
    }

    #[instrument(skip(self), err)]
    async fn deactivate(&self, session_id: SessionId) -> Result<(), StoreError> {
        let inner = &self.inner;
        let mut conn = self.connection().await?;
        let outcome: i64 = inner
            .scripts
            .deactivate
            .arg(&inner.prefix)
            .arg(session_id.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("deactivate", e))?;

        if outcome < 0 {
            Err(StoreError::NotFound)
        } else {
            Ok(())
        }
    }

    #[instrument(skip(self), err)]
    async fn deactivate_all_for_user(&self, user_id: UserId) -> Result<u64, StoreError> {
        let inner = &self.inner;
        let mut conn = self.connection().await?;
        inner
            .scripts
            .deactivate_user
            .arg(&inner.prefix)
            .arg(user_id.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("deactivate_all_for_user", e))
    }

    #[instrument(skip(self), err)]
    async fn deactivate_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let inner = &self.inner;
        let mut conn = self.connection().await?;
        inner
            .scripts
            .deactivate_expired
            .arg(&inner.prefix)
            .arg(now.timestamp_micros())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("deactivate_expired", e))
    }

    #[instrument(skip(self), err)]
    async fn count_active_by_user(&self, user_id: UserId) -> Result<usize, StoreError> {
        let mut conn = self.connection().await?;
        redis::cmd("ZCARD")
            .arg(self.inner.user_key(user_id))
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("ZCARD", e))
    }

    #[instrument(skip(self, renewal), err)]
    async fn touch(
        &self,
        session_id: SessionId,
        last_activity: DateTime<Utc>,
        renewal: Option<SessionRenewal>,
    ) -> Result<Session, StoreError> {
        let (expires_at, token_hash) = match &renewal {
            Some(r) => (
                r.expires_at.timestamp_micros().to_string(),
                r.token_hash.as_str().to_string(),
            ),
            None => (String::new(), String::new()),
        };

        let inner = &self.inner;
        let mut conn = self.connection().await?;
        let outcome: i64 = inner
            .scripts
            .touch
            .arg(&inner.prefix)
            .arg(session_id.to_string())
            .arg(last_activity.timestamp_micros())
            .arg(expires_at)
            .arg(token_hash)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("touch", e))?;

        match outcome {
            1 => inner.load(&mut conn, session_id).await,
            0 => Err(StoreError::Inactive),
            -2 => Err(StoreError::DuplicateTokenHash),
            _ => Err(StoreError::NotFound),
        }
    }
}

fn session_from_fields(fields: &HashMap<String, String>) -> Result<Session, StoreError> {
    let field = |name: &str| {
        fields
            .get(name)
            .ok_or_else(|| StoreError::Backend(format!("session hash is missing '{name}'")))
    };
    let micros = |name: &str| -> Result<DateTime<Utc>, StoreError> {
        field(name)?
            .parse::<i64>()
            .ok()
            .and_then(DateTime::from_timestamp_micros)
            .ok_or_else(|| StoreError::Backend(format!("session field '{name}' is not a timestamp")))
    };

    let doc: SessionDoc = serde_json::from_str(field("doc")?)
        .map_err(|e| StoreError::Backend(format!("session deserialization failed: {e}")))?;

    Ok(Session {
        session_id: doc.session_id,
        user_id: doc.user_id,
        username: doc.username,
        role_name: doc.role_name,
        permissions: doc.permissions,
        token_hash: TokenHash::from_hex(field("token_hash")?.as_str()),
        created_at: doc.created_at,
        expires_at: micros("expires_at")?,
        last_activity: micros("last_activity")?,
        is_active: field("is_active")? == "1",
    })
}

fn map_redis_error(operation: &str, err: redis::RedisError) -> StoreError {
    if err.is_timeout() {
        StoreError::Timeout
    } else {
        StoreError::Backend(format!("redis error in {operation}: {err}"))
    }
}
