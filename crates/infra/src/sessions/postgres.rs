//! Postgres-backed session store.
//!
//! Schema: `migrations/0001_sessions.sql` (applied by [`PostgresSessionStore::migrate`]).
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError | Scenario |
//! |------------|----------------------|------------|----------|
//! | Database (unique violation on `uq_sessions_active_token_hash`) | `23505` | `DuplicateTokenHash` | Hash already held by an active session |
//! | Database (other) | Any other | `Backend` | Constraint or server errors |
//! | PoolTimedOut | N/A | `Timeout` | No connection available in time |
//! | PoolClosed | N/A | `Backend` | Connection pool was closed |
//! | Other | N/A | `Backend` | Network errors, decode failures, etc. |
//!
//! ## Atomicity
//!
//! Every mutation is a single SQL statement, so a caller that abandons the
//! future (deadline, disconnect) either sees the statement commit or not run.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::{Span, instrument};

use larder_auth::{PermissionSet, Role, TokenHash};
use larder_core::{SessionId, UserId};

use super::r#trait::{Session, SessionRenewal, SessionStore, StoreError};

const SCHEMA: &str = include_str!("../../migrations/0001_sessions.sql");

const ACTIVE_HASH_INDEX: &str = "uq_sessions_active_token_hash";

const SELECT_COLUMNS: &str = r#"
    session_id,
    user_id,
    username,
    role_name,
    permissions,
    token_hash,
    created_at,
    expires_at,
    last_activity,
    is_active
"#;

/// Postgres-backed session store.
///
/// Uses the SQLx connection pool, which is `Send + Sync` and shareable across tasks.
#[derive(Debug, Clone)]
pub struct PostgresSessionStore {
    pool: Arc<PgPool>,
}

impl PostgresSessionStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the `sessions` table and its indexes if missing.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }
}

#[async_trait]
impl SessionStore for PostgresSessionStore {
    #[instrument(skip(self, session), fields(session_id = %session.session_id, user_id = %session.user_id), err)]
    async fn insert(&self, session: &Session) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO sessions (
                session_id,
                user_id,
                username,
                role_name,
                permissions,
                token_hash,
                created_at,
                expires_at,
                last_activity,
                is_active
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(session.session_id.as_uuid())
        .bind(session.user_id.as_uuid())
        .bind(&session.username)
        .bind(session.role_name.as_str())
        .bind(session.permissions.to_strings())
        .bind(session.token_hash.as_str())
        .bind(session.created_at)
        .bind(session.expires_at)
        .bind(session.last_activity)
        .bind(session.is_active)
        .execute(&*self.pool)
        .await
        .map_err(|e| {
            if is_active_hash_violation(&e) {
                StoreError::DuplicateTokenHash
            } else {
                map_sqlx_error("insert_session", e)
            }
        })?;

        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn get_by_id(&self, session_id: SessionId) -> Result<Session, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM sessions WHERE session_id = $1"
        ))
        .bind(session_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_by_id", e))?;

        row.map(session_from_row).transpose()?.ok_or(StoreError::NotFound)
    }

    #[instrument(skip(self, token_hash), err)]
    async fn get_by_token_hash(&self, token_hash: &TokenHash) -> Result<Session, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {SELECT_COLUMNS}
            FROM sessions
            WHERE token_hash = $1 AND is_active
            ORDER BY created_at DESC, session_id DESC
            LIMIT 1
            "#
        ))
        .bind(token_hash.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_by_token_hash", e))?;

        row.map(session_from_row).transpose()?.ok_or(StoreError::NotFound)
    }

    #[instrument(skip(self), fields(session_count), err)]
    async fn list_active_by_user(&self, user_id: UserId) -> Result<Vec<Session>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {SELECT_COLUMNS}
            FROM sessions
            WHERE user_id = $1 AND is_active
            ORDER BY created_at ASC, session_id ASC
            "#
        ))
        .bind(user_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_active_by_user", e))?;

        let sessions = rows
            .into_iter()
            .map(session_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        Span::current().record("session_count", sessions.len());
        Ok(sessions)
    }

    #[instrument(skip(self), err)]
    async fn deactivate(&self, session_id: SessionId) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE sessions SET is_active = FALSE WHERE session_id = $1")
            .bind(session_id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("deactivate", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn deactivate_all_for_user(&self, user_id: UserId) -> Result<u64, StoreError> {
        let result =
            sqlx::query("UPDATE sessions SET is_active = FALSE WHERE user_id = $1 AND is_active")
                .bind(user_id.as_uuid())
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("deactivate_all_for_user", e))?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self), err)]
    async fn deactivate_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result =
            sqlx::query("UPDATE sessions SET is_active = FALSE WHERE is_active AND expires_at < $1")
                .bind(now)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("deactivate_expired", e))?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self), err)]
    async fn count_active_by_user(&self, user_id: UserId) -> Result<usize, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS active FROM sessions WHERE user_id = $1 AND is_active",
        )
        .bind(user_id.as_uuid())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("count_active_by_user", e))?;

        let active: i64 = row
            .try_get("active")
            .map_err(|e| StoreError::Backend(format!("failed to read count: {e}")))?;
        Ok(active.max(0) as usize)
    }

    #[instrument(skip(self), err)]
    async fn touch(
        &self,
        session_id: SessionId,
        last_activity: DateTime<Utc>,
        renewal: Option<SessionRenewal>,
    ) -> Result<Session, StoreError> {
        let (expires_at, token_hash) = match renewal {
            Some(r) => (Some(r.expires_at), Some(r.token_hash.as_str().to_string())),
            None => (None, None),
        };

        let row = sqlx::query(&format!(
            r#"
            UPDATE sessions
            SET last_activity = $2,
                expires_at = COALESCE($3, expires_at),
                token_hash = COALESCE($4, token_hash)
            WHERE session_id = $1 AND is_active
            RETURNING {SELECT_COLUMNS}
            "#
        ))
        .bind(session_id.as_uuid())
        .bind(last_activity)
        .bind(expires_at)
        .bind(token_hash)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| {
            if is_active_hash_violation(&e) {
                StoreError::DuplicateTokenHash
            } else {
                map_sqlx_error("touch", e)
            }
        })?;

        match row {
            Some(row) => session_from_row(row),
            // Nothing was updated; tell unknown ids apart from deactivated ones.
            None => match self.get_by_id(session_id).await {
                Ok(_) => Err(StoreError::Inactive),
                Err(e) => Err(e),
            },
        }
    }
}

fn session_from_row(row: sqlx::postgres::PgRow) -> Result<Session, StoreError> {
    let decode = |e: sqlx::Error| StoreError::Backend(format!("failed to decode session row: {e}"));

    let permissions: Vec<String> = row.try_get("permissions").map_err(decode)?;
    let permissions = PermissionSet::from_strings(permissions)
        .map_err(|e| StoreError::Backend(format!("invalid stored permission: {e}")))?;
    let role_name: String = row.try_get("role_name").map_err(decode)?;
    let token_hash: String = row.try_get("token_hash").map_err(decode)?;

    Ok(Session {
        session_id: SessionId::from_uuid(row.try_get("session_id").map_err(decode)?),
        user_id: UserId::from_uuid(row.try_get("user_id").map_err(decode)?),
        username: row.try_get("username").map_err(decode)?,
        role_name: Role::from(role_name),
        permissions,
        token_hash: TokenHash::from_hex(token_hash),
        created_at: row.try_get("created_at").map_err(decode)?,
        expires_at: row.try_get("expires_at").map_err(decode)?,
        last_activity: row.try_get("last_activity").map_err(decode)?,
        is_active: row.try_get("is_active").map_err(decode)?,
    })
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => StoreError::Backend(format!(
            "database error in {}: {} (code {:?})",
            operation,
            db_err.message(),
            db_err.code()
        )),
        sqlx::Error::PoolTimedOut => StoreError::Timeout,
        sqlx::Error::PoolClosed => {
            StoreError::Backend(format!("connection pool closed in {operation}"))
        }
        _ => StoreError::Backend(format!("sqlx error in {operation}: {err}")),
    }
}

/// Unique violation on the partial "active token hash" index.
fn is_active_hash_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        return db_err.code().as_deref() == Some("23505")
            && db_err.constraint() == Some(ACTIVE_HASH_INDEX);
    }
    false
}
