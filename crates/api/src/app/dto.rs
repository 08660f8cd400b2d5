use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use larder_core::{SessionId, UserId};
use larder_infra::sessions::Session;

use crate::context::SessionContext;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub remember_me: bool,
}

impl core::fmt::Debug for LoginRequest {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LoginRequest")
            .field("username", &self.username)
            .field("remember_me", &self.remember_me)
            .finish_non_exhaustive()
    }
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub session_id: SessionId,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct CurrentSessionResponse {
    pub user_id: UserId,
    pub username: String,
    pub role: String,
    pub permissions: Vec<String>,
    pub session_id: SessionId,
    pub issued_at: DateTime<Utc>,
    pub token_expires_at: DateTime<Utc>,
}

impl From<&SessionContext> for CurrentSessionResponse {
    fn from(ctx: &SessionContext) -> Self {
        let claims = ctx.claims();
        Self {
            user_id: claims.sub,
            username: claims.username.clone(),
            role: claims.role_name.to_string(),
            permissions: claims.permissions.to_strings(),
            session_id: claims.session_id,
            issued_at: claims.issued_at,
            token_expires_at: claims.expires_at,
        }
    }
}

/// Session as listed to its owner. Never carries the token hash.
#[derive(Debug, Serialize)]
pub struct SessionView {
    pub session_id: SessionId,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub current: bool,
}

impl SessionView {
    pub fn from_session(session: &Session, current: SessionId) -> Self {
        Self {
            session_id: session.session_id,
            created_at: session.created_at,
            expires_at: session.expires_at,
            last_activity: session.last_activity,
            current: session.session_id == current,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SessionListResponse {
    pub sessions: Vec<SessionView>,
}

/// `token` is present only when the session was extended; it replaces the
/// bearer token used for the request.
#[derive(Serialize)]
pub struct RefreshResponse {
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl core::fmt::Debug for RefreshResponse {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RefreshResponse")
            .field("expires_at", &self.expires_at)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Serialize)]
pub struct DeactivatedResponse {
    pub deactivated: u64,
}
