use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use larder_core::{SessionId, UserId};

use crate::{PermissionSet, Principal, Role, TokenError};

/// Identity/authorization payload carried inside a signed token.
///
/// Never persisted on its own; sessions keep a denormalized copy of the
/// role and permissions at issuance time. Timestamps travel as Unix seconds,
/// so they are truncated to whole seconds on construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Subject / principal identifier.
    pub sub: UserId,

    /// Session this token belongs to. Makes every issued token unique.
    #[serde(rename = "jti")]
    pub session_id: SessionId,

    pub username: String,

    #[serde(rename = "role")]
    pub role_name: Role,

    pub permissions: PermissionSet,

    #[serde(rename = "iat", with = "chrono::serde::ts_seconds")]
    pub issued_at: DateTime<Utc>,

    #[serde(rename = "exp", with = "chrono::serde::ts_seconds")]
    pub expires_at: DateTime<Utc>,
}

impl Claims {
    pub fn for_principal(
        principal: &Principal,
        session_id: SessionId,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            sub: principal.user_id,
            session_id,
            username: principal.username.clone(),
            role_name: principal.role.clone(),
            permissions: principal.permissions.clone(),
            issued_at: whole_seconds(issued_at),
            expires_at: whole_seconds(expires_at),
        }
    }
}

fn whole_seconds(at: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(at.timestamp(), 0).unwrap_or(at)
}

/// Deterministically validate the time window of decoded claims.
///
/// Note: this validates the *claims* only. Signature verification happens in
/// the token codec before this is called.
pub fn validate_claims(claims: &Claims, now: DateTime<Utc>) -> Result<(), TokenError> {
    if claims.expires_at <= claims.issued_at {
        return Err(TokenError::Malformed("expires_at <= issued_at".to_string()));
    }
    if now >= claims.expires_at {
        return Err(TokenError::Expired);
    }
    Ok(())
}
