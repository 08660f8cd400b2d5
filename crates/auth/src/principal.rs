use serde::{Deserialize, Serialize};

use larder_core::UserId;

use crate::{PermissionSet, Role};

/// An authenticated principal, as handed to session creation.
///
/// Construction is decoupled from storage: whatever verified the credentials
/// (password store, SSO bridge, ...) produces this value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub user_id: UserId,
    pub username: String,
    pub role: Role,
    pub permissions: PermissionSet,
}

impl Principal {
    pub fn new(user_id: UserId, username: impl Into<String>, role: Role, permissions: PermissionSet) -> Self {
        Self {
            user_id,
            username: username.into(),
            role,
            permissions,
        }
    }
}
