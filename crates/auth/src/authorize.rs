//! Permission evaluation over claims.
//!
//! - No IO
//! - No panics
//! - No dependency on the session store
//!
//! This is what lets every downstream service embed authorization checks
//! without talking to the session subsystem.

use thiserror::Error;
use tracing::debug;

use crate::{Claims, Permission};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthzError {
    #[error("forbidden: missing permission '{0}'")]
    Forbidden(String),
}

/// Membership test against the claims' permission set.
pub fn has_permission(claims: &Claims, permission: &Permission) -> bool {
    claims.permissions.contains(permission)
}

pub fn is_admin(claims: &Claims) -> bool {
    claims.role_name.is_admin()
}

/// Check a domain-qualified action (e.g. `orders` + `create`).
///
/// Admins are allowed everything; otherwise the composed permission or the
/// wildcard capability must be held. An unparseable domain/action pair is
/// never granted to non-admins.
pub fn has_action_permission(claims: &Claims, domain: &str, action: &str) -> bool {
    if is_admin(claims) {
        return true;
    }

    match Permission::action(domain, action) {
        Ok(required) => claims.permissions.grants_all() || has_permission(claims, &required),
        Err(e) => {
            debug!(domain, action, error = %e, "unparseable action permission");
            false
        }
    }
}

/// Handler-facing form of [`has_action_permission`].
pub fn require_action(claims: &Claims, domain: &str, action: &str) -> Result<(), AuthzError> {
    if has_action_permission(claims, domain, action) {
        Ok(())
    } else {
        Err(AuthzError::Forbidden(format!("{domain}:{action}")))
    }
}
