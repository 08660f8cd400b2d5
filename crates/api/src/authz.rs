//! API-side authorization guard for handlers.
//!
//! Evaluation is delegated to `larder_auth`; this only adapts it to the
//! request context and the API error type.

use tracing::info;

use larder_auth::require_action;

use crate::app::errors::ApiError;
use crate::context::SessionContext;

/// Require `"{domain}:{action}"` (or admin / wildcard) for the current session.
pub fn authorize_action(ctx: &SessionContext, domain: &str, action: &str) -> Result<(), ApiError> {
    require_action(ctx.claims(), domain, action).map_err(|e| {
        info!(user_id = %ctx.user_id(), domain, action, "permission denied");
        ApiError::from(e)
    })
}
