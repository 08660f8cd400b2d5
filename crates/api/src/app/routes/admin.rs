use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    routing::delete,
    Json, Router,
};
use tracing::info;

use larder_core::UserId;

use crate::app::dto::DeactivatedResponse;
use crate::app::errors::ApiError;
use crate::app::services::AppServices;
use crate::authz::authorize_action;
use crate::context::SessionContext;

pub fn router() -> Router {
    Router::new().route("/admin/users/:user_id/sessions", delete(terminate_user_sessions))
}

/// Force-logout every session of another user. Requires `sessions:manage`.
async fn terminate_user_sessions(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<SessionContext>,
    Path(user_id): Path<String>,
) -> Result<Json<DeactivatedResponse>, ApiError> {
    authorize_action(&ctx, "sessions", "manage")?;

    let user_id: UserId = user_id
        .parse()
        .map_err(|_| ApiError::BadRequest("user_id must be a UUID".into()))?;

    let deactivated = services.sessions.logout_all(user_id).await?;
    info!(admin = %ctx.user_id(), target = %user_id, deactivated, "sessions terminated by admin");

    Ok(Json(DeactivatedResponse { deactivated }))
}
