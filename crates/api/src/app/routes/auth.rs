use std::sync::Arc;

use axum::{
    extract::Extension,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use tracing::info;

use crate::app::dto::{
    CurrentSessionResponse, DeactivatedResponse, LoginRequest, LoginResponse, RefreshResponse,
    SessionListResponse, SessionView,
};
use crate::app::errors::ApiError;
use crate::app::services::AppServices;
use crate::context::SessionContext;
use larder_infra::credentials::CredentialStore;

/// Session routes that require an authenticated caller.
pub fn router() -> Router {
    Router::new()
        .route("/auth/session", get(current_session))
        .route("/auth/sessions", get(list_sessions))
        .route("/auth/refresh", post(refresh))
        .route("/auth/logout", post(logout))
        .route("/auth/logout-all", post(logout_all))
}

pub async fn login(
    Extension(services): Extension<Arc<AppServices>>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    if req.username.trim().is_empty() || req.password.is_empty() {
        return Err(ApiError::BadRequest("username and password are required".into()));
    }

    let principal = services
        .credentials
        .verify(&req.username, &req.password)
        .await?
        .ok_or(ApiError::InvalidCredentials)?;

    let issued = services.sessions.create(&principal, req.remember_me).await?;
    info!(user_id = %principal.user_id, session_id = %issued.session.session_id, "login succeeded");

    Ok(Json(LoginResponse {
        session_id: issued.session.session_id,
        expires_at: issued.session.expires_at,
        token: issued.token,
    }))
}

async fn current_session(Extension(ctx): Extension<SessionContext>) -> Json<CurrentSessionResponse> {
    Json(CurrentSessionResponse::from(&ctx))
}

async fn list_sessions(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<SessionContext>,
) -> Result<Json<SessionListResponse>, ApiError> {
    let sessions = services.sessions.active_sessions(ctx.user_id()).await?;
    Ok(Json(SessionListResponse {
        sessions: sessions
            .iter()
            .map(|s| SessionView::from_session(s, ctx.session_id()))
            .collect(),
    }))
}

async fn refresh(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<SessionContext>,
) -> Result<Json<RefreshResponse>, ApiError> {
    let refreshed = services.sessions.refresh(ctx.session_id()).await?;
    Ok(Json(RefreshResponse {
        expires_at: refreshed.expires_at,
        token: refreshed.token,
    }))
}

async fn logout(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<SessionContext>,
) -> Result<StatusCode, ApiError> {
    services.sessions.logout(ctx.session_id()).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn logout_all(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<SessionContext>,
) -> Result<Json<DeactivatedResponse>, ApiError> {
    let deactivated = services.sessions.logout_all(ctx.user_id()).await?;
    Ok(Json(DeactivatedResponse { deactivated }))
}
