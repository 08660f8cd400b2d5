use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, HeaderName},
    middleware::Next,
    response::{IntoResponse, Response},
};
use secrecy::{ExposeSecret, SecretString};
use tracing::warn;

use crate::app::errors::ApiError;
use crate::app::services::SessionManager;
use crate::config::{Config, ConfigError};
use crate::context::SessionContext;

/// Expected sentinel headers proving a request came through the gateway.
#[derive(Debug, Clone)]
pub struct GatewayState {
    header_name: HeaderName,
    header_value: String,
    secret_header_name: HeaderName,
    secret: SecretString,
    health_path: String,
}

impl GatewayState {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let header = |name: &str| {
            HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| ConfigError::InvalidHeaderName(name.to_string()))
        };

        Ok(Self {
            header_name: header(&config.gateway_header_name)?,
            header_value: config.gateway_header_value.clone(),
            secret_header_name: header(&config.gateway_secret_header_name)?,
            secret: config.gateway_secret.clone(),
            health_path: config.health_path.clone(),
        })
    }

    fn admits(&self, headers: &HeaderMap) -> bool {
        // An unset secret admits nobody.
        !self.secret.expose_secret().is_empty()
            && header_equals(headers, &self.header_name, &self.header_value)
            && header_equals(headers, &self.secret_header_name, self.secret.expose_secret())
    }
}

fn header_equals(headers: &HeaderMap, name: &HeaderName, expected: &str) -> bool {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == expected)
}

/// Trust boundary: runs before authentication on every route except the
/// health check.
pub async fn gateway_guard(
    State(state): State<GatewayState>,
    req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Response {
    if req.uri().path() == state.health_path || state.admits(req.headers()) {
        return next.run(req).await;
    }

    warn!(
        method = %req.method(),
        path = %req.uri().path(),
        "request rejected: not routed through gateway"
    );
    ApiError::GatewayRequired.into_response()
}

#[derive(Clone)]
pub struct AuthState {
    pub sessions: Arc<SessionManager>,
}

pub async fn auth_middleware(
    State(state): State<AuthState>,
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let token = extract_bearer(req.headers())?;
    let claims = state.sessions.validate(token).await?;

    req.extensions_mut().insert(SessionContext::new(claims));

    Ok(next.run(req).await)
}

fn extract_bearer(headers: &HeaderMap) -> Result<&str, ApiError> {
    let header = headers
        .get(axum::http::header::AUTHORIZATION)
        .ok_or(ApiError::InvalidSession)?;

    let header = header.to_str().map_err(|_| ApiError::InvalidSession)?;

    let header = header
        .strip_prefix("Bearer ")
        .ok_or(ApiError::InvalidSession)?;

    let token = header.trim();
    if token.is_empty() {
        return Err(ApiError::InvalidSession);
    }

    Ok(token)
}
