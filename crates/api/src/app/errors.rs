use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;
use tracing::{error, warn};

use larder_auth::AuthzError;
use larder_infra::credentials::CredentialError;
use larder_infra::sessions::{SessionError, StoreError};

/// Every failure a handler or middleware can return.
///
/// Authentication failures are deliberately indistinguishable to the caller.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid or expired session")]
    InvalidSession,

    #[error("invalid username or password")]
    InvalidCredentials,

    #[error("requests must be routed through the API gateway")]
    GatewayRequired,

    #[error(transparent)]
    Forbidden(#[from] AuthzError),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("session store unavailable: {0}")]
    StoreUnavailable(StoreError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        match err {
            e if e.is_authentication_failure() => ApiError::InvalidSession,
            SessionError::Storage(e) => ApiError::StoreUnavailable(e),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<CredentialError> for ApiError {
    fn from(err: CredentialError) -> Self {
        ApiError::Internal(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::InvalidSession => json_error(
                StatusCode::UNAUTHORIZED,
                "invalid_session",
                "invalid or expired session",
            ),
            ApiError::InvalidCredentials => json_error(
                StatusCode::UNAUTHORIZED,
                "invalid_credentials",
                "invalid username or password",
            ),
            ApiError::GatewayRequired => json_error(
                StatusCode::FORBIDDEN,
                "gateway_required",
                "requests must be routed through the API gateway",
            ),
            ApiError::Forbidden(AuthzError::Forbidden(permission)) => json_error(
                StatusCode::FORBIDDEN,
                "forbidden",
                format!("missing permission '{permission}'"),
            ),
            ApiError::BadRequest(msg) => json_error(StatusCode::BAD_REQUEST, "bad_request", msg),
            ApiError::StoreUnavailable(e) => {
                warn!(error = %e, "session store unavailable");
                json_error(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "session_store_unavailable",
                    "session store unavailable",
                )
            }
            ApiError::Internal(msg) => {
                error!(error = %msg, "internal error");
                json_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "internal server error",
                )
            }
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
