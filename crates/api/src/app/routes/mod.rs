use axum::Router;

pub mod admin;
pub mod auth;
pub mod system;

/// Router for all authenticated endpoints.
pub fn router() -> Router {
    Router::new()
        .merge(auth::router())
        .merge(admin::router())
}
