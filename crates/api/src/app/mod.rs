//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: infrastructure wiring (session store, lifecycle manager, sweeper, credentials)
//! - `routes/`: HTTP routes + handlers
//! - `dto.rs`: request/response DTOs
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Extension, Router,
};
use tower::ServiceBuilder;

use larder_infra::workers::SweepHandle;

use crate::config::Config;
use crate::middleware;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

pub use services::{AppServices, StartupError};

/// A built application: the router plus the background work it owns.
pub struct App {
    pub router: Router,
    pub services: Arc<AppServices>,
    pub sweeper: SweepHandle,
}

/// Build the full HTTP router (public entrypoint used by `main.rs`).
pub async fn build_app(config: &Config) -> Result<App, StartupError> {
    config.validate()?;

    let (services, sweeper) = services::build_services(config).await?;
    let services = Arc::new(services);
    let gateway = middleware::GatewayState::from_config(config)?;
    let auth_state = middleware::AuthState {
        sessions: services.sessions.clone(),
    };

    // Protected routes: require a valid session.
    let protected = routes::router().layer(axum::middleware::from_fn_with_state(
        auth_state,
        middleware::auth_middleware,
    ));

    let router = Router::new()
        .route(&config.health_path, get(routes::system::health))
        .route("/auth/login", post(routes::auth::login))
        .merge(protected)
        .layer(
            ServiceBuilder::new()
                .layer(axum::middleware::from_fn_with_state(
                    gateway,
                    middleware::gateway_guard,
                ))
                .layer(Extension(services.clone())),
        );

    Ok(App {
        router,
        services,
        sweeper,
    })
}
