//! Infrastructure wiring: session store backend, lifecycle manager, sweep
//! worker and credential store.

use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use thiserror::Error;
use tracing::info;

use larder_auth::{Capability, Hs256TokenCodec, PermissionSet, Principal, Role, TokenCodec};
use larder_core::{Clock, DomainError, SystemClock, UserId};
use larder_infra::credentials::{CredentialError, InMemoryCredentialStore};
use larder_infra::sessions::{
    InMemorySessionStore, PostgresSessionStore, SessionLifecycleManager, SessionStore, StoreError,
};
use larder_infra::workers::{SweepHandle, SweepWorker};

use crate::config::{Config, ConfigError, StoreBackend};

/// Session manager over whichever backend was configured.
pub type SessionManager = SessionLifecycleManager<Arc<dyn SessionStore>>;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("invalid session settings: {0}")]
    Session(#[from] DomainError),

    #[error("session store initialisation failed: {0}")]
    Store(#[from] StoreError),

    #[error("database connection failed: {0}")]
    Database(#[from] sqlx::Error),

    #[error("seeding bootstrap admin failed: {0}")]
    Credentials(#[from] CredentialError),

    #[error("SESSION_STORE=redis requires the `redis` feature")]
    RedisUnavailable,
}

/// Shared application services handed to handlers.
#[derive(Debug, Clone)]
pub struct AppServices {
    pub sessions: Arc<SessionManager>,
    pub credentials: Arc<InMemoryCredentialStore>,
}

/// Build services from configuration. Also returns the handle of the
/// running expiry sweep.
pub async fn build_services(config: &Config) -> Result<(AppServices, SweepHandle), StartupError> {
    let store = build_store(config).await?;

    let codec: Arc<dyn TokenCodec> =
        Arc::new(Hs256TokenCodec::new(&config.jwt_secret));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let session_config = config.session_config();
    let cleanup_interval = session_config.cleanup_interval;

    let sessions = Arc::new(SessionLifecycleManager::new(store, codec, clock, session_config)?);

    let credentials = Arc::new(InMemoryCredentialStore::new(config.password_hashing()?)?);
    if let Some((username, password)) = config.bootstrap_admin() {
        let mut permissions = PermissionSet::new();
        permissions.insert(Capability::All);
        let admin = Principal::new(UserId::new(), username, Role::ADMIN, permissions);
        credentials.add_user(admin, password).await?;
        info!(username, "bootstrap admin account created");
    }

    let sweeper = SweepWorker::spawn(sessions.clone(), cleanup_interval);

    Ok((
        AppServices {
            sessions,
            credentials,
        },
        sweeper,
    ))
}

async fn build_store(config: &Config) -> Result<Arc<dyn SessionStore>, StartupError> {
    match config.session_store {
        StoreBackend::Memory => {
            info!("using in-memory session store");
            Ok(Arc::new(InMemorySessionStore::new()))
        }
        StoreBackend::Database => {
            let url = config
                .database_url
                .as_deref()
                .ok_or(ConfigError::MissingDatabaseUrl)?;
            let pool = PgPoolOptions::new()
                .acquire_timeout(config.session_config().store_timeout)
                .connect(url)
                .await?;
            let store = PostgresSessionStore::new(pool);
            store.migrate().await?;
            info!("using postgres session store");
            Ok(Arc::new(store))
        }
        StoreBackend::Redis => redis_store(config),
    }
}

#[cfg(feature = "redis")]
fn redis_store(config: &Config) -> Result<Arc<dyn SessionStore>, StartupError> {
    let store = larder_infra::sessions::RedisSessionStore::new(&config.redis_url, None)?;
    info!("using redis session store");
    Ok(Arc::new(store))
}

#[cfg(not(feature = "redis"))]
fn redis_store(_config: &Config) -> Result<Arc<dyn SessionStore>, StartupError> {
    Err(StartupError::RedisUnavailable)
}
