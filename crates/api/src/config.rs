//! Process configuration, read once at startup from flags or the environment.

use std::net::SocketAddr;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;

use larder_core::DomainError;
use larder_infra::credentials::{CredentialError, PasswordHashing};
use larder_infra::sessions::SessionConfig;

/// Where session records live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StoreBackend {
    Memory,
    Database,
    Redis,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid session settings: {0}")]
    Session(#[from] DomainError),

    #[error("invalid password hashing settings: {0}")]
    Hashing(#[from] CredentialError),

    #[error("GATEWAY_SECRET must be set")]
    MissingGatewaySecret,

    #[error("DATABASE_URL is required when SESSION_STORE=database")]
    MissingDatabaseUrl,

    #[error("BOOTSTRAP_ADMIN_USERNAME and BOOTSTRAP_ADMIN_PASSWORD must be set together")]
    PartialBootstrapAdmin,

    #[error("invalid header name '{0}'")]
    InvalidHeaderName(String),
}

#[derive(Clone, Parser)]
#[command(name = "larder-api", version, about = "Larder session and authentication service")]
pub struct Config {
    /// Address to bind the HTTP listener to
    #[arg(long, env = "LARDER_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: SocketAddr,

    /// Token signing secret; when empty every login fails to sign
    #[arg(long, env = "JWT_SECRET", default_value = "", hide_env_values = true)]
    pub jwt_secret: SecretString,

    #[arg(long, env = "SESSION_DEFAULT_EXPIRATION_SECS", default_value_t = 86_400)]
    pub session_default_expiration_secs: u64,

    #[arg(long, env = "SESSION_REMEMBER_ME_EXPIRATION_SECS", default_value_t = 2_592_000)]
    pub session_remember_me_expiration_secs: u64,

    /// Refresh extends a session only when less than this much lifetime is left
    #[arg(long, env = "SESSION_REFRESH_THRESHOLD_SECS", default_value_t = 3_600)]
    pub session_refresh_threshold_secs: u64,

    /// Interval of the background expiry sweep
    #[arg(long, env = "SESSION_CLEANUP_INTERVAL_SECS", default_value_t = 300)]
    pub session_cleanup_interval_secs: u64,

    /// Maximum concurrently active sessions per user
    #[arg(long, env = "SESSION_MAX_CONCURRENT", default_value_t = 5)]
    pub session_max_concurrent: usize,

    /// Deadline for each session store call
    #[arg(long, env = "SESSION_STORE_TIMEOUT_MS", default_value_t = 2_000)]
    pub session_store_timeout_ms: u64,

    #[arg(long, env = "SESSION_STORE", value_enum, default_value = "memory")]
    pub session_store: StoreBackend,

    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    pub database_url: Option<String>,

    #[arg(long, env = "REDIS_URL", default_value = "redis://localhost:6379", hide_env_values = true)]
    pub redis_url: String,

    #[arg(long, env = "GATEWAY_HEADER_NAME", default_value = "x-gateway-name")]
    pub gateway_header_name: String,

    #[arg(long, env = "GATEWAY_HEADER_VALUE", default_value = "larder-gateway")]
    pub gateway_header_value: String,

    #[arg(long, env = "GATEWAY_SECRET_HEADER_NAME", default_value = "x-gateway-secret")]
    pub gateway_secret_header_name: String,

    #[arg(long, env = "GATEWAY_SECRET", default_value = "", hide_env_values = true)]
    pub gateway_secret: SecretString,

    /// The only path reachable without gateway headers
    #[arg(long, env = "HEALTH_PATH", default_value = "/health")]
    pub health_path: String,

    #[arg(long, env = "BOOTSTRAP_ADMIN_USERNAME")]
    pub bootstrap_admin_username: Option<String>,

    #[arg(long, env = "BOOTSTRAP_ADMIN_PASSWORD", hide_env_values = true)]
    pub bootstrap_admin_password: Option<SecretString>,

    #[arg(long, env = "PASSWORD_HASH_MEMORY_KIB", default_value_t = 19_456)]
    pub password_hash_memory_kib: u32,

    #[arg(long, env = "PASSWORD_HASH_ITERATIONS", default_value_t = 2)]
    pub password_hash_iterations: u32,
}

impl core::fmt::Debug for Config {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Config")
            .field("listen_addr", &self.listen_addr)
            .field("jwt_secret_set", &!self.jwt_secret.expose_secret().is_empty())
            .field("session", &self.session_config())
            .field("session_store", &self.session_store)
            .field("gateway_header_name", &self.gateway_header_name)
            .field("gateway_secret_header_name", &self.gateway_secret_header_name)
            .field("health_path", &self.health_path)
            .field("bootstrap_admin_username", &self.bootstrap_admin_username)
            .finish_non_exhaustive()
    }
}

impl Config {
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            default_expiration: Duration::from_secs(self.session_default_expiration_secs),
            remember_me_expiration: Duration::from_secs(self.session_remember_me_expiration_secs),
            refresh_threshold: Duration::from_secs(self.session_refresh_threshold_secs),
            cleanup_interval: Duration::from_secs(self.session_cleanup_interval_secs),
            max_concurrent_sessions: self.session_max_concurrent,
            store_timeout: Duration::from_millis(self.session_store_timeout_ms),
        }
    }

    pub fn password_hashing(&self) -> Result<PasswordHashing, ConfigError> {
        Ok(PasswordHashing::new(
            self.password_hash_memory_kib,
            self.password_hash_iterations,
        )?)
    }

    /// The bootstrap admin account, if both halves are configured.
    pub fn bootstrap_admin(&self) -> Option<(&str, &str)> {
        match (&self.bootstrap_admin_username, &self.bootstrap_admin_password) {
            (Some(user), Some(password)) => Some((user.as_str(), password.expose_secret())),
            _ => None,
        }
    }

    /// Reject inconsistent settings before anything is started.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.session_config().validate()?;
        self.password_hashing()?;

        if self.gateway_secret.expose_secret().is_empty() {
            return Err(ConfigError::MissingGatewaySecret);
        }
        for name in [&self.gateway_header_name, &self.gateway_secret_header_name] {
            if axum::http::HeaderName::from_bytes(name.as_bytes()).is_err() {
                return Err(ConfigError::InvalidHeaderName(name.clone()));
            }
        }
        if self.session_store == StoreBackend::Database && self.database_url.is_none() {
            return Err(ConfigError::MissingDatabaseUrl);
        }
        if self.bootstrap_admin_username.is_some() != self.bootstrap_admin_password.is_some() {
            return Err(ConfigError::PartialBootstrapAdmin);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> Config {
        let mut args = vec!["larder-api", "--gateway-secret", "s3cret"];
        args.extend_from_slice(extra);
        Config::try_parse_from(args).unwrap()
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = parse(&[]);
        let session = config.session_config();

        assert_eq!(session, SessionConfig::default());
        assert_eq!(config.session_store, StoreBackend::Memory);
        assert_eq!(config.health_path, "/health");
        assert_eq!(config.gateway_header_name, "x-gateway-name");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn database_backend_needs_a_url() {
        let config = parse(&["--session-store", "database"]);
        assert!(matches!(config.validate(), Err(ConfigError::MissingDatabaseUrl)));
    }

    #[test]
    fn missing_gateway_secret_is_rejected() {
        let config = Config::try_parse_from(["larder-api"]).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::MissingGatewaySecret)));
    }

    #[test]
    fn zero_session_cap_is_rejected() {
        let config = parse(&["--session-max-concurrent", "0"]);
        assert!(matches!(config.validate(), Err(ConfigError::Session(_))));
    }

    #[test]
    fn debug_output_hides_secrets() {
        let config = parse(&["--jwt-secret", "very-secret-key"]);
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("very-secret-key"));
        assert!(!rendered.contains("s3cret"));
    }

    #[test]
    fn secrets_parse_into_secret_strings() {
        let config = parse(&[
            "--jwt-secret",
            "signing-key",
            "--bootstrap-admin-username",
            "root",
            "--bootstrap-admin-password",
            "hunter22",
        ]);
        assert_eq!(config.jwt_secret.expose_secret(), "signing-key");
        assert_eq!(config.gateway_secret.expose_secret(), "s3cret");
        assert_eq!(config.bootstrap_admin(), Some(("root", "hunter22")));
    }
}
