//! Session persistence and lifecycle.
//!
//! [`SessionStore`] is the storage boundary; [`SessionLifecycleManager`] owns
//! every rule about when sessions are created, extended and terminated.

pub mod in_memory;
pub mod manager;
pub mod postgres;
#[cfg(feature = "redis")]
pub mod redis;
pub mod r#trait;

pub use in_memory::InMemorySessionStore;
pub use manager::{IssuedSession, Refreshed, SessionConfig, SessionError, SessionLifecycleManager};
pub use postgres::PostgresSessionStore;
#[cfg(feature = "redis")]
pub use redis::RedisSessionStore;
pub use r#trait::{Session, SessionRenewal, SessionStore, StoreError};
