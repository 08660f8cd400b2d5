//! Infrastructure layer: session storage backends, session lifecycle,
//! background workers and credential verification.

pub mod credentials;
pub mod sessions;
pub mod workers;

#[cfg(test)]
mod integration_tests;
