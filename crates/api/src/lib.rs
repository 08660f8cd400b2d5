//! HTTP API: trust boundary, authentication, session routes and wiring.

pub mod app;
pub mod authz;
pub mod config;
pub mod context;
pub mod middleware;
