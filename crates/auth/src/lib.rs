//! `larder-auth`: pure authentication/authorization boundary.
//!
//! This crate is intentionally decoupled from HTTP and storage: it knows how to
//! sign and verify tokens and how to answer permission questions about claims,
//! nothing more.

pub mod authorize;
pub mod claims;
pub mod permissions;
pub mod principal;
pub mod roles;
pub mod token;

pub use authorize::{AuthzError, has_action_permission, has_permission, is_admin, require_action};
pub use claims::{Claims, validate_claims};
pub use permissions::{Capability, Permission, PermissionSet};
pub use principal::Principal;
pub use roles::Role;
pub use token::{Hs256TokenCodec, TokenCodec, TokenError, TokenHash};
