use larder_auth::Claims;
use larder_core::{SessionId, UserId};

/// Authenticated session for a request.
///
/// Inserted by the auth middleware; present on every protected route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    claims: Claims,
}

impl SessionContext {
    pub fn new(claims: Claims) -> Self {
        Self { claims }
    }

    pub fn user_id(&self) -> UserId {
        self.claims.sub
    }

    pub fn session_id(&self) -> SessionId {
        self.claims.session_id
    }

    pub fn claims(&self) -> &Claims {
        &self.claims
    }
}
