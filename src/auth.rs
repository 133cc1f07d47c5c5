use async_trait::async_trait;

use crate::error::Result;

/// Boundary to the authentication layer.
///
/// The realtime core never refreshes or validates credentials itself; it asks
/// this provider for a currently-valid bearer token every time it builds an
/// outbound envelope. A provider that cannot produce a token should return
/// [`crate::RealtimeError::InvalidRequest`], which callers see as an
/// unauthenticated failure.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Returns a currently-valid JWT, refreshing it first if expired.
    async fn get_jwt_token(&self) -> Result<String>;

    /// Stable identifier of the authenticated user.
    fn user_id(&self) -> &str;
}

/// Fixed-token provider for tests and pre-authenticated environments.
#[derive(Debug, Clone)]
pub struct StaticTokenProvider {
    token: String,
    user_id: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            user_id: user_id.into(),
        }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn get_jwt_token(&self) -> Result<String> {
        Ok(self.token.clone())
    }

    fn user_id(&self) -> &str {
        &self.user_id
    }
}
