//! Authentication backend trait.

use async_trait::async_trait;

use crate::{AuthContext, AuthError};

/// Trait for authentication backends.
///
/// Implementations validate bearer credentials and return an
/// [`AuthContext`] on success.
#[async_trait]
pub trait AuthBackend: Send + Sync {
    /// Validates the given token and returns the authentication context.
    async fn validate(&self, token: &str) -> Result<AuthContext, AuthError>;

    /// Returns the name of this backend for logging/debugging.
    fn name(&self) -> &'static str;
}
