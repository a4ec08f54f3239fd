use async_trait::async_trait;
use thiserror::Error;

use crate::core::instance::Instance;

/// Errors returned by a registry query.
#[derive(Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum RegistryError {
    /// The registry could not be reached or did not answer in time.
    #[error("Registry unreachable: {0}")]
    Unreachable(String),

    /// The registry answered with an unexpected status.
    #[error("Registry returned status {status}: {message}")]
    Status { status: u16, message: String },

    /// The registry answer could not be decoded.
    #[error("Invalid registry response: {0}")]
    InvalidResponse(String),
}

/// Result type alias for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// ServiceRegistry is the port for looking up service instances.
///
/// Implementations return the instances currently considered healthy. An
/// empty list is a valid answer and distinct from an error.
#[async_trait]
pub trait ServiceRegistry: Send + Sync + 'static {
    async fn fetch_instances(&self, service: &str) -> RegistryResult<Vec<Instance>>;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}
