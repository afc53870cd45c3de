use thiserror::Error;

use crate::{conf::ConfError, health::HealthError, k8s::K8sError};

/// Main application error type for taxon
#[derive(Debug, Error)]
pub enum TaxonError {
    /// Kubernetes-related errors
    #[error("kubernetes error: {0}")]
    K8s(#[from] K8sError),

    /// Configuration errors
    #[error("configuration error: {0}")]
    Conf(#[from] ConfError),

    /// Health check/API server errors
    #[error("health check error: {0}")]
    Health(#[from] HealthError),
}

/// Type alias for Result with TaxonError
pub type Result<T> = std::result::Result<T, TaxonError>;
