use thiserror::Error;

/// Errors that can occur during Kubernetes operations
#[derive(Debug, Error)]
pub enum K8sError {
    /// Failed to create or initialize the Kubernetes client
    #[error("failed to initialize Kubernetes client: {0}")]
    ClientInitialization(#[source] Box<kube::Error>),

    /// A watch stream did not complete its initial list within the deadline
    #[error("timed out waiting for {resource} cache to sync")]
    CacheSyncTimeout { resource: String },
}

impl K8sError {
    /// Create a client initialization error
    pub fn client_init(source: kube::Error) -> Self {
        Self::ClientInitialization(Box::new(source))
    }

    /// Create a cache sync timeout error
    pub fn cache_sync_timeout(resource: impl Into<String>) -> Self {
        Self::CacheSyncTimeout {
            resource: resource.into(),
        }
    }
}
