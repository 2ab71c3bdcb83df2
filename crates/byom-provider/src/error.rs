//! Provider errors

use thiserror::Error;

use vm_control::ControlError;
use vm_pool::PoolError;

/// Errors surfaced by the BYOM provider.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// IP pool failure (exhaustion, retry exhaustion, store trouble).
    #[error("IP pool error: {0}")]
    Pool(#[from] PoolError),

    /// VM control channel failure.
    #[error("VM control error: {0}")]
    Control(#[from] ControlError),

    /// Operator-facing configuration problem. Startup-fatal.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The runtime-supplied generator could not produce user-data.
    #[error("cloud-config generation failed: {source}")]
    CloudConfig {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The instance ID handed back by the runtime is not an address.
    #[error("invalid instance ID {id:?}: {source}")]
    InvalidInstanceId {
        id: String,
        #[source]
        source: std::net::AddrParseError,
    },

    /// Kubernetes client construction failure.
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),
}
