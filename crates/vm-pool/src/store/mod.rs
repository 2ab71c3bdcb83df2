//! Shared state store
//!
//! Versioned access to the single allocation-state object. The trait is
//! the seam the allocator is tested through; the ConfigMap implementation
//! is what runs in a cluster.

mod config_map;
#[cfg(any(test, feature = "test-util"))]
mod mock;

pub use config_map::ConfigMapStore;
#[cfg(any(test, feature = "test-util"))]
pub use mock::MockStateStore;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::state::IpAllocationState;

/// Opaque revision token issued by the store. It advances on every write
/// and is the sole cross-replica concurrency primitive; the `version`
/// counter inside the payload is advisory for humans only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Revision(String);

impl Revision {
    pub(crate) fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Revision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Compare-and-swap access to the shared allocation state.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Reads the state object. `Ok(None)` when it has not been created
    /// yet.
    async fn get(&self) -> Result<Option<(IpAllocationState, Revision)>, StoreError>;

    /// First write of the state object. Fails with
    /// [`StoreError::AlreadyExists`] when another replica created it
    /// concurrently.
    async fn create(&self, state: &IpAllocationState) -> Result<Revision, StoreError>;

    /// Conditional write: succeeds only while the stored revision still
    /// equals `expected`, otherwise fails with [`StoreError::Conflict`].
    async fn update(
        &self,
        state: &IpAllocationState,
        expected: &Revision,
    ) -> Result<Revision, StoreError>;
}

/// The state is stored as indented JSON so operators can read the object
/// with plain kubectl.
pub(crate) fn encode_state(state: &IpAllocationState) -> Result<String, StoreError> {
    serde_json::to_string_pretty(state).map_err(StoreError::corrupt)
}

pub(crate) fn decode_state(text: &str) -> Result<IpAllocationState, StoreError> {
    serde_json::from_str(text).map_err(StoreError::corrupt)
}
