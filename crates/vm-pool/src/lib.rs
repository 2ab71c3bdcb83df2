//! Distributed VM IP-pool allocation over a shared Kubernetes ConfigMap.
//!
//! Multiple provider replicas across worker nodes share one logical pool of
//! pre-created VM addresses. No replica owns the pool: every mutation is an
//! optimistically locked read-modify-write of a single versioned state
//! object, and a deterministic hash-based selection policy keeps concurrent
//! allocators from contending for the same address.
//!
//! The crate is split along the allocation pipeline:
//! - [`state`] - the pure allocation-state document and its transforms
//! - [`store`] - versioned access to the shared state object (ConfigMap)
//! - [`select`] - hash-based selection over the available list
//! - [`manager`] - the idempotent, retrying allocator
//! - [`recovery`] - startup reconciliation of store, pool and local node
//! - [`node_identity`] - local node-name and namespace detection

pub mod error;
pub mod manager;
pub mod node_identity;
pub mod recovery;
pub mod select;
pub mod state;
pub mod store;

mod backoff;


pub use error::{PoolError, StoreError};
pub use manager::{PoolConfig, PoolManager};
pub use recovery::VmCleanup;
pub use select::select_ip_index;
pub use state::{IpAllocation, IpAllocationState, PoolStatus};
pub use store::{ConfigMapStore, Revision, StateStore};
#[cfg(any(test, feature = "test-util"))]
pub use store::MockStateStore;
