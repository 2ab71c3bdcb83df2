//! Global VM pool manager
//!
//! Idempotent, optimistically locked IP allocation over the shared state
//! store. Within a replica a mutex serializes each operation body; across
//! replicas the store's compare-and-swap is the only thing that prevents
//! double allocation. Both are required: the mutex keeps one replica's
//! requests from trampling each other between read and write, the revision
//! token arbitrates between replicas.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::backoff::RetryBackoff;
use crate::error::{PoolError, StoreError};
use crate::select::select_ip_index;
use crate::state::{IpAllocation, IpAllocationState, PoolStatus};
use crate::store::{Revision, StateStore};

/// Tuning and membership of the shared pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Pre-created VM addresses forming the pool; order is preserved in a
    /// freshly initialized state object.
    pub pool_ips: Vec<String>,
    /// Deadline applied to every store round-trip.
    pub operation_timeout: Duration,
    /// Conflict retries per operation.
    pub max_retries: u32,
    /// First retry delay; grows 1.5x per conflict, jittered.
    pub retry_backoff_base: Duration,
    /// How long recovery lets rebooting VMs settle before their IPs are
    /// reused.
    pub vm_reboot_settle: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_ips: Vec::new(),
            operation_timeout: Duration::from_secs(30),
            max_retries: 5,
            retry_backoff_base: Duration::from_millis(500),
            vm_reboot_settle: Duration::from_secs(15),
        }
    }
}

pub struct PoolManager {
    pub(crate) store: Arc<dyn StateStore>,
    pub(crate) config: PoolConfig,
    pub(crate) node_name: String,
    /// Serializes operation bodies within this replica. Not a substitute
    /// for the store's compare-and-swap.
    pub(crate) op_lock: Mutex<()>,
}

impl std::fmt::Debug for PoolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolManager")
            .field("config", &self.config)
            .field("node_name", &self.node_name)
            .finish_non_exhaustive()
    }
}

impl PoolManager {
    /// Validates the configured pool and builds the manager. The pool must
    /// be non-empty and every address syntactically valid and unique.
    pub fn new(
        store: Arc<dyn StateStore>,
        config: PoolConfig,
        node_name: String,
    ) -> Result<Self, PoolError> {
        if config.pool_ips.is_empty() {
            return Err(PoolError::InvalidConfig(
                "at least one pool IP is required".to_string(),
            ));
        }
        let mut seen = std::collections::BTreeSet::new();
        for ip in &config.pool_ips {
            ip.parse::<IpAddr>()
                .map_err(|source| PoolError::InvalidIpAddress {
                    ip: ip.clone(),
                    source,
                })?;
            if !seen.insert(ip) {
                return Err(PoolError::InvalidConfig(format!(
                    "duplicate pool IP {ip}"
                )));
            }
        }

        Ok(Self {
            store,
            config,
            node_name,
            op_lock: Mutex::new(()),
        })
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// Allocates an IP for `allocation_id`, retrying lost optimistic-lock
    /// races. Calling again with the same ID returns the same address
    /// without touching the store.
    pub async fn allocate_ip(
        &self,
        allocation_id: &str,
        pod_name: &str,
        pod_namespace: &str,
    ) -> Result<IpAddr, PoolError> {
        let _guard = self.op_lock.lock().await;
        let mut backoff = RetryBackoff::new(self.config.retry_backoff_base, self.config.max_retries);

        loop {
            match self.try_allocate(allocation_id, pod_name, pod_namespace).await {
                Ok(ip) => {
                    info!("Allocated IP {} to allocation {}", ip, allocation_id);
                    return Ok(ip);
                }
                Err(PoolError::Store(err @ (StoreError::Conflict | StoreError::AlreadyExists))) => {
                    let Some(delay) = backoff.next_delay() else {
                        return Err(PoolError::AllocationRetryExhausted(err));
                    };
                    debug!(
                        "Allocation {} lost the optimistic-lock race, retrying in {:?}",
                        allocation_id, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn try_allocate(
        &self,
        allocation_id: &str,
        pod_name: &str,
        pod_namespace: &str,
    ) -> Result<IpAddr, PoolError> {
        let now = Utc::now();
        let (state, revision) = self.read_or_initial().await?;

        // Idempotent repeat: hand back the existing binding.
        if let Some(existing) = state.allocated_ips.get(allocation_id) {
            debug!(
                "IP {} already allocated to allocation {}",
                existing.ip, allocation_id
            );
            return parse_ip(&existing.ip);
        }

        if state.available_ips.is_empty() {
            return Err(PoolError::PoolExhausted);
        }

        let index = select_ip_index(&state.available_ips, allocation_id);
        let ip = state.available_ips[index].clone();
        debug!(
            "Selected IP {} (index {} of {}) for allocation {}",
            ip,
            index,
            state.available_ips.len(),
            allocation_id
        );

        let next = state.allocate(IpAllocation {
            allocation_id: allocation_id.to_string(),
            ip: ip.clone(),
            node_name: self.node_name.clone(),
            pod_name: pod_name.to_string(),
            pod_namespace: pod_namespace.to_string(),
            allocated_at: now,
        });
        self.write(&next, revision).await?;

        parse_ip(&ip)
    }

    /// Returns the IP held by `allocation_id` to the pool. Unknown IDs are
    /// a successful no-op.
    pub async fn deallocate_ip(&self, allocation_id: &str) -> Result<(), PoolError> {
        let _guard = self.op_lock.lock().await;
        self.deallocate_with_retry(|state| {
            state
                .allocated_ips
                .contains_key(allocation_id)
                .then(|| allocation_id.to_string())
        })
        .await
    }

    /// Returns an IP to the pool by address. Unknown addresses are a
    /// successful no-op.
    pub async fn deallocate_by_ip(&self, ip: IpAddr) -> Result<(), PoolError> {
        let _guard = self.op_lock.lock().await;
        let target = ip.to_string();
        self.deallocate_with_retry(move |state| {
            state
                .allocated_ips
                .values()
                .find(|allocation| allocation.ip == target)
                .map(|allocation| allocation.allocation_id.clone())
        })
        .await
    }

    /// Shared CAS-retry body for both deallocation flavors; `find` names
    /// the allocation to drop in the freshly read state, or `None` for the
    /// idempotent no-op.
    async fn deallocate_with_retry(
        &self,
        find: impl Fn(&IpAllocationState) -> Option<String>,
    ) -> Result<(), PoolError> {
        let mut backoff = RetryBackoff::new(self.config.retry_backoff_base, self.config.max_retries);

        loop {
            match self.try_deallocate(&find).await {
                Ok(Some(ip)) => {
                    info!("Deallocated IP {}", ip);
                    return Ok(());
                }
                Ok(None) => {
                    debug!("No matching allocation, nothing to deallocate");
                    return Ok(());
                }
                Err(PoolError::Store(err @ (StoreError::Conflict | StoreError::AlreadyExists))) => {
                    let Some(delay) = backoff.next_delay() else {
                        return Err(PoolError::DeallocationRetryExhausted(err));
                    };
                    debug!(
                        "Deallocation lost the optimistic-lock race, retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn try_deallocate(
        &self,
        find: &impl Fn(&IpAllocationState) -> Option<String>,
    ) -> Result<Option<String>, PoolError> {
        // Absent store means nothing was ever allocated.
        let Some((state, revision)) = self.store.get().await? else {
            return Ok(None);
        };
        let Some(allocation_id) = find(&state) else {
            return Ok(None);
        };

        let ip = state.allocated_ips[&allocation_id].ip.clone();
        let next = state.deallocate(&allocation_id, Utc::now());
        self.store.update(&next, &revision).await?;
        Ok(Some(ip))
    }

    /// IP currently bound to `allocation_id`, if any.
    pub async fn get_allocated_ip(&self, allocation_id: &str) -> Result<Option<IpAddr>, PoolError> {
        let state = self.snapshot().await?;
        state
            .allocated_ips
            .get(allocation_id)
            .map(|allocation| parse_ip(&allocation.ip))
            .transpose()
    }

    /// Snapshot of all current allocations.
    pub async fn list_allocated_ips(&self) -> Result<BTreeMap<String, IpAllocation>, PoolError> {
        Ok(self.snapshot().await?.allocated_ips)
    }

    /// Pool counters: total, available, in use.
    pub async fn get_pool_status(&self) -> Result<PoolStatus, PoolError> {
        Ok(self.snapshot().await?.status())
    }

    /// Read-only view; an absent store reads as the initial state. Never
    /// retried because nothing is written.
    async fn snapshot(&self) -> Result<IpAllocationState, PoolError> {
        Ok(match self.store.get().await? {
            Some((state, _)) => state,
            None => IpAllocationState::initial(&self.config.pool_ips, Utc::now()),
        })
    }

    pub(crate) async fn read_or_initial(
        &self,
    ) -> Result<(IpAllocationState, Option<Revision>), PoolError> {
        Ok(match self.store.get().await? {
            Some((state, revision)) => (state, Some(revision)),
            None => (
                IpAllocationState::initial(&self.config.pool_ips, Utc::now()),
                None,
            ),
        })
    }

    /// A write against a freshly initialized view goes through `create`,
    /// which gives the same first-writer-wins guarantee as the revision
    /// check does for updates.
    pub(crate) async fn write(
        &self,
        state: &IpAllocationState,
        revision: Option<Revision>,
    ) -> Result<Revision, PoolError> {
        let written = match revision {
            Some(revision) => self.store.update(state, &revision).await?,
            None => self.store.create(state).await?,
        };
        Ok(written)
    }
}

pub(crate) fn parse_ip(ip: &str) -> Result<IpAddr, PoolError> {
    ip.parse().map_err(|source| PoolError::InvalidIpAddress {
        ip: ip.to_string(),
        source,
    })
}
