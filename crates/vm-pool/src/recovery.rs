//! Startup state recovery
//!
//! Runs exactly once while the provider is constructed, before the first
//! allocation is served, holding the operation lock for its whole
//! duration. Recovery reconciles three views of the world: the stored
//! state, the configured pool, and the allocations this node held before
//! it restarted.
//!
//! Allocations held by the local node point at VMs in unknown states. Each
//! one gets a reboot trigger pushed through the cleanup hook; only IPs
//! whose push succeeded are released after the settle delay, the rest stay
//! allocated so a dirty VM can never re-enter the pool.

use std::collections::BTreeSet;
use std::net::IpAddr;

use chrono::Utc;
use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::backoff::RetryBackoff;
use crate::error::{PoolError, StoreError};
use crate::manager::PoolManager;
use crate::state::{IpAllocation, IpAllocationState};

/// Reboot-and-settle hook invoked for each VM this node held before a
/// restart. The provider implements it over the VM control channel.
#[async_trait::async_trait]
pub trait VmCleanup: Send + Sync {
    async fn cleanup(&self, ip: IpAddr) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

impl PoolManager {
    /// Reconciles the shared state with the configured pool and the local
    /// node. Must complete before `allocate_ip` is first called.
    pub async fn recover_state(&self, vm_cleanup: Option<&dyn VmCleanup>) -> Result<(), PoolError> {
        let _guard = self.op_lock.lock().await;
        info!(
            "Starting state recovery for VM pool on node {}",
            self.node_name
        );

        let state = match self.store.get().await? {
            Some((state, _)) => state,
            None => match self.initialize_empty_state().await? {
                Initialized::Created => return Ok(()),
                Initialized::Raced(state) => state,
            },
        };
        info!(
            "State recovered from store: {} allocated, {} available",
            state.allocated_ips.len(),
            state.available_ips.len()
        );

        let local: Vec<IpAllocation> = state
            .allocated_ips
            .values()
            .filter(|allocation| allocation.node_name == self.node_name)
            .cloned()
            .collect();
        for allocation in &local {
            info!(
                "Found allocation {} (IP {}, pod {}/{}) held by this node",
                allocation.allocation_id,
                allocation.ip,
                allocation.pod_namespace,
                allocation.pod_name
            );
        }

        let released = self.cleanup_node_vms(&local, vm_cleanup).await;
        self.repair_state(&released).await
    }

    async fn initialize_empty_state(&self) -> Result<Initialized, PoolError> {
        let fresh = IpAllocationState::initial(&self.config.pool_ips, Utc::now());
        match self.store.create(&fresh).await {
            Ok(_) => {
                info!(
                    "Initialized empty allocation state with {} available IPs",
                    fresh.available_ips.len()
                );
                Ok(Initialized::Created)
            }
            Err(StoreError::AlreadyExists) => {
                debug!("Another replica initialized the allocation state first");
                let Some((state, _)) = self.store.get().await? else {
                    return Err(StoreError::unavailable(
                        "state object disappeared during initialization",
                    )
                    .into());
                };
                Ok(Initialized::Raced(state))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Pushes reboot triggers to this node's VMs, concurrently, then waits
    /// out the settle delay. Returns the allocation IDs safe to release.
    async fn cleanup_node_vms(
        &self,
        local: &[IpAllocation],
        vm_cleanup: Option<&dyn VmCleanup>,
    ) -> BTreeSet<String> {
        if local.is_empty() {
            debug!("No allocations held by node {}", self.node_name);
            return BTreeSet::new();
        }

        let Some(cleanup) = vm_cleanup else {
            // No control channel: release everything this node held.
            return local
                .iter()
                .map(|allocation| allocation.allocation_id.clone())
                .collect();
        };

        info!(
            "Sending reboot triggers to {} VMs before releasing their IPs",
            local.len()
        );
        let released = join_all(local.iter().map(|allocation| async move {
            let ip: IpAddr = match allocation.ip.parse() {
                Ok(ip) => ip,
                Err(err) => {
                    warn!(
                        "Skipping cleanup of unparsable allocated IP {}: {}",
                        allocation.ip, err
                    );
                    return None;
                }
            };
            match cleanup.cleanup(ip).await {
                Ok(()) => {
                    info!("Sent reboot trigger to VM {}", ip);
                    Some(allocation.allocation_id.clone())
                }
                Err(err) => {
                    warn!(
                        "NOT releasing IP {}: reboot trigger failed: {}",
                        allocation.ip, err
                    );
                    None
                }
            }
        }))
        .await
        .into_iter()
        .flatten()
        .collect::<BTreeSet<String>>();

        let settle = self.config.vm_reboot_settle;
        if !released.is_empty() && !settle.is_zero() {
            info!("Waiting {:?} for VMs to process reboot triggers", settle);
            tokio::time::sleep(settle).await;
        }

        released
    }

    /// One CAS-retried repair write covering both the release of cleaned
    /// local allocations and the pool-membership reconcile. The cleanup
    /// side effects above are never re-run on a conflict, only the pure
    /// repair is recomputed over a fresh read.
    async fn repair_state(&self, release_ids: &BTreeSet<String>) -> Result<(), PoolError> {
        let mut backoff = RetryBackoff::new(self.config.retry_backoff_base, self.config.max_retries);

        loop {
            match self.try_repair(release_ids).await {
                Ok(()) => return Ok(()),
                Err(PoolError::Store(err @ (StoreError::Conflict | StoreError::AlreadyExists))) => {
                    let Some(delay) = backoff.next_delay() else {
                        return Err(PoolError::RecoveryRetryExhausted(err));
                    };
                    debug!("State repair lost the optimistic-lock race, retrying in {:?}", delay);
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn try_repair(&self, release_ids: &BTreeSet<String>) -> Result<(), PoolError> {
        let Some((state, revision)) = self.store.get().await? else {
            // The object vanished between recovery steps; re-create it.
            let fresh = IpAllocationState::initial(&self.config.pool_ips, Utc::now());
            self.store.create(&fresh).await?;
            return Ok(());
        };

        match state.reconcile(&self.config.pool_ips, release_ids, Utc::now()) {
            None => {
                info!("State validation completed, no repairs needed");
                Ok(())
            }
            Some(repaired) => {
                info!(
                    "State repairs made: allocated {} -> {}, available {} -> {}",
                    state.allocated_ips.len(),
                    repaired.allocated_ips.len(),
                    state.available_ips.len(),
                    repaired.available_ips.len()
                );
                self.store.update(&repaired, &revision).await?;
                Ok(())
            }
        }
    }
}

enum Initialized {
    /// This replica wrote the fresh state; nothing to repair.
    Created,
    /// Another replica won the creation race; its state proceeds through
    /// the normal repair path.
    Raced(IpAllocationState),
}
