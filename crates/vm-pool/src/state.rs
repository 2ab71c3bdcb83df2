//! Pool allocation state
//!
//! The single shared document every replica reads and rewrites. All
//! transforms here are pure and side-effect free; the manager performs the
//! I/O and holds the concurrency machinery.
//!
//! Invariants after every successful store write:
//! - an IP is either allocated or available, never both
//! - `available_ips` holds no duplicates
//! - every IP present was a member of the configured pool at write time
//! - `version` strictly increases

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// A single IP binding: which pod on which node holds which address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpAllocation {
    /// Opaque caller-chosen ID; repeat allocations with the same ID are
    /// answered with the same address.
    pub allocation_id: String,
    pub ip: String,
    /// Node that performed the allocation; soft ownership used only for
    /// recovery-time cleanup.
    pub node_name: String,
    pub pod_name: String,
    pub pod_namespace: String,
    pub allocated_at: DateTime<Utc>,
}

/// The shared allocation document.
///
/// `allocated_ips` is a `BTreeMap` so the serialized form is deterministic,
/// which keeps the stored object diffable for operators and makes the
/// recovery-time deep comparison exact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpAllocationState {
    pub allocated_ips: BTreeMap<String, IpAllocation>,
    pub available_ips: Vec<String>,
    /// Advisory only; not used for concurrency decisions.
    pub last_updated: DateTime<Utc>,
    /// Advisory counter for humans reading the stored document. The
    /// store's own revision token is what guards concurrent writers.
    pub version: u64,
}

/// Counts reported by the read-only status query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub total: usize,
    pub available: usize,
    pub in_use: usize,
}

impl IpAllocationState {
    /// Fresh state: nothing allocated, the whole configured pool available
    /// in its configured order.
    pub fn initial(pool_ips: &[String], now: DateTime<Utc>) -> Self {
        Self {
            allocated_ips: BTreeMap::new(),
            available_ips: pool_ips.to_vec(),
            last_updated: now,
            version: 1,
        }
    }

    /// Moves `allocation.ip` from the available list into the allocated
    /// map. The caller has already selected the address from
    /// `available_ips`.
    pub fn allocate(&self, allocation: IpAllocation) -> Self {
        let mut next = self.clone();
        next.available_ips.retain(|ip| *ip != allocation.ip);
        next.last_updated = allocation.allocated_at;
        next.allocated_ips
            .insert(allocation.allocation_id.clone(), allocation);
        next.version = self.version + 1;
        next
    }

    /// Returns the allocation's IP to the available list. Unknown IDs
    /// yield an unchanged copy; the manager never writes those back.
    pub fn deallocate(&self, allocation_id: &str, now: DateTime<Utc>) -> Self {
        let mut next = self.clone();
        if let Some(allocation) = next.allocated_ips.remove(allocation_id) {
            next.available_ips.push(allocation.ip);
            next.last_updated = now;
            next.version = self.version + 1;
        }
        next
    }

    /// Repairs the state against the configured pool: allocations in
    /// `release_ids` are dropped (their VMs have been confirmed clean),
    /// allocated rows whose IP is no longer configured are dropped, and
    /// `available_ips` is rebuilt as the sorted complement of what remains
    /// allocated.
    ///
    /// Returns `None` when the state already matches, comparing the
    /// allocated maps and the sorted available lists, so recovery can skip
    /// the store write entirely.
    pub fn reconcile(
        &self,
        configured_pool: &[String],
        release_ids: &BTreeSet<String>,
        now: DateTime<Utc>,
    ) -> Option<Self> {
        let mut remaining: BTreeSet<String> = BTreeSet::new();
        for ip in configured_pool {
            if ip.parse::<IpAddr>().is_ok() {
                remaining.insert(ip.clone());
            } else {
                warn!("Invalid IP address in configuration, skipping: {}", ip);
            }
        }

        let mut allocated = BTreeMap::new();
        for (id, allocation) in &self.allocated_ips {
            if release_ids.contains(id) {
                continue;
            }
            if remaining.remove(&allocation.ip) {
                allocated.insert(id.clone(), allocation.clone());
            } else {
                warn!(
                    "Allocated IP {} is not in the configured pool; removing allocation {}",
                    allocation.ip, id
                );
            }
        }

        let available: Vec<String> = remaining.into_iter().collect();

        let mut sorted_current = self.available_ips.clone();
        sorted_current.sort();
        if allocated == self.allocated_ips && available == sorted_current {
            return None;
        }

        Some(Self {
            allocated_ips: allocated,
            available_ips: available,
            last_updated: now,
            version: self.version + 1,
        })
    }

    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            total: self.allocated_ips.len() + self.available_ips.len(),
            available: self.available_ips.len(),
            in_use: self.allocated_ips.len(),
        }
    }
}
