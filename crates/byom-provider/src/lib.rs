//! "Bring Your Own Machine" provider for the peer-pods runtime.
//!
//! Instead of creating VMs, this provider hands out the addresses of
//! pre-created, externally managed VMs from a cluster-wide shared pool
//! ([`vm_pool`]) and pushes boot-time configuration to the chosen VM over
//! SSH/SFTP ([`vm_control`]). Deleting a pod triggers the VM's reboot file
//! and returns its address to the pool.

pub mod cloudinit;
pub mod config;
pub mod error;
pub mod provider;

#[cfg(test)]
mod provider_test;

pub use cloudinit::{CloudConfigGenerator, Instance, InstanceTypeSpec};
pub use config::Config;
pub use error::ProviderError;
pub use provider::{ByomProvider, Provider};
