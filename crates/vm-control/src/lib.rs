//! SSH/SFTP control channel for pre-created pod VMs.
//!
//! The provider talks to a pool VM exactly twice in its life: it pushes
//! cloud-init user-data when the VM is handed to a pod, and it pushes a
//! one-byte reboot trigger when the pod goes away so the VM wipes itself
//! before the address is reused. Both are tiny SFTP uploads over a
//! per-call SSH session.

pub mod client;
pub mod error;
pub mod host_key;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use client::{SshControlClient, SshControlConfig, VmControl, REBOOT_PATH, USER_DATA_PATH};
pub use error::ControlError;
pub use host_key::HostKeyPolicy;
#[cfg(any(test, feature = "test-util"))]
pub use mock::MockVmControl;
