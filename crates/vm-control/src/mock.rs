//! Mock control channel for unit testing
//!
//! Records every pushed file and can be configured to fail either
//! operation, so provider tests can exercise the rollback and
//! best-effort paths without a VM.

use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::client::VmControl;
use crate::error::ControlError;

#[derive(Clone, Default)]
pub struct MockVmControl {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    user_data: Vec<(IpAddr, Vec<u8>)>,
    reboots: Vec<IpAddr>,
    fail_user_data: bool,
    fail_reboots: bool,
}

impl MockVmControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every `send_user_data` fail with `Unreachable` (test setup).
    pub fn fail_user_data(&self) {
        self.inner.lock().unwrap().fail_user_data = true;
    }

    /// Makes every `send_reboot_file` fail with `Unreachable` (test setup).
    pub fn fail_reboots(&self) {
        self.inner.lock().unwrap().fail_reboots = true;
    }

    pub fn user_data_sent(&self) -> Vec<(IpAddr, Vec<u8>)> {
        self.inner.lock().unwrap().user_data.clone()
    }

    pub fn reboots_sent(&self) -> Vec<IpAddr> {
        self.inner.lock().unwrap().reboots.clone()
    }
}

#[async_trait]
impl VmControl for MockVmControl {
    async fn send_user_data(&self, ip: IpAddr, user_data: &[u8]) -> Result<(), ControlError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_user_data {
            return Err(ControlError::Unreachable {
                source: "mock transport failure".into(),
            });
        }
        inner.user_data.push((ip, user_data.to_vec()));
        Ok(())
    }

    async fn send_reboot_file(&self, ip: IpAddr) -> Result<(), ControlError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_reboots {
            return Err(ControlError::Unreachable {
                source: "mock transport failure".into(),
            });
        }
        inner.reboots.push(ip);
        Ok(())
    }
}
