//! BYOM provider facade
//!
//! Wires the pool allocator and the VM control channel into the
//! runtime-facing create/delete surface. Construction runs state recovery
//! to completion before the provider is handed out, so no allocation is
//! served against an unreconciled pool.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use kube::Client;
use tracing::{info, warn};

use vm_control::{SshControlClient, SshControlConfig, VmControl};
use vm_pool::node_identity;
use vm_pool::{ConfigMapStore, PoolConfig, PoolManager, StateStore, VmCleanup};

use crate::cloudinit::{CloudConfigGenerator, Instance, InstanceTypeSpec};
use crate::config::Config;
use crate::error::ProviderError;

/// Cloud-provider surface consumed by the runtime.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn create_instance(
        &self,
        pod_name: &str,
        sandbox_id: &str,
        cloud_config: &dyn CloudConfigGenerator,
        spec: InstanceTypeSpec,
    ) -> Result<Instance, ProviderError>;

    async fn delete_instance(&self, instance_id: &str) -> Result<(), ProviderError>;

    fn config_verifier(&self) -> Result<(), ProviderError>;

    async fn teardown(&self) -> Result<(), ProviderError>;
}

pub struct ByomProvider {
    config: Config,
    pool: Arc<PoolManager>,
    control: Arc<dyn VmControl>,
}

impl std::fmt::Debug for ByomProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByomProvider")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Recovery-time cleanup: push the reboot trigger to a VM this node held
/// before its restart.
struct RebootCleanup(Arc<dyn VmControl>);

#[async_trait]
impl VmCleanup for RebootCleanup {
    async fn cleanup(&self, ip: IpAddr) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.0
            .send_reboot_file(ip)
            .await
            .map_err(|err| Box::new(err) as _)
    }
}

impl ByomProvider {
    /// Builds the provider for in-cluster use: loads SSH material,
    /// resolves node identity and namespace, and runs state recovery.
    pub async fn new(config: Config) -> Result<Self, ProviderError> {
        info!("BYOM config: {:?}", config.redacted());
        config.verify()?;

        let control: Arc<dyn VmControl> = Arc::new(SshControlClient::new(SshControlConfig {
            username: config.ssh_username.clone(),
            private_key: config.ssh_priv_key.clone(),
            private_key_path: config.ssh_priv_key_path.clone(),
            timeout: config.ssh_timeout,
            host_key_allowlist_dir: config.ssh_host_key_allowlist_dir.clone(),
        })?);

        let client = Client::try_default().await?;
        let namespace = config
            .pool_namespace
            .clone()
            .filter(|namespace| !namespace.is_empty())
            .unwrap_or_else(node_identity::current_namespace_or_default);
        info!(
            "Pool state object: {}/{} ({} configured IPs)",
            namespace,
            config.pool_config_map_name,
            config.vm_pool_ips.len()
        );
        let store = Arc::new(ConfigMapStore::new(
            client,
            namespace,
            config.pool_config_map_name.clone(),
            config.operation_timeout,
        ));

        let node_name = node_identity::current_node_name()?;
        Self::with_parts(config, store, control, node_name).await
    }

    /// Wires the provider from pre-built collaborators and runs recovery.
    /// Also the entry point for tests, which pass mock collaborators.
    pub async fn with_parts(
        config: Config,
        store: Arc<dyn StateStore>,
        control: Arc<dyn VmControl>,
        node_name: String,
    ) -> Result<Self, ProviderError> {
        config.verify()?;

        let pool_config = PoolConfig {
            pool_ips: config.vm_pool_ips.clone(),
            operation_timeout: config.operation_timeout,
            max_retries: config.max_retries,
            retry_backoff_base: config.retry_backoff_base,
            vm_reboot_settle: config.vm_reboot_settle,
        };
        let pool = Arc::new(PoolManager::new(store, pool_config, node_name)?);

        let cleanup = RebootCleanup(Arc::clone(&control));
        pool.recover_state(Some(&cleanup)).await?;

        let status = pool.get_pool_status().await?;
        info!(
            "Initialized BYOM provider with {} VMs ({} available, {} in use)",
            status.total, status.available, status.in_use
        );

        Ok(Self {
            config,
            pool,
            control,
        })
    }

    async fn rollback(&self, allocation_id: &str) {
        if let Err(err) = self.pool.deallocate_ip(allocation_id).await {
            warn!(
                "Failed to roll back IP allocation {}: {}",
                allocation_id, err
            );
        }
    }
}

#[async_trait]
impl Provider for ByomProvider {
    async fn create_instance(
        &self,
        pod_name: &str,
        sandbox_id: &str,
        cloud_config: &dyn CloudConfigGenerator,
        _spec: InstanceTypeSpec,
    ) -> Result<Instance, ProviderError> {
        let allocation_id = format!("{pod_name}-{sandbox_id}");

        // The runtime may hand the pod name namespace-qualified.
        let (pod_namespace, pod_name_only) = match pod_name.split_once('/') {
            Some((namespace, name)) => (namespace, name),
            None => ("default", pod_name),
        };

        let ip = self
            .pool
            .allocate_ip(&allocation_id, pod_name_only, pod_namespace)
            .await?;

        let user_data = match cloud_config.generate() {
            Ok(user_data) => user_data,
            Err(source) => {
                self.rollback(&allocation_id).await;
                return Err(ProviderError::CloudConfig { source });
            }
        };

        if let Err(err) = self.control.send_user_data(ip, user_data.as_bytes()).await {
            warn!("Failed to send user-data to VM {}: {}", ip, err);
            self.rollback(&allocation_id).await;
            return Err(err.into());
        }

        Ok(Instance {
            id: ip.to_string(),
            name: format!("byom-{ip}"),
            ips: vec![ip],
        })
    }

    async fn delete_instance(&self, instance_id: &str) -> Result<(), ProviderError> {
        if instance_id.is_empty() {
            info!("Instance ID is empty, nothing to delete");
            return Ok(());
        }
        let ip: IpAddr =
            instance_id
                .parse()
                .map_err(|source| ProviderError::InvalidInstanceId {
                    id: instance_id.to_string(),
                    source,
                })?;

        // Best effort: the VM may already be unreachable, and keeping it
        // allocated forever would leak the address.
        if let Err(err) = self.control.send_reboot_file(ip).await {
            warn!("Failed to send reboot trigger to VM {}: {}", ip, err);
        }

        self.pool.deallocate_by_ip(ip).await?;
        info!("Returned VM to pool: IP={}", ip);
        Ok(())
    }

    fn config_verifier(&self) -> Result<(), ProviderError> {
        self.config.verify()
    }

    async fn teardown(&self) -> Result<(), ProviderError> {
        // The shared state object outlives any single replica.
        info!("BYOM provider teardown completed");
        Ok(())
    }
}
