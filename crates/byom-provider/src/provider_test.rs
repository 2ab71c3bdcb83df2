//! Unit tests for the provider facade

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use vm_control::MockVmControl;
use vm_pool::MockStateStore;

use crate::cloudinit::{CloudConfigGenerator, InstanceTypeSpec};
use crate::config::Config;
use crate::error::ProviderError;
use crate::provider::{ByomProvider, Provider};

/// Fixed-output generator; flips to failure mode for the rollback tests.
struct StaticCloudConfig {
    fail: bool,
}

impl StaticCloudConfig {
    fn ok() -> Self {
        Self { fail: false }
    }

    fn failing() -> Self {
        Self { fail: true }
    }
}

impl CloudConfigGenerator for StaticCloudConfig {
    fn generate(&self) -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
        if self.fail {
            return Err("template rendering failed".into());
        }
        Ok("#cloud-config\nhostname: podvm\n".to_string())
    }
}

fn test_config(ips: &[&str]) -> Config {
    Config {
        vm_pool_ips: ips.iter().map(|ip| ip.to_string()).collect(),
        ssh_username: "peerpod".to_string(),
        ssh_priv_key: Some("test-key-material".to_string()),
        max_retries: 3,
        retry_backoff_base: Duration::from_millis(1),
        vm_reboot_settle: Duration::ZERO,
        ..Config::default()
    }
}

async fn test_provider(
    store: &MockStateStore,
    control: &MockVmControl,
    ips: &[&str],
) -> ByomProvider {
    ByomProvider::with_parts(
        test_config(ips),
        Arc::new(store.clone()),
        Arc::new(control.clone()),
        "test-node".to_string(),
    )
    .await
    .expect("provider builds")
}

fn status_counts(store: &MockStateStore) -> (usize, usize) {
    let state = store.state().expect("state exists");
    (state.available_ips.len(), state.allocated_ips.len())
}

#[tokio::test]
async fn create_instance_allocates_and_pushes_user_data() {
    let store = MockStateStore::new();
    let control = MockVmControl::new();
    let provider = test_provider(&store, &control, &["10.0.0.1", "10.0.0.2", "10.0.0.3"]).await;

    let instance = provider
        .create_instance("podA", "s1", &StaticCloudConfig::ok(), InstanceTypeSpec::default())
        .await
        .unwrap();

    let ip: IpAddr = instance.id.parse().unwrap();
    assert_eq!(instance.name, format!("byom-{ip}"));
    assert_eq!(instance.ips, vec![ip]);

    let sent = control.user_data_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, ip);
    assert!(sent[0].1.starts_with(b"#cloud-config"));

    assert_eq!(status_counts(&store), (2, 1));
}

#[tokio::test]
async fn create_instance_is_idempotent_per_sandbox() {
    let store = MockStateStore::new();
    let control = MockVmControl::new();
    let provider = test_provider(&store, &control, &["10.0.0.1", "10.0.0.2"]).await;

    let first = provider
        .create_instance("podA", "s1", &StaticCloudConfig::ok(), InstanceTypeSpec::default())
        .await
        .unwrap();
    let second = provider
        .create_instance("podA", "s1", &StaticCloudConfig::ok(), InstanceTypeSpec::default())
        .await
        .unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(status_counts(&store), (1, 1));
}

#[tokio::test]
async fn create_instance_splits_a_namespace_qualified_pod_name() {
    let store = MockStateStore::new();
    let control = MockVmControl::new();
    let provider = test_provider(&store, &control, &["10.0.0.1"]).await;

    provider
        .create_instance("ns1/podA", "s1", &StaticCloudConfig::ok(), InstanceTypeSpec::default())
        .await
        .unwrap();

    let state = store.state().unwrap();
    // the allocation ID keeps the full runtime-supplied name
    let allocation = &state.allocated_ips["ns1/podA-s1"];
    assert_eq!(allocation.pod_name, "podA");
    assert_eq!(allocation.pod_namespace, "ns1");
}

#[tokio::test]
async fn create_instance_defaults_the_namespace() {
    let store = MockStateStore::new();
    let control = MockVmControl::new();
    let provider = test_provider(&store, &control, &["10.0.0.1"]).await;

    provider
        .create_instance("podA", "s1", &StaticCloudConfig::ok(), InstanceTypeSpec::default())
        .await
        .unwrap();

    let state = store.state().unwrap();
    assert_eq!(state.allocated_ips["podA-s1"].pod_namespace, "default");
}

#[tokio::test]
async fn create_rolls_back_when_the_transfer_fails() {
    let store = MockStateStore::new();
    let control = MockVmControl::new();
    control.fail_user_data();
    let provider = test_provider(&store, &control, &["10.0.0.1", "10.0.0.2", "10.0.0.3"]).await;

    let err = provider
        .create_instance("podA", "s1", &StaticCloudConfig::ok(), InstanceTypeSpec::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ProviderError::Control(_)));

    // the pool looks exactly as it did before the call
    assert_eq!(status_counts(&store), (3, 0));
}

#[tokio::test]
async fn create_rolls_back_when_generation_fails() {
    let store = MockStateStore::new();
    let control = MockVmControl::new();
    let provider = test_provider(&store, &control, &["10.0.0.1"]).await;

    let err = provider
        .create_instance(
            "podA",
            "s1",
            &StaticCloudConfig::failing(),
            InstanceTypeSpec::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ProviderError::CloudConfig { .. }));

    assert_eq!(status_counts(&store), (1, 0));
    assert!(control.user_data_sent().is_empty());
}

#[tokio::test]
async fn pool_exhaustion_has_no_side_effects() {
    let store = MockStateStore::new();
    let control = MockVmControl::new();
    let provider = test_provider(&store, &control, &["10.0.0.1"]).await;

    provider
        .create_instance("podA", "s1", &StaticCloudConfig::ok(), InstanceTypeSpec::default())
        .await
        .unwrap();
    let err = provider
        .create_instance("podB", "s1", &StaticCloudConfig::ok(), InstanceTypeSpec::default())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ProviderError::Pool(vm_pool::PoolError::PoolExhausted)
    ));
    assert_eq!(control.user_data_sent().len(), 1);
}

#[tokio::test]
async fn delete_instance_reboots_and_releases() {
    let store = MockStateStore::new();
    let control = MockVmControl::new();
    let provider = test_provider(&store, &control, &["10.0.0.1", "10.0.0.2"]).await;

    let instance = provider
        .create_instance("podA", "s1", &StaticCloudConfig::ok(), InstanceTypeSpec::default())
        .await
        .unwrap();
    provider.delete_instance(&instance.id).await.unwrap();

    let ip: IpAddr = instance.id.parse().unwrap();
    assert_eq!(control.reboots_sent(), vec![ip]);
    assert_eq!(status_counts(&store), (2, 0));
}

#[tokio::test]
async fn delete_instance_is_best_effort_about_the_vm() {
    let store = MockStateStore::new();
    let control = MockVmControl::new();
    let provider = test_provider(&store, &control, &["10.0.0.1"]).await;

    let instance = provider
        .create_instance("podA", "s1", &StaticCloudConfig::ok(), InstanceTypeSpec::default())
        .await
        .unwrap();

    control.fail_reboots();
    // the reboot push fails, the deallocation still goes through
    provider.delete_instance(&instance.id).await.unwrap();
    assert_eq!(status_counts(&store), (1, 0));
}

#[tokio::test]
async fn delete_with_an_empty_id_is_a_noop() {
    let store = MockStateStore::new();
    let control = MockVmControl::new();
    let provider = test_provider(&store, &control, &["10.0.0.1"]).await;

    provider.delete_instance("").await.unwrap();
    assert!(control.reboots_sent().is_empty());
}

#[tokio::test]
async fn delete_with_a_malformed_id_is_an_error() {
    let store = MockStateStore::new();
    let control = MockVmControl::new();
    let provider = test_provider(&store, &control, &["10.0.0.1"]).await;

    let err = provider.delete_instance("not-an-ip").await.unwrap_err();
    assert!(matches!(err, ProviderError::InvalidInstanceId { .. }));
}

#[tokio::test]
async fn delete_of_an_unallocated_ip_is_a_noop() {
    let store = MockStateStore::new();
    let control = MockVmControl::new();
    let provider = test_provider(&store, &control, &["10.0.0.1"]).await;

    provider.delete_instance("10.0.0.1").await.unwrap();
    assert_eq!(status_counts(&store), (1, 0));
}

#[tokio::test]
async fn teardown_is_idempotent() {
    let store = MockStateStore::new();
    let control = MockVmControl::new();
    let provider = test_provider(&store, &control, &["10.0.0.1"]).await;

    provider.teardown().await.unwrap();
    provider.teardown().await.unwrap();
    // the shared state object is untouched
    assert_eq!(status_counts(&store), (1, 0));
}

#[tokio::test]
async fn config_verifier_reflects_the_running_config() {
    let store = MockStateStore::new();
    let control = MockVmControl::new();
    let provider = test_provider(&store, &control, &["10.0.0.1"]).await;
    assert!(provider.config_verifier().is_ok());
}

#[tokio::test]
async fn construction_rejects_an_unverifiable_config() {
    let store = MockStateStore::new();
    let control = MockVmControl::new();
    let config = Config {
        ssh_username: String::new(),
        ..test_config(&["10.0.0.1"])
    };

    let err = ByomProvider::with_parts(
        config,
        Arc::new(store),
        Arc::new(control),
        "test-node".to_string(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, ProviderError::InvalidConfig(_)));
}

#[tokio::test]
async fn construction_recovers_local_allocations_with_a_reboot() {
    use chrono::Utc;
    use std::collections::BTreeMap;
    use vm_pool::{IpAllocation, IpAllocationState};

    let store = MockStateStore::new();
    store.set_state(&IpAllocationState {
        allocated_ips: BTreeMap::from([(
            "old-pod-s9".to_string(),
            IpAllocation {
                allocation_id: "old-pod-s9".to_string(),
                ip: "10.0.0.2".to_string(),
                node_name: "test-node".to_string(),
                pod_name: "old-pod".to_string(),
                pod_namespace: "ns1".to_string(),
                allocated_at: Utc::now(),
            },
        )]),
        available_ips: vec!["10.0.0.1".to_string()],
        last_updated: Utc::now(),
        version: 3,
    });

    let control = MockVmControl::new();
    let provider = test_provider(&store, &control, &["10.0.0.1", "10.0.0.2"]).await;

    // the stale VM got its reboot trigger and its address came back
    assert_eq!(
        control.reboots_sent(),
        vec!["10.0.0.2".parse::<IpAddr>().unwrap()]
    );
    assert_eq!(status_counts(&store), (2, 0));
}
