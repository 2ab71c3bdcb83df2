//! ConfigMap-backed state store
//!
//! The allocation document lives in one data key of a single ConfigMap.
//! Its `metadata.resourceVersion` is the opaque revision token: `replace`
//! with the token set makes the API server reject stale writers with a
//! 409, which is the compare-and-swap the allocator builds on.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, PostParams};
use kube::Client;
use tracing::debug;

use super::{decode_state, encode_state, Revision, StateStore};
use crate::error::StoreError;
use crate::state::IpAllocationState;

/// ConfigMap data key holding the serialized allocation state.
const STATE_DATA_KEY: &str = "allocation-state";

pub struct ConfigMapStore {
    api: Api<ConfigMap>,
    namespace: String,
    name: String,
    operation_timeout: Duration,
}

impl ConfigMapStore {
    pub fn new(
        client: Client,
        namespace: impl Into<String>,
        name: impl Into<String>,
        operation_timeout: Duration,
    ) -> Self {
        let namespace = namespace.into();
        let api = Api::namespaced(client, &namespace);
        Self {
            api,
            namespace,
            name: name.into(),
            operation_timeout,
        }
    }

    fn config_map_for(
        &self,
        state: &IpAllocationState,
        resource_version: Option<String>,
    ) -> Result<ConfigMap, StoreError> {
        let labels = BTreeMap::from([
            (
                "app.kubernetes.io/name".to_string(),
                "cloud-api-adaptor".to_string(),
            ),
            (
                "app.kubernetes.io/component".to_string(),
                "byom-ip-pool".to_string(),
            ),
        ]);
        let data = BTreeMap::from([(STATE_DATA_KEY.to_string(), encode_state(state)?)]);

        Ok(ConfigMap {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(labels),
                resource_version,
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        })
    }

    /// Every store round-trip carries the configured operation deadline;
    /// an elapsed deadline reads as a transport failure.
    async fn with_deadline<T>(
        &self,
        call: impl Future<Output = Result<T, kube::Error>>,
    ) -> Result<T, StoreCallError> {
        match tokio::time::timeout(self.operation_timeout, call).await {
            Ok(result) => result.map_err(StoreCallError::Kube),
            Err(elapsed) => Err(StoreCallError::Deadline(elapsed)),
        }
    }
}

/// Intermediate error keeping the kube 409 visible so each operation can
/// map it to its own meaning (create: exists, update: conflict).
enum StoreCallError {
    Kube(kube::Error),
    Deadline(tokio::time::error::Elapsed),
}

impl StoreCallError {
    fn into_store_error(self, on_conflict: StoreError) -> StoreError {
        match self {
            Self::Kube(kube::Error::Api(response)) if response.code == 409 => on_conflict,
            Self::Kube(err) => StoreError::unavailable(err),
            Self::Deadline(elapsed) => StoreError::unavailable(elapsed),
        }
    }
}

fn revision_of(config_map: &ConfigMap) -> Result<Revision, StoreError> {
    config_map
        .metadata
        .resource_version
        .clone()
        .map(Revision::new)
        .ok_or_else(|| StoreError::unavailable("ConfigMap returned without a resourceVersion"))
}

#[async_trait]
impl StateStore for ConfigMapStore {
    async fn get(&self) -> Result<Option<(IpAllocationState, Revision)>, StoreError> {
        let fetched = self
            .with_deadline(self.api.get_opt(&self.name))
            .await
            .map_err(|err| err.into_store_error(StoreError::Conflict))?;

        let Some(config_map) = fetched else {
            return Ok(None);
        };
        let Some(text) = config_map
            .data
            .as_ref()
            .and_then(|data| data.get(STATE_DATA_KEY))
        else {
            // The object exists but carries no state yet; same as absent.
            return Ok(None);
        };

        let state = decode_state(text)?;
        let revision = revision_of(&config_map)?;
        Ok(Some((state, revision)))
    }

    async fn create(&self, state: &IpAllocationState) -> Result<Revision, StoreError> {
        let config_map = self.config_map_for(state, None)?;
        let created = self
            .with_deadline(self.api.create(&PostParams::default(), &config_map))
            .await
            .map_err(|err| err.into_store_error(StoreError::AlreadyExists))?;

        debug!(
            "Created ConfigMap {}/{} with initial allocation state",
            self.namespace, self.name
        );
        revision_of(&created)
    }

    async fn update(
        &self,
        state: &IpAllocationState,
        expected: &Revision,
    ) -> Result<Revision, StoreError> {
        let config_map = self.config_map_for(state, Some(expected.as_str().to_string()))?;
        let updated = self
            .with_deadline(
                self.api
                    .replace(&self.name, &PostParams::default(), &config_map),
            )
            .await
            .map_err(|err| err.into_store_error(StoreError::Conflict))?;

        debug!(
            "Updated ConfigMap {}/{} with state version {}",
            self.namespace, self.name, state.version
        );
        revision_of(&updated)
    }
}
