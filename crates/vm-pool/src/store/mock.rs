//! Mock state store for unit testing
//!
//! Stores the serialized document in memory behind a counter revision and
//! honors the same compare-and-swap contract as the ConfigMap store. Can
//! be configured to return specific failures for testing the retry paths.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{decode_state, encode_state, Revision, StateStore};
use crate::error::StoreError;
use crate::state::IpAllocationState;

#[derive(Clone, Default)]
pub struct MockStateStore {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    /// Serialized text plus revision counter; text is kept raw so tests
    /// can inject undecodable payloads.
    object: Option<(String, u64)>,
    forced_conflicts: u32,
    get_calls: u32,
    create_calls: u32,
    update_calls: u32,
}

impl MockStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the stored object (test setup).
    pub fn set_state(&self, state: &IpAllocationState) {
        let text = encode_state(state).expect("state serializes");
        let mut inner = self.inner.lock().unwrap();
        let revision = inner.object.as_ref().map_or(1, |(_, rev)| rev + 1);
        inner.object = Some((text, revision));
    }

    /// Replaces the stored text verbatim, bypassing the codec (test setup
    /// for corruption scenarios).
    pub fn set_raw(&self, text: impl Into<String>) {
        let mut inner = self.inner.lock().unwrap();
        let revision = inner.object.as_ref().map_or(1, |(_, rev)| rev + 1);
        inner.object = Some((text.into(), revision));
    }

    /// Makes the next `count` updates fail with [`StoreError::Conflict`]
    /// without applying anything.
    pub fn inject_conflicts(&self, count: u32) {
        self.inner.lock().unwrap().forced_conflicts = count;
    }

    /// Decoded current state (test assertions).
    pub fn state(&self) -> Option<IpAllocationState> {
        let inner = self.inner.lock().unwrap();
        inner
            .object
            .as_ref()
            .and_then(|(text, _)| decode_state(text).ok())
    }

    pub fn get_calls(&self) -> u32 {
        self.inner.lock().unwrap().get_calls
    }

    pub fn create_calls(&self) -> u32 {
        self.inner.lock().unwrap().create_calls
    }

    pub fn update_calls(&self) -> u32 {
        self.inner.lock().unwrap().update_calls
    }
}

#[async_trait]
impl StateStore for MockStateStore {
    async fn get(&self) -> Result<Option<(IpAllocationState, Revision)>, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.get_calls += 1;
        match &inner.object {
            None => Ok(None),
            Some((text, revision)) => {
                Ok(Some((decode_state(text)?, Revision::new(revision.to_string()))))
            }
        }
    }

    async fn create(&self, state: &IpAllocationState) -> Result<Revision, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.create_calls += 1;
        if inner.object.is_some() {
            return Err(StoreError::AlreadyExists);
        }
        inner.object = Some((encode_state(state)?, 1));
        Ok(Revision::new("1"))
    }

    async fn update(
        &self,
        state: &IpAllocationState,
        expected: &Revision,
    ) -> Result<Revision, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.update_calls += 1;
        if inner.forced_conflicts > 0 {
            inner.forced_conflicts -= 1;
            return Err(StoreError::Conflict);
        }
        let Some((_, revision)) = &inner.object else {
            return Err(StoreError::unavailable("no state object to update"));
        };
        if revision.to_string() != expected.as_str() {
            return Err(StoreError::Conflict);
        }
        let next = revision + 1;
        inner.object = Some((encode_state(state)?, next));
        Ok(Revision::new(next.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn state() -> IpAllocationState {
        IpAllocationState::initial(&["10.0.0.1".to_string()], Utc::now())
    }

    #[tokio::test]
    async fn create_then_stale_update_conflicts() {
        let store = MockStateStore::new();
        assert!(store.get().await.unwrap().is_none());

        let revision = store.create(&state()).await.unwrap();
        assert!(matches!(
            store.create(&state()).await,
            Err(StoreError::AlreadyExists)
        ));

        let fresh = store.update(&state(), &revision).await.unwrap();
        // the old token no longer matches
        assert!(matches!(
            store.update(&state(), &revision).await,
            Err(StoreError::Conflict)
        ));
        store.update(&state(), &fresh).await.unwrap();
    }

    #[tokio::test]
    async fn corrupt_payload_surfaces_as_corrupt() {
        let store = MockStateStore::new();
        store.set_raw("not json");
        assert!(matches!(store.get().await, Err(StoreError::Corrupt { .. })));
    }
}
