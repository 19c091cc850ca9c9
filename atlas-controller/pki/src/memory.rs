use crate::store::{SecretStore, StoreError};
use atlas_controller_k8s_api::{self as k8s, Resource, ResourceExt};
use parking_lot::Mutex;
use std::{collections::BTreeMap, sync::Arc, time::Duration};

/// An in-memory [`SecretStore`] with resource-version semantics matching the
/// API server's.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore(Arc<Mutex<State>>);

#[derive(Debug, Default)]
struct State {
    secrets: BTreeMap<String, k8s::Secret>,
    version: u64,
    writes: usize,
    unavailable: bool,
}

// === impl MemoryStore ===

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn secret(&self, name: &str) -> Option<k8s::Secret> {
        self.0.lock().secrets.get(name).cloned()
    }

    /// Sets an annotation on a stored secret, bumping its resource version.
    pub fn annotate(&self, name: &str, key: &str, value: &str) {
        let mut state = self.0.lock();
        let version = state.next_version();
        if let Some(secret) = state.secrets.get_mut(name) {
            secret
                .annotations_mut()
                .insert(key.to_string(), value.to_string());
            secret.metadata.resource_version = Some(version);
        }
    }

    /// Sets a label on a stored secret, bumping its resource version.
    pub fn label(&self, name: &str, key: &str, value: &str) {
        let mut state = self.0.lock();
        let version = state.next_version();
        if let Some(secret) = state.secrets.get_mut(name) {
            secret.labels_mut().insert(key.to_string(), value.to_string());
            secret.metadata.resource_version = Some(version);
        }
    }

    /// Sets a data entry on a stored secret, bumping its resource version.
    pub fn set_data(&self, name: &str, key: &str, value: &[u8]) {
        let mut state = self.0.lock();
        let version = state.next_version();
        if let Some(secret) = state.secrets.get_mut(name) {
            secret
                .data
                .get_or_insert_with(Default::default)
                .insert(key.to_string(), k8s::ByteString(value.to_vec()));
            secret.metadata.resource_version = Some(version);
        }
    }

    /// The number of successful writes.
    pub fn writes(&self) -> usize {
        self.0.lock().writes
    }

    /// While set, every write times out.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.0.lock().unavailable = unavailable;
    }
}

#[async_trait::async_trait]
impl SecretStore for MemoryStore {
    async fn get(&self, name: &str) -> Result<Option<k8s::Secret>, StoreError> {
        Ok(self.secret(name))
    }

    async fn create(&self, mut secret: k8s::Secret) -> Result<k8s::Secret, StoreError> {
        let mut state = self.0.lock();
        state.check_available()?;
        let name = secret.name_any();
        if state.secrets.contains_key(&name) {
            return Err(StoreError::Conflict);
        }
        let version = state.next_version();
        secret.metadata.uid = Some(format!("uid-{version}"));
        secret.metadata.resource_version = Some(version);
        state.secrets.insert(name, secret.clone());
        state.writes += 1;
        Ok(secret)
    }

    async fn replace(&self, mut secret: k8s::Secret) -> Result<k8s::Secret, StoreError> {
        let mut state = self.0.lock();
        state.check_available()?;
        let name = secret.name_any();
        let Some(current) = state.secrets.get(&name) else {
            return Err(StoreError::Conflict);
        };
        if current.metadata.resource_version != secret.metadata.resource_version {
            return Err(StoreError::Conflict);
        }
        secret.metadata.uid = current.metadata.uid.clone();
        secret.metadata.resource_version = Some(state.next_version());
        state.secrets.insert(name, secret.clone());
        state.writes += 1;
        Ok(secret)
    }

    async fn apply_owned(
        &self,
        owner: &k8s::Secret,
        secrets: Vec<k8s::Secret>,
    ) -> Result<(), StoreError> {
        let mut state = self.0.lock();
        state.check_available()?;
        let owner = owner.controller_owner_ref(&());
        for mut secret in secrets {
            let name = secret.name_any();
            let version = state.next_version();
            secret.metadata.owner_references = owner.clone().map(|o| vec![o]);
            secret.metadata.uid = state
                .secrets
                .get(&name)
                .and_then(|s| s.metadata.uid.clone())
                .or_else(|| Some(format!("uid-{version}")));
            secret.metadata.resource_version = Some(version);
            state.secrets.insert(name, secret);
            state.writes += 1;
        }
        Ok(())
    }
}

// === impl State ===

impl State {
    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable {
            return Err(StoreError::Timeout(Duration::ZERO));
        }
        Ok(())
    }
}
