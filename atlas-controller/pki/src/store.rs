use atlas_controller_k8s_api::{
    self as k8s, Api, Client, Patch, PatchParams, PostParams, Resource, ResourceExt,
};
use std::{future::Future, time::Duration};

/// Persistence for certificate secrets, scoped to one namespace.
#[async_trait::async_trait]
pub trait SecretStore: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<k8s::Secret>, StoreError>;

    /// Fails with [`StoreError::Conflict`] if the secret already exists.
    async fn create(&self, secret: k8s::Secret) -> Result<k8s::Secret, StoreError>;

    /// Replaces the secret if its resource version still matches.
    async fn replace(&self, secret: k8s::Secret) -> Result<k8s::Secret, StoreError>;

    /// Writes `secrets` with a controller reference to `owner`.
    async fn apply_owned(
        &self,
        owner: &k8s::Secret,
        secrets: Vec<k8s::Secret>,
    ) -> Result<(), StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("conflicting write")]
    Conflict,

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Api(#[from] k8s::Error),
}

/// Secrets stored in the Kubernetes API.
#[derive(Clone)]
pub struct KubeSecrets {
    api: Api<k8s::Secret>,
    timeout: Duration,
}

// === impl KubeSecrets ===

impl KubeSecrets {
    pub fn new(client: Client, namespace: &str, timeout: Duration) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            timeout,
        }
    }
}

#[async_trait::async_trait]
impl SecretStore for KubeSecrets {
    async fn get(&self, name: &str) -> Result<Option<k8s::Secret>, StoreError> {
        bounded(self.timeout, self.api.get_opt(name)).await
    }

    async fn create(&self, secret: k8s::Secret) -> Result<k8s::Secret, StoreError> {
        bounded(self.timeout, self.api.create(&PostParams::default(), &secret)).await
    }

    async fn replace(&self, secret: k8s::Secret) -> Result<k8s::Secret, StoreError> {
        let name = secret.name_any();
        bounded(
            self.timeout,
            self.api.replace(&name, &PostParams::default(), &secret),
        )
        .await
    }

    async fn apply_owned(
        &self,
        owner: &k8s::Secret,
        secrets: Vec<k8s::Secret>,
    ) -> Result<(), StoreError> {
        let owner = owner.controller_owner_ref(&());
        let params = PatchParams::apply(k8s::FIELD_MANAGER).force();
        // Secrets are applied one at a time; a partial failure is repaired by
        // the next pass since every leaf is reissued together.
        for mut secret in secrets {
            secret.metadata.owner_references = owner.clone().map(|o| vec![o]);
            let name = secret.name_any();
            bounded(
                self.timeout,
                self.api.patch(&name, &params, &Patch::Apply(&secret)),
            )
            .await?;
        }
        Ok(())
    }
}

pub(crate) async fn bounded<T>(
    timeout: Duration,
    request: impl Future<Output = Result<T, k8s::Error>>,
) -> Result<T, StoreError> {
    match tokio::time::timeout(timeout, request).await {
        Err(_) => Err(StoreError::Timeout(timeout)),
        Ok(Err(error)) if k8s::is_status(&error, 409) => Err(StoreError::Conflict),
        Ok(res) => res.map_err(Into::into),
    }
}
