use atlas_controller_k8s_api::{
    self as k8s, Api, Client, Patch, PatchParams, ResourceExt,
};
use std::{future::Future, time::Duration};

/// The headless services that give one cluster's replicas in-cluster names.
#[derive(Clone, Debug, PartialEq)]
pub struct SidecarSet {
    pub cluster: String,
    pub owner: Option<k8s::OwnerReference>,
    pub services: Vec<k8s::Service>,
    /// Sidecar services created for an earlier replica count.
    pub stale: Vec<String>,
}

/// Persists sidecar services.
#[async_trait::async_trait]
pub trait SidecarStore: Send + Sync {
    async fn apply(&self, set: &SidecarSet) -> Result<(), SidecarError>;
}

#[derive(Debug, thiserror::Error)]
pub enum SidecarError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Api(#[from] k8s::Error),
}

/// Sidecar services written through server-side apply.
#[derive(Clone)]
pub struct KubeServices {
    api: Api<k8s::Service>,
    timeout: Duration,
}

// === impl KubeServices ===

impl KubeServices {
    pub fn new(client: Client, namespace: &str, timeout: Duration) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            timeout,
        }
    }
}

#[async_trait::async_trait]
impl SidecarStore for KubeServices {
    async fn apply(&self, set: &SidecarSet) -> Result<(), SidecarError> {
        let params = PatchParams::apply(k8s::FIELD_MANAGER).force();
        for service in &set.services {
            let mut service = service.clone();
            service.metadata.owner_references = set.owner.clone().map(|o| vec![o]);
            let name = service.name_any();
            bounded(
                self.timeout,
                self.api.patch(&name, &params, &Patch::Apply(&service)),
            )
            .await?;
        }

        for name in &set.stale {
            match bounded(
                self.timeout,
                self.api.delete(name, &Default::default()),
            )
            .await
            {
                Ok(_) => tracing::info!(cluster = %set.cluster, service = %name, "Deleted sidecar service"),
                Err(SidecarError::Api(error)) if k8s::is_status(&error, 404) => {}
                Err(error) => return Err(error),
            }
        }
        Ok(())
    }
}

async fn bounded<T>(
    timeout: Duration,
    request: impl Future<Output = Result<T, k8s::Error>>,
) -> Result<T, SidecarError> {
    tokio::time::timeout(timeout, request)
        .await
        .map_err(|_| SidecarError::Timeout(timeout))?
        .map_err(Into::into)
}
