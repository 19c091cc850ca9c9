use crate::{Reason, Triggers};
use atlas_controller_k8s_api::{self as k8s, labels, ResourceExt};
use std::collections::HashMap;

/// Watches the root CA and leaf certificate secrets, requesting a pass when
/// any of them changes outside the controller's own bookkeeping.
#[derive(Debug)]
pub struct CertificateSecrets {
    versions: HashMap<String, Option<String>>,
    triggers: Triggers,
}

impl kubert::index::IndexNamespacedResource<k8s::Secret> for CertificateSecrets {
    fn apply(&mut self, secret: k8s::Secret) {
        let name = secret.name_unchecked();
        let meta = secret.labels();
        if !meta.contains_key(labels::CA) && !meta.contains_key(labels::CERT) {
            return;
        }

        let version = secret.resource_version();
        if self.versions.get(&name) == Some(&version) {
            return;
        }
        tracing::debug!(secret = %name, ?version, "Certificate secret changed");
        self.versions.insert(name, version);
        self.triggers.request(Reason::Secret);
    }

    fn delete(&mut self, _namespace: String, name: String) {
        if self.versions.remove(&name).is_some() {
            tracing::info!(secret = %name, "Certificate secret deleted");
            self.triggers.request(Reason::Secret);
        }
    }
}

impl CertificateSecrets {
    pub fn new(triggers: Triggers) -> Self {
        Self {
            versions: HashMap::new(),
            triggers,
        }
    }
}
