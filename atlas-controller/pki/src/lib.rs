#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

//! The controller's private certificate authority.
//!
//! A single root CA is persisted in the `atlas-ca` secret. Leaf certificates
//! for the hub ingress and for proxy mTLS are issued from it and persisted
//! alongside, labelled with the serial of the root that signed them and a
//! checksum of the inputs they were issued from.

mod ca;
mod leaf;
#[cfg(any(test, feature = "test-util"))]
mod memory;
mod store;
mod subject;


pub use self::{
    ca::{archive_key, RootCa, CA_SECRET},
    leaf::{Leaf, LeafKind},
    store::{KubeSecrets, SecretStore, StoreError},
    subject::{checksum, Subject, Usage},
};
#[cfg(any(test, feature = "test-util"))]
pub use self::memory::MemoryStore;

use self::leaf::Stale;
use atlas_controller_core::synth::{KeyPair, TlsMaterial};
use atlas_controller_k8s_api::{self as k8s, labels, ResourceExt};
use openssl::{bn::BigNum, error::ErrorStack};
use std::sync::Arc;
use tracing::{debug, info};

pub const DEFAULT_KEY_BITS: u32 = 4096;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to access secret {name}: {source}")]
    Store {
        name: String,
        #[source]
        source: StoreError,
    },

    #[error("secret {name} is missing {key}")]
    MissingKey { name: String, key: &'static str },

    #[error("secret {name} has malformed {key}: {source}")]
    Malformed {
        name: String,
        key: &'static str,
        #[source]
        source: ErrorStack,
    },

    #[error("certificate generation failed: {0}")]
    Crypto(#[from] ErrorStack),
}

#[derive(Clone, Debug)]
pub struct Settings {
    /// Common name of the ingress certificate; the hub's public address.
    pub ingress_common_name: String,
    pub key_bits: u32,
}

/// Owns the persisted root CA and leaf certificates.
pub struct CertStore<S> {
    store: S,
    settings: Settings,
    active: Option<Arc<RootCa>>,
}

/// The certificate material current after a reconciliation.
#[derive(Clone, Debug)]
pub struct Material {
    pub root: Arc<RootCa>,
    pub ingress: Leaf,
    pub server: Leaf,
    pub client: Leaf,
}

// === impl Error ===

impl Error {
    fn store(name: &str) -> impl FnOnce(StoreError) -> Self + '_ {
        move |source| Self::Store {
            name: name.to_string(),
            source,
        }
    }

    /// True when the pass lost an optimistic-concurrency race and should be
    /// retried shortly.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::Store {
                source: StoreError::Conflict,
                ..
            }
        )
    }
}

// === impl Settings ===

impl Settings {
    pub fn new(ingress_common_name: impl Into<String>) -> Self {
        Self {
            ingress_common_name: ingress_common_name.into(),
            key_bits: DEFAULT_KEY_BITS,
        }
    }
}

// === impl CertStore ===

impl<S: SecretStore> CertStore<S> {
    pub fn new(store: S, settings: Settings) -> Self {
        Self {
            store,
            settings,
            active: None,
        }
    }

    /// The root CA observed by the last successful reconciliation.
    pub fn active(&self) -> Option<&Arc<RootCa>> {
        self.active.as_ref()
    }

    /// Ensures the root CA exists (rotating it if requested) and that every
    /// leaf is signed by it and current, then returns the resulting material.
    pub async fn reconcile(&mut self) -> Result<Material, Error> {
        let (root, owner) = self.ensure_root().await?;
        let [ingress, server, client] = self.ensure_leaves(&root, &owner).await?;
        Ok(Material {
            root,
            ingress,
            server,
            client,
        })
    }

    async fn ensure_root(&mut self) -> Result<(Arc<RootCa>, k8s::Secret), Error> {
        let stored = self
            .store
            .get(CA_SECRET)
            .await
            .map_err(Error::store(CA_SECRET))?;

        let (root, secret) = match stored {
            None => {
                let root = RootCa::generate(self.settings.key_bits)?;
                let secret = self
                    .store
                    .create(root.to_secret())
                    .await
                    .map_err(Error::store(CA_SECRET))?;
                info!(serial = %root.serial(), revision = root.revision(), "Created root CA");
                (root, secret)
            }

            Some(stored) if stored.annotations().contains_key(labels::CA_ROTATE) => {
                let current = RootCa::from_secret(&stored)?;
                let next = current.rotate(self.settings.key_bits)?;
                let mut secret = next.to_secret();
                secret.metadata.resource_version = stored.metadata.resource_version.clone();
                let secret = self
                    .store
                    .replace(secret)
                    .await
                    .map_err(Error::store(CA_SECRET))?;
                info!(
                    serial = %next.serial(),
                    revision = next.revision(),
                    archived = %current.serial(),
                    "Rotated root CA",
                );
                (next, secret)
            }

            Some(stored) => {
                if let Some(active) = self.active.as_ref() {
                    if active_matches(active, &stored) {
                        return Ok((active.clone(), stored));
                    }
                }
                (RootCa::from_secret(&stored)?, stored)
            }
        };

        let root = Arc::new(root);
        self.active = Some(root.clone());
        Ok((root, secret))
    }

    async fn ensure_leaves(
        &self,
        root: &RootCa,
        owner: &k8s::Secret,
    ) -> Result<[Leaf; 3], Error> {
        let current = (
            self.current_leaf(LeafKind::Ingress, root).await?,
            self.current_leaf(LeafKind::Server, root).await?,
            self.current_leaf(LeafKind::Client, root).await?,
        );
        if let (Some(ingress), Some(server), Some(client)) = current {
            debug!("Leaf certificates are current");
            return Ok([ingress, server, client]);
        }

        // Leaves are always reissued together, each with a serial greater
        // than the one before it.
        let ingress = Leaf::issue(LeafKind::Ingress, root, &self.settings, None)?;
        let floor = BigNum::from_dec_str(&ingress.serial)?;
        let server = Leaf::issue(LeafKind::Server, root, &self.settings, Some(&*floor))?;
        let floor = BigNum::from_dec_str(&server.serial)?;
        let client = Leaf::issue(LeafKind::Client, root, &self.settings, Some(&*floor))?;
        let leaves = [ingress, server, client];

        let secrets = leaves.iter().map(|leaf| leaf.to_secret(root)).collect();
        self.store
            .apply_owned(owner, secrets)
            .await
            .map_err(Error::store(LeafKind::Ingress.secret_name()))?;
        info!(signed_by = %root.serial(), "Issued leaf certificates");

        Ok(leaves)
    }

    /// Loads a stored leaf, returning `None` if it must be reissued.
    async fn current_leaf(&self, kind: LeafKind, root: &RootCa) -> Result<Option<Leaf>, Error> {
        let name = kind.secret_name();
        let secret = self.store.get(name).await.map_err(Error::store(name))?;
        let checksum = kind.checksum(&self.settings);
        match (Stale::check(secret.as_ref(), root.serial(), &checksum), secret) {
            (None, Some(secret)) => Ok(Some(Leaf::from_secret(kind, &secret)?)),
            (reason, _) => {
                let reason = reason.unwrap_or(Stale::Missing);
                info!(leaf = name, %reason, "Leaf certificate requires issuance");
                Ok(None)
            }
        }
    }
}

// === impl Material ===

impl Material {
    /// The material proxies are configured with.
    pub fn tls(&self) -> TlsMaterial {
        TlsMaterial {
            trust_bundle: self.root.trust_bundle(),
            server: KeyPair {
                certificate: self.server.certificate.clone(),
                private_key: self.server.private_key.clone(),
            },
            client: KeyPair {
                certificate: self.client.certificate.clone(),
                private_key: self.client.private_key.clone(),
            },
        }
    }
}

/// Whether the stored secret still describes the active root, archive
/// included, so it need not be parsed again.
fn active_matches(active: &RootCa, stored: &k8s::Secret) -> bool {
    let stored_labels = stored.labels();
    stored_labels.get(labels::CA_SERIAL).map(String::as_str) == Some(active.serial())
        && stored_labels
            .get(labels::CA_REVISION)
            .and_then(|r| r.parse::<u64>().ok())
            == Some(active.revision())
        && active.archive_matches(stored)
}
