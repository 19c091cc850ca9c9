use crate::{xds, ResourceType};
use atlas_controller_core::{ConfigGraph, GraphError};
use envoy_types::pb::google::protobuf::Any;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::Arc,
};
use tokio::sync::watch;
use tracing::{info, warn};

/// The resources one proxy is served, as of one version.
#[derive(Debug, PartialEq)]
pub struct Snapshot {
    key: String,
    version: String,
    resources: BTreeMap<ResourceType, BTreeMap<String, NamedResource>>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct NamedResource {
    pub name: String,
    /// Hex SHA-256 of the encoded resource; its version in incremental
    /// responses.
    pub digest: String,
    pub resource: Any,
}

/// The current snapshot for each proxy key. Readers observe changes through
/// [`SnapshotCache::subscribe`].
#[derive(Clone, Debug, Default)]
pub struct SnapshotCache(Arc<RwLock<HashMap<String, Slot>>>);

type Slot = watch::Sender<Option<Arc<Snapshot>>>;

pub type SnapshotRx = watch::Receiver<Option<Arc<Snapshot>>>;

/// The outcome of publishing one pass's graphs.
#[derive(Debug, Default)]
pub struct PublishReport {
    pub version: String,
    pub published: Vec<String>,
    /// Keys whose graph failed validation. Their previous snapshot is kept.
    pub rejected: Vec<(String, GraphError)>,
    /// Keys absent from the pass whose snapshot was withdrawn.
    pub withdrawn: Vec<String>,
}

// === impl Snapshot ===

impl Snapshot {
    /// Validates and encodes a graph.
    pub fn build(
        key: impl Into<String>,
        version: impl Into<String>,
        graph: &ConfigGraph,
    ) -> Result<Self, GraphError> {
        graph.validate()?;

        let mut resources = BTreeMap::<_, BTreeMap<_, _>>::new();
        for (ty, name, resource) in xds::encode(graph) {
            let digest = hex::encode(Sha256::digest(&resource.value));
            resources.entry(ty).or_default().insert(
                name.clone(),
                NamedResource {
                    name,
                    digest,
                    resource,
                },
            );
        }

        Ok(Self {
            key: key.into(),
            version: version.into(),
            resources,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// All resources of a type, ordered by name.
    pub fn resources(&self, ty: ResourceType) -> impl Iterator<Item = &NamedResource> {
        self.resources.get(&ty).into_iter().flat_map(|r| r.values())
    }

    pub fn get(&self, ty: ResourceType, name: &str) -> Option<&NamedResource> {
        self.resources.get(&ty).and_then(|r| r.get(name))
    }

    /// The resources of a type a subscriber asked for. Wildcard types, and
    /// requests that name nothing, receive everything.
    pub fn select<'a>(
        &'a self,
        ty: ResourceType,
        names: &'a BTreeSet<String>,
    ) -> Vec<&'a NamedResource> {
        if ty.is_wildcard() || names.is_empty() {
            return self.resources(ty).collect();
        }
        names.iter().filter_map(|n| self.get(ty, n)).collect()
    }
}

// === impl SnapshotCache ===

impl SnapshotCache {
    pub fn get(&self, key: &str) -> Option<Arc<Snapshot>> {
        self.0.read().get(key).and_then(|tx| tx.borrow().clone())
    }

    /// Observes the snapshot for `key`, which need not exist yet.
    pub fn subscribe(&self, key: &str) -> SnapshotRx {
        if let Some(tx) = self.0.read().get(key) {
            return tx.subscribe();
        }
        self.0
            .write()
            .entry(key.to_string())
            .or_insert_with(|| watch::channel(None).0)
            .subscribe()
    }

    /// Keys that currently have a snapshot.
    pub fn keys(&self) -> Vec<String> {
        let mut keys = self
            .0
            .read()
            .iter()
            .filter(|(_, tx)| tx.borrow().is_some())
            .map(|(k, _)| k.clone())
            .collect::<Vec<_>>();
        keys.sort();
        keys
    }

    /// Builds and publishes a snapshot for every graph under one version.
    /// A graph that fails validation leaves that key's previous snapshot in
    /// place; keys that are not part of the pass are withdrawn.
    pub fn publish(
        &self,
        version: &str,
        graphs: impl IntoIterator<Item = (String, ConfigGraph)>,
    ) -> PublishReport {
        let mut report = PublishReport {
            version: version.to_string(),
            ..Default::default()
        };
        let mut seen = BTreeSet::new();

        for (key, graph) in graphs {
            seen.insert(key.clone());
            match Snapshot::build(&key, version, &graph) {
                Ok(snapshot) => {
                    self.slot(&key).send_replace(Some(Arc::new(snapshot)));
                    report.published.push(key);
                }
                Err(error) => {
                    warn!(%key, %version, %error, "Rejected snapshot; keeping the previous one");
                    report.rejected.push((key, error));
                }
            }
        }

        // Withdraw keys absent from the pass and drop slots nobody observes.
        self.0.write().retain(|key, tx| {
            if !seen.contains(key) && tx.borrow().is_some() {
                tx.send_replace(None);
                info!(%key, "Withdrew snapshot");
                report.withdrawn.push(key.clone());
            }
            tx.borrow().is_some() || tx.receiver_count() > 0
        });
        report.withdrawn.sort();

        info!(
            %version,
            published = report.published.len(),
            rejected = report.rejected.len(),
            "Published snapshots",
        );
        report
    }

    /// Drops the slot for `key` if it holds no snapshot and has no
    /// subscribers left.
    pub(crate) fn release(&self, key: &str) {
        let mut slots = self.0.write();
        let idle = slots
            .get(key)
            .is_some_and(|tx| tx.borrow().is_none() && tx.receiver_count() == 0);
        if idle {
            slots.remove(key);
        }
    }

    #[cfg(test)]
    pub(crate) fn slots(&self) -> usize {
        self.0.read().len()
    }

    fn slot(&self, key: &str) -> Slot {
        self.0
            .write()
            .entry(key.to_string())
            .or_insert_with(|| watch::channel(None).0)
            .clone()
    }
}
