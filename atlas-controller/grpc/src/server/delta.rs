use crate::{cache::Snapshot, ResourceType};
use envoy_types::pb::envoy::service::discovery::v3::{
    DeltaDiscoveryRequest, DeltaDiscoveryResponse, Resource,
};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

const WILDCARD: &str = "*";

/// Incremental protocol state for one stream.
#[derive(Debug)]
pub(crate) struct DeltaState {
    fixed: Option<ResourceType>,
    watches: BTreeMap<ResourceType, Watch>,
    nonce: u64,
}

#[derive(Debug, Default)]
struct Watch {
    wildcard: bool,
    names: BTreeSet<String>,
    /// The digest of each resource the proxy holds.
    known: BTreeMap<String, String>,
}

// === impl DeltaState ===

impl DeltaState {
    pub(crate) fn new(fixed: Option<ResourceType>) -> Self {
        Self {
            fixed,
            watches: BTreeMap::new(),
            nonce: 0,
        }
    }

    pub(crate) fn resource_type(&self, type_url: &str) -> Result<ResourceType, tonic::Status> {
        super::resource_type(self.fixed, type_url)
    }

    /// Applies a request's subscription changes, returning a response if the
    /// proxy is missing anything it now subscribes to.
    pub(crate) fn on_request(
        &mut self,
        ty: ResourceType,
        req: &DeltaDiscoveryRequest,
        snapshot: Option<&Snapshot>,
    ) -> Option<DeltaDiscoveryResponse> {
        let first = !self.watches.contains_key(&ty);
        let watch = self.watches.entry(ty).or_default();

        if first {
            watch.known.extend(
                req.initial_resource_versions
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone())),
            );
            if ty.is_wildcard() && req.resource_names_subscribe.is_empty() {
                watch.wildcard = true;
            }
        }

        for name in &req.resource_names_subscribe {
            if name == WILDCARD {
                watch.wildcard = true;
            } else {
                watch.names.insert(name.clone());
                // Subscribing asks for the resource even if the proxy
                // believes it holds it.
                watch.known.remove(name);
            }
        }
        for name in &req.resource_names_unsubscribe {
            if name == WILDCARD {
                watch.wildcard = false;
            } else {
                watch.names.remove(name);
                watch.known.remove(name);
            }
        }

        if !req.response_nonce.is_empty() {
            if let Some(error) = req.error_detail.as_ref() {
                warn!(%ty, nonce = %req.response_nonce, message = %error.message, "Proxy rejected configuration");
            } else {
                debug!(%ty, nonce = %req.response_nonce, "Proxy acknowledged configuration");
            }
            if req.resource_names_subscribe.is_empty() && req.resource_names_unsubscribe.is_empty()
            {
                return None;
            }
        }

        snapshot.and_then(|s| self.diff(ty, s))
    }

    /// Responses for every watched type whose resources changed.
    pub(crate) fn on_snapshot(&mut self, snapshot: &Snapshot) -> Vec<DeltaDiscoveryResponse> {
        let types = self.watches.keys().copied().collect::<Vec<_>>();
        types
            .into_iter()
            .filter_map(|ty| self.diff(ty, snapshot))
            .collect()
    }

    fn diff(&mut self, ty: ResourceType, snapshot: &Snapshot) -> Option<DeltaDiscoveryResponse> {
        let watch = self.watches.get_mut(&ty)?;

        let mut resources = Vec::new();
        for r in snapshot.resources(ty) {
            let wanted = watch.wildcard || watch.names.contains(&r.name);
            if wanted && watch.known.get(&r.name) != Some(&r.digest) {
                watch.known.insert(r.name.clone(), r.digest.clone());
                resources.push(Resource {
                    name: r.name.clone(),
                    version: r.digest.clone(),
                    resource: Some(r.resource.clone()),
                    ..Default::default()
                });
            }
        }

        let removed_resources = watch
            .known
            .keys()
            .filter(|name| snapshot.get(ty, name).is_none())
            .cloned()
            .collect::<Vec<_>>();
        for name in &removed_resources {
            watch.known.remove(name);
        }

        if resources.is_empty() && removed_resources.is_empty() {
            return None;
        }

        self.nonce += 1;
        Some(DeltaDiscoveryResponse {
            system_version_info: snapshot.version().to_string(),
            resources,
            type_url: ty.type_url().to_string(),
            removed_resources,
            nonce: self.nonce.to_string(),
            ..Default::default()
        })
    }
}
