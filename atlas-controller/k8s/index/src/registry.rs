use crate::{sidecar::SidecarSet, Reason, Triggers};
use atlas_controller_core::{AlertRouter, ClusterRecord, Inventory};
use atlas_controller_k8s_api::{
    self as k8s, labels, Labels, ObjectMeta, Resource, ResourceExt, Selector,
};
use parking_lot::RwLock;
use std::{
    collections::{BTreeMap, BTreeSet},
    num::NonZeroU32,
    sync::Arc,
};
use tracing::{debug, info, warn};

#[cfg(test)]
mod tests;

pub type SharedIndex = Arc<RwLock<Index>>;

/// Selects the proxy pods sidecar services route to when a cluster service
/// does not set its own.
pub const DEFAULT_ENVOY_SELECTOR: &str = "app=envoy,release=atlas";

/// Holds the registered downstream clusters and alert-router replicas of the
/// monitoring namespace.
#[derive(Debug)]
pub struct Index {
    alert_router_selector: Selector,
    default_envoy_selector: Selector,
    clusters: BTreeMap<String, Registered>,
    alert_routers: BTreeMap<String, AlertRouter>,

    /// Observed sidecar services, with the uid of their controlling owner.
    sidecars: BTreeMap<String, Option<String>>,

    triggers: Triggers,
}

#[derive(Clone, Debug, PartialEq)]
struct Registered {
    record: ClusterRecord,
    owner: Option<k8s::OwnerReference>,
    ports: Option<Vec<k8s::ServicePort>>,
    envoy_selector: Selector,
}

impl kubert::index::IndexNamespacedResource<k8s::Service> for Index {
    fn apply(&mut self, service: k8s::Service) {
        let name = service.name_unchecked();
        let meta = Labels::from(service.metadata.labels.clone());

        if meta.contains_key(labels::THANOS_SIDECAR) {
            let owner = service
                .owner_references()
                .iter()
                .find(|o| o.controller == Some(true))
                .map(|o| o.uid.clone());
            self.sidecars.insert(name.clone(), owner);
        } else {
            self.sidecars.remove(&name);
        }

        let cluster = meta
            .contains_key(labels::CLUSTER)
            .then(|| self.register(&service, &meta));
        if self.update_cluster(&name, cluster) {
            self.triggers.request(Reason::Cluster);
        }

        let router = self
            .is_alert_router(&service, &meta)
            .then(|| AlertRouter {
                name: name.clone(),
                namespace: service.namespace().unwrap_or_default(),
            });
        if self.update_alert_router(&name, router) {
            self.triggers.request(Reason::AlertRouter);
        }
    }

    fn delete(&mut self, _namespace: String, name: String) {
        self.sidecars.remove(&name);
        if self.update_cluster(&name, None) {
            self.triggers.request(Reason::Cluster);
        }
        if self.update_alert_router(&name, None) {
            self.triggers.request(Reason::AlertRouter);
        }
    }
}

// === impl Index ===

impl Index {
    pub fn shared(alert_router_selector: Selector, triggers: Triggers) -> SharedIndex {
        Arc::new(RwLock::new(Self::new(alert_router_selector, triggers)))
    }

    pub fn new(alert_router_selector: Selector, triggers: Triggers) -> Self {
        let default_envoy_selector = DEFAULT_ENVOY_SELECTOR
            .parse()
            .unwrap_or_else(|_| Selector::default());
        Self {
            alert_router_selector,
            default_envoy_selector,
            clusters: BTreeMap::new(),
            alert_routers: BTreeMap::new(),
            sidecars: BTreeMap::new(),
            triggers,
        }
    }

    /// The registered clusters and alert-router replicas, ordered by name.
    pub fn inventory(&self) -> Inventory {
        Inventory {
            clusters: self.clusters.values().map(|c| c.record.clone()).collect(),
            alert_routers: self.alert_routers.values().cloned().collect(),
        }
    }

    /// The sidecar services each registered cluster should have.
    pub fn sidecars(&self) -> Vec<SidecarSet> {
        self.clusters
            .values()
            .map(|cluster| {
                let services = cluster.sidecar_services();
                let wanted = services
                    .iter()
                    .map(|s| s.name_unchecked())
                    .collect::<BTreeSet<_>>();
                let owner_uid = cluster.owner.as_ref().map(|o| o.uid.clone());
                let stale = self
                    .sidecars
                    .iter()
                    .filter(|(name, owner)| {
                        owner_uid.is_some() && **owner == owner_uid && !wanted.contains(*name)
                    })
                    .map(|(name, _)| name.clone())
                    .collect();
                SidecarSet {
                    cluster: cluster.record.name.clone(),
                    owner: cluster.owner.clone(),
                    services,
                    stale,
                }
            })
            .collect()
    }

    pub(crate) fn cluster_count(&self) -> usize {
        self.clusters.len()
    }

    pub(crate) fn alert_router_count(&self) -> usize {
        self.alert_routers.len()
    }

    fn register(&self, service: &k8s::Service, meta: &Labels) -> Registered {
        let name = service.name_unchecked();
        let mut record = ClusterRecord::new(&name, service.namespace().unwrap_or_default());
        record.replicas = parse_replicas(&name, meta.get(labels::REPLICAS));

        let annotations = service.annotations();
        if let Some(thanos) = annotations.get(labels::THANOS_SERVICE) {
            record.thanos_service = thanos.clone();
        }
        if let Some(prometheus) = annotations.get(labels::PROMETHEUS_SERVICE) {
            record.prometheus_service = prometheus.clone();
        }

        let spec = service.spec.as_ref();
        record.addresses = spec
            .and_then(|s| s.external_ips.clone())
            .unwrap_or_default();

        let envoy_selector = match annotations.get(labels::ENVOY_SELECTORS) {
            None => self.default_envoy_selector.clone(),
            Some(value) => value.parse().unwrap_or_else(|error| {
                warn!(%error, cluster = %name, "Invalid envoy selector; using the default");
                self.default_envoy_selector.clone()
            }),
        };

        Registered {
            record,
            owner: service.controller_owner_ref(&()),
            ports: spec.and_then(|s| s.ports.clone()),
            envoy_selector,
        }
    }

    fn is_alert_router(&self, service: &k8s::Service, meta: &Labels) -> bool {
        // An empty selector would match every service in the namespace.
        if self.alert_router_selector == Selector::default()
            || !self.alert_router_selector.matches(meta)
        {
            return false;
        }
        service
            .spec
            .as_ref()
            .and_then(|s| s.selector.as_ref())
            .map(|s| s.contains_key(labels::STATEFULSET_POD_NAME))
            .unwrap_or(false)
    }

    /// Returns true if the registry changed.
    fn update_cluster(&mut self, name: &str, cluster: Option<Registered>) -> bool {
        match cluster {
            Some(cluster) => {
                if self.clusters.get(name) == Some(&cluster) {
                    return false;
                }
                info!(
                    cluster = %name,
                    replicas = cluster.record.replicas.get(),
                    address = ?cluster.record.address(),
                    "Registered cluster",
                );
                self.clusters.insert(name.to_string(), cluster);
                true
            }
            None => {
                let removed = self.clusters.remove(name).is_some();
                if removed {
                    info!(cluster = %name, "Deregistered cluster");
                }
                removed
            }
        }
    }

    fn update_alert_router(&mut self, name: &str, router: Option<AlertRouter>) -> bool {
        match router {
            Some(router) => {
                if self.alert_routers.get(name) == Some(&router) {
                    return false;
                }
                debug!(service = %name, "Indexed alert router replica");
                self.alert_routers.insert(name.to_string(), router);
                true
            }
            None => self.alert_routers.remove(name).is_some(),
        }
    }
}

// === impl Registered ===

impl Registered {
    fn sidecar_services(&self) -> Vec<k8s::Service> {
        let selector = self.envoy_selector.to_map();
        let ports = self.ports.clone().map(|ports| {
            ports
                .into_iter()
                .map(|port| k8s::ServicePort {
                    node_port: None,
                    ..port
                })
                .collect::<Vec<_>>()
        });
        self.record
            .sidecar_names()
            .enumerate()
            .map(|(i, name)| k8s::Service {
                metadata: ObjectMeta {
                    name: Some(name),
                    namespace: Some(self.record.namespace.clone()),
                    labels: Some(
                        [(labels::THANOS_SIDECAR.to_string(), i.to_string())]
                            .into_iter()
                            .collect(),
                    ),
                    ..Default::default()
                },
                spec: Some(k8s::ServiceSpec {
                    cluster_ip: Some("None".to_string()),
                    type_: Some("ClusterIP".to_string()),
                    ports: ports.clone(),
                    selector: Some(selector.clone()),
                    ..Default::default()
                }),
                ..Default::default()
            })
            .collect()
    }
}

fn parse_replicas(cluster: &str, value: Option<&str>) -> NonZeroU32 {
    let Some(value) = value else {
        return NonZeroU32::MIN;
    };
    match value.trim().parse::<i64>() {
        Ok(n) if n > 0 => u32::try_from(n)
            .ok()
            .and_then(NonZeroU32::new)
            .unwrap_or(NonZeroU32::MIN),
        Ok(n) => {
            warn!(%cluster, replicas = n, "Replica count must be positive; using 1");
            NonZeroU32::MIN
        }
        Err(error) => {
            warn!(%cluster, %error, value, "Invalid replica count; using 1");
            NonZeroU32::MIN
        }
    }
}
