use std::num::NonZeroU32;

/// Default in-cluster address of a downstream cluster's query layer.
pub const THANOS_FQDN: &str = "prometheus-operated.monitoring.svc.cluster.local";

/// Default in-cluster address of a downstream cluster's metrics server.
pub const PROMETHEUS_FQDN: &str = "prometheus-operated.monitoring.svc.cluster.local";

/// A registered downstream cluster.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterRecord {
    /// Stable identifier, reused as the cluster's snapshot key.
    pub name: String,
    pub namespace: String,
    pub replicas: NonZeroU32,
    pub addresses: Vec<String>,
    pub thanos_service: String,
    pub prometheus_service: String,
}

/// One alert-router replica reachable from the hub.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AlertRouter {
    pub name: String,
    pub namespace: String,
}

/// Everything the registry knows at the start of a pass, in deterministic
/// order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Inventory {
    pub clusters: Vec<ClusterRecord>,
    pub alert_routers: Vec<AlertRouter>,
}

// === impl ClusterRecord ===

impl ClusterRecord {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            replicas: NonZeroU32::MIN,
            addresses: Vec::new(),
            thanos_service: THANOS_FQDN.to_string(),
            prometheus_service: PROMETHEUS_FQDN.to_string(),
        }
    }

    /// The address the hub dials. Only the first external address is used.
    pub fn address(&self) -> Option<&str> {
        self.addresses.first().map(String::as_str)
    }

    /// Names of the per-replica sidecar services, in replica order.
    pub fn sidecar_names(&self) -> impl Iterator<Item = String> + '_ {
        (0..self.replicas.get()).map(move |i| format!("{}-thanos-sidecar{i}", self.name))
    }
}

// === impl AlertRouter ===

impl AlertRouter {
    pub fn fqdn(&self) -> String {
        format!("{}.{}.svc.cluster.local", self.name, self.namespace)
    }
}
