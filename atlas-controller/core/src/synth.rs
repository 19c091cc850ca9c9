//! Builds the hub and per-cluster configuration graphs for one pass.

use crate::{
    cluster::{ClusterRecord, Inventory},
    cluster_inbound,
    graph::{
        Cluster, ConfigGraph, Listener, Route, RouteConfig, Secret, VirtualHost, CLIENT_SECRET,
        SERVER_SECRET,
    },
    hub, ALERTMANAGER_PORT, HUB_NODE_ID, PROMETHEUS_PORT, THANOS_PORT,
};
use std::net::IpAddr;


/// Process-wide inputs to synthesis.
#[derive(Clone, Debug)]
pub struct Settings {
    /// The address downstream proxies use to reach the hub proxy.
    pub hub_address: String,
    /// The host and port the hub proxy uses to reach the discovery server.
    pub ads_host: String,
    pub ads_port: u16,
    /// The namespace alert-router domains are published under.
    pub namespace: String,
    /// Adds public debugging backends to the hub graph.
    pub debug_backends: bool,
}

/// Certificate material produced by the certificate store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TlsMaterial {
    /// All retained CA certificates, active first.
    pub trust_bundle: String,
    pub server: KeyPair,
    pub client: KeyPair,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyPair {
    pub certificate: String,
    pub private_key: String,
}

pub struct Synthesizer<'a> {
    settings: &'a Settings,
    tls: &'a TlsMaterial,
    inventory: &'a Inventory,
}

const XDS_LOCAL: &str = "xds_local";
const DOWNSTREAM_THANOS: &str = "downstream_thanos";
const DOWNSTREAM_PROMETHEUS: &str = "downstream_prometheus";
const UPSTREAM_ALERTMANAGERS: &str = "upstream_alertmanagers";
const THANOS_SIDECAR: &str = "thanos_sidecar";
const PROMETHEUS: &str = "prometheus";
const ALERTMANAGERS: &str = "alertmanagers";

// === impl Synthesizer ===

impl<'a> Synthesizer<'a> {
    pub fn new(settings: &'a Settings, tls: &'a TlsMaterial, inventory: &'a Inventory) -> Self {
        Self {
            settings,
            tls,
            inventory,
        }
    }

    /// Every graph produced by this pass, keyed by snapshot key. The hub graph
    /// comes first, followed by clusters in registry order.
    pub fn graphs(&self) -> Vec<(String, ConfigGraph)> {
        let mut graphs = Vec::with_capacity(self.inventory.clusters.len() + 1);
        graphs.push((HUB_NODE_ID.to_string(), self.hub()));
        for cluster in &self.inventory.clusters {
            graphs.push((cluster.name.clone(), self.downstream(cluster)));
        }
        graphs
    }

    pub fn hub(&self) -> ConfigGraph {
        let mut graph = ConfigGraph::default();

        graph.clusters.push(
            Cluster::new(XDS_LOCAL, &self.settings.ads_host, self.settings.ads_port).http2(),
        );
        graph.routes.push(RouteConfig::new(
            XDS_LOCAL,
            vec![VirtualHost::catch_all("backend", XDS_LOCAL)],
        ));
        graph.listeners.push(Listener::tls(
            "xds_external",
            hub::ADS_PORT,
            XDS_LOCAL,
            SERVER_SECRET,
        ));

        let mut thanos_hosts = Vec::new();
        let mut prometheus_routes = Vec::new();
        for record in &self.inventory.clusters {
            let Some(address) = record.address() else {
                tracing::warn!(cluster = %record.name, "Cluster has no external address; skipping");
                continue;
            };

            let thanos = format!("{}-thanos", record.name);
            let prom = format!("{}-prom", record.name);
            graph.clusters.push(
                Cluster::new(&thanos, address, cluster_inbound::THANOS_PORT)
                    .http2()
                    .with_mtls(CLIENT_SECRET),
            );
            graph.clusters.push(
                Cluster::new(&prom, address, cluster_inbound::PROMETHEUS_PORT)
                    .http2()
                    .with_mtls(CLIENT_SECRET),
            );

            let mut domains = vec![format!("{0}.{0}.svc.cluster.local*", record.name)];
            domains.extend(record.sidecar_names().map(|sidecar| {
                format!("{sidecar}.{}.svc.cluster.local*", record.namespace)
            }));
            thanos_hosts.push(VirtualHost {
                name: thanos.clone(),
                domains,
                routes: vec![Route::new("/", &thanos).rewrite_host(&record.thanos_service)],
            });

            prometheus_routes
                .push(Route::new(format!("/prom/{}/", record.name), &prom).rewrite_prefix("/"));
        }

        graph
            .routes
            .push(RouteConfig::new(DOWNSTREAM_THANOS, thanos_hosts));
        graph.routes.push(RouteConfig::new(
            DOWNSTREAM_PROMETHEUS,
            vec![VirtualHost {
                name: PROMETHEUS.to_string(),
                domains: vec!["*".to_string()],
                routes: prometheus_routes,
            }],
        ));
        graph.listeners.push(Listener::plain(
            DOWNSTREAM_THANOS,
            hub::THANOS_PORT,
            DOWNSTREAM_THANOS,
        ));
        graph.listeners.push(Listener::plain(
            DOWNSTREAM_PROMETHEUS,
            hub::PROMETHEUS_PORT,
            DOWNSTREAM_PROMETHEUS,
        ));

        if !self.inventory.alert_routers.is_empty() {
            let mut hosts = Vec::with_capacity(self.inventory.alert_routers.len());
            for (i, router) in self.inventory.alert_routers.iter().enumerate() {
                let name = format!("alertmanager{i}");
                let fqdn = router.fqdn();
                graph
                    .clusters
                    .push(Cluster::new(&name, &fqdn, ALERTMANAGER_PORT));
                hosts.push(VirtualHost {
                    name: name.clone(),
                    domains: vec![self.alert_router_domain(i)],
                    routes: vec![
                        Route::new("/", &name).rewrite_host(format!("{fqdn}:{ALERTMANAGER_PORT}"))
                    ],
                });
            }
            graph
                .routes
                .push(RouteConfig::new(UPSTREAM_ALERTMANAGERS, hosts));
            graph.listeners.push(Listener::mtls(
                UPSTREAM_ALERTMANAGERS,
                hub::ALERTMANAGER_PORT,
                UPSTREAM_ALERTMANAGERS,
                SERVER_SECRET,
            ));
        }

        if self.settings.debug_backends {
            for (cluster, route, listener, host, port) in [
                ("envoy_proxy", "envoy_route", "envoyproxy", "www.envoyproxy.io", 10000),
                ("google", "google_route", "google", "www.google.com", 10001),
            ] {
                graph.clusters.push(Cluster::new(cluster, host, 80).http2());
                graph.routes.push(RouteConfig::new(
                    route,
                    vec![VirtualHost {
                        name: "backend".to_string(),
                        domains: vec!["*".to_string()],
                        routes: vec![Route::new("/", cluster).rewrite_host(host)],
                    }],
                ));
                graph
                    .listeners
                    .push(Listener::tls(listener, port, route, SERVER_SECRET));
            }
        }

        graph.secrets.push(Secret::validation(&self.tls.trust_bundle));
        graph.secrets.push(self.certificate(SERVER_SECRET));
        if !self.inventory.clusters.is_empty() {
            graph.secrets.push(self.certificate(CLIENT_SECRET));
        }

        graph
    }

    pub fn downstream(&self, record: &ClusterRecord) -> ConfigGraph {
        let mut graph = ConfigGraph {
            clusters: vec![
                Cluster::new(THANOS_SIDECAR, &record.thanos_service, THANOS_PORT).http2(),
                Cluster::new(PROMETHEUS, &record.prometheus_service, PROMETHEUS_PORT),
            ],
            routes: vec![
                RouteConfig::new(
                    THANOS_SIDECAR,
                    vec![VirtualHost::catch_all(THANOS_SIDECAR, THANOS_SIDECAR)],
                ),
                RouteConfig::new(
                    PROMETHEUS,
                    vec![VirtualHost::catch_all(PROMETHEUS, PROMETHEUS)],
                ),
            ],
            listeners: vec![
                Listener::mtls(
                    THANOS_SIDECAR,
                    cluster_inbound::THANOS_PORT,
                    THANOS_SIDECAR,
                    SERVER_SECRET,
                ),
                Listener::mtls(
                    PROMETHEUS,
                    cluster_inbound::PROMETHEUS_PORT,
                    PROMETHEUS,
                    SERVER_SECRET,
                ),
            ],
            secrets: vec![
                Secret::validation(&self.tls.trust_bundle),
                self.certificate(SERVER_SECRET),
            ],
        };

        if !self.inventory.alert_routers.is_empty() && !is_loopback(&self.settings.hub_address) {
            graph.clusters.push(
                Cluster::new(
                    ALERTMANAGERS,
                    &self.settings.hub_address,
                    hub::ALERTMANAGER_PORT,
                )
                .http2()
                .with_mtls(CLIENT_SECRET),
            );
            graph.listeners.push(Listener::plain(
                ALERTMANAGERS,
                cluster_inbound::ALERTMANAGER_PORT,
                ALERTMANAGERS,
            ));
            let hosts = (0..self.inventory.alert_routers.len())
                .map(|i| VirtualHost {
                    name: format!("alertmanager{i}"),
                    domains: vec![self.alert_router_domain(i)],
                    routes: vec![Route::new("/", ALERTMANAGERS)],
                })
                .collect();
            graph.routes.push(RouteConfig::new(ALERTMANAGERS, hosts));
            graph.secrets.push(self.certificate(CLIENT_SECRET));
        }

        graph
    }

    fn alert_router_domain(&self, index: usize) -> String {
        format!(
            "alertmanager{index}.{}.svc.cluster.local*",
            self.settings.namespace
        )
    }

    fn certificate(&self, name: &str) -> Secret {
        let pair = if name == CLIENT_SECRET {
            &self.tls.client
        } else {
            &self.tls.server
        };
        Secret::certificate(name, &pair.certificate, &pair.private_key)
    }
}

/// Downstream proxies cannot reach a hub that only listens on loopback, so
/// alert forwarding is not configured for such hubs.
fn is_loopback(address: &str) -> bool {
    if address.eq_ignore_ascii_case("localhost") {
        return true;
    }
    address
        .parse::<IpAddr>()
        .map(|ip| ip.is_loopback())
        .unwrap_or(false)
}
