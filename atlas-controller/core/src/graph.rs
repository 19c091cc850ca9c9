//! The configuration of a single proxy, independent of the xDS wire types.

use std::collections::HashSet;

/// Name of the secret holding the concatenated trust bundle. Every TLS
/// context that verifies its peer references it implicitly.
pub const VALIDATION_SECRET: &str = "validation";
pub const SERVER_SECRET: &str = "server";
pub const CLIENT_SECRET: &str = "client";

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConfigGraph {
    pub clusters: Vec<Cluster>,
    pub routes: Vec<RouteConfig>,
    pub listeners: Vec<Listener>,
    pub secrets: Vec<Secret>,
}

/// A backend cluster with a single static endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cluster {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub http2: bool,
    /// When set, the proxy originates mTLS presenting this certificate and
    /// verifies the peer against the validation bundle.
    pub tls: Option<UpstreamTls>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpstreamTls {
    pub certificate: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteConfig {
    pub name: String,
    pub virtual_hosts: Vec<VirtualHost>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VirtualHost {
    pub name: String,
    pub domains: Vec<String>,
    pub routes: Vec<Route>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Route {
    pub prefix: String,
    pub cluster: String,
    pub host_rewrite: Option<String>,
    pub prefix_rewrite: Option<String>,
}

/// An HTTP listener bound to all addresses.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Listener {
    pub name: String,
    pub port: u16,
    pub route: String,
    pub tls: Option<DownstreamTls>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DownstreamTls {
    pub certificate: String,
    /// Requires a client certificate signed by the validation bundle.
    pub require_client_certificate: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Secret {
    pub name: String,
    pub kind: SecretKind,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SecretKind {
    Certificate {
        certificate_chain: String,
        private_key: String,
    },
    Validation {
        trusted_ca: String,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("duplicate {kind} name {name:?}")]
    Duplicate { kind: &'static str, name: String },

    #[error("route {route:?} references undefined cluster {cluster:?}")]
    UndefinedCluster { route: String, cluster: String },

    #[error("listener {listener:?} references undefined route {route:?}")]
    UndefinedRoute { listener: String, route: String },

    #[error("{owner:?} references undefined secret {secret:?}")]
    UndefinedSecret { owner: String, secret: String },
}

// === impl ConfigGraph ===

impl ConfigGraph {
    /// Checks that every reference in the graph resolves and that names are
    /// unique per resource kind. Returns the first violation found.
    pub fn validate(&self) -> Result<(), GraphError> {
        let clusters = unique("cluster", self.clusters.iter().map(|c| c.name.as_str()))?;
        let routes = unique("route", self.routes.iter().map(|r| r.name.as_str()))?;
        unique("listener", self.listeners.iter().map(|l| l.name.as_str()))?;
        let secrets = unique("secret", self.secrets.iter().map(|s| s.name.as_str()))?;

        for config in &self.routes {
            for route in config.virtual_hosts.iter().flat_map(|vh| vh.routes.iter()) {
                if !clusters.contains(route.cluster.as_str()) {
                    return Err(GraphError::UndefinedCluster {
                        route: config.name.clone(),
                        cluster: route.cluster.clone(),
                    });
                }
            }
        }

        let require_secret = |owner: &str, secret: &str| {
            if secrets.contains(secret) {
                return Ok(());
            }
            Err(GraphError::UndefinedSecret {
                owner: owner.to_string(),
                secret: secret.to_string(),
            })
        };

        for listener in &self.listeners {
            if !routes.contains(listener.route.as_str()) {
                return Err(GraphError::UndefinedRoute {
                    listener: listener.name.clone(),
                    route: listener.route.clone(),
                });
            }
            if let Some(tls) = &listener.tls {
                require_secret(&listener.name, &tls.certificate)?;
                if tls.require_client_certificate {
                    require_secret(&listener.name, VALIDATION_SECRET)?;
                }
            }
        }

        for cluster in &self.clusters {
            if let Some(tls) = &cluster.tls {
                require_secret(&cluster.name, &tls.certificate)?;
                require_secret(&cluster.name, VALIDATION_SECRET)?;
            }
        }

        Ok(())
    }

    pub fn cluster(&self, name: &str) -> Option<&Cluster> {
        self.clusters.iter().find(|c| c.name == name)
    }

    pub fn route(&self, name: &str) -> Option<&RouteConfig> {
        self.routes.iter().find(|r| r.name == name)
    }

    pub fn listener(&self, name: &str) -> Option<&Listener> {
        self.listeners.iter().find(|l| l.name == name)
    }

    pub fn secret(&self, name: &str) -> Option<&Secret> {
        self.secrets.iter().find(|s| s.name == name)
    }
}

fn unique<'a>(
    kind: &'static str,
    names: impl Iterator<Item = &'a str>,
) -> Result<HashSet<&'a str>, GraphError> {
    let mut seen = HashSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(GraphError::Duplicate {
                kind,
                name: name.to_string(),
            });
        }
    }
    Ok(seen)
}

// === impl Cluster ===

impl Cluster {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            http2: false,
            tls: None,
        }
    }

    pub fn http2(mut self) -> Self {
        self.http2 = true;
        self
    }

    pub fn with_mtls(mut self, certificate: impl Into<String>) -> Self {
        self.tls = Some(UpstreamTls {
            certificate: certificate.into(),
        });
        self
    }
}

// === impl RouteConfig ===

impl RouteConfig {
    pub fn new(name: impl Into<String>, virtual_hosts: Vec<VirtualHost>) -> Self {
        Self {
            name: name.into(),
            virtual_hosts,
        }
    }

    pub fn virtual_host(&self, name: &str) -> Option<&VirtualHost> {
        self.virtual_hosts.iter().find(|vh| vh.name == name)
    }
}

// === impl VirtualHost ===

impl VirtualHost {
    /// A virtual host matching any domain and forwarding everything to
    /// `cluster`.
    pub fn catch_all(name: impl Into<String>, cluster: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            domains: vec!["*".to_string()],
            routes: vec![Route::new("/", cluster)],
        }
    }
}

// === impl Route ===

impl Route {
    pub fn new(prefix: impl Into<String>, cluster: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            cluster: cluster.into(),
            host_rewrite: None,
            prefix_rewrite: None,
        }
    }

    pub fn rewrite_host(mut self, host: impl Into<String>) -> Self {
        self.host_rewrite = Some(host.into());
        self
    }

    pub fn rewrite_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix_rewrite = Some(prefix.into());
        self
    }
}

// === impl Listener ===

impl Listener {
    pub fn plain(name: impl Into<String>, port: u16, route: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            port,
            route: route.into(),
            tls: None,
        }
    }

    pub fn tls(
        name: impl Into<String>,
        port: u16,
        route: impl Into<String>,
        certificate: impl Into<String>,
    ) -> Self {
        Self {
            tls: Some(DownstreamTls {
                certificate: certificate.into(),
                require_client_certificate: false,
            }),
            ..Self::plain(name, port, route)
        }
    }

    pub fn mtls(
        name: impl Into<String>,
        port: u16,
        route: impl Into<String>,
        certificate: impl Into<String>,
    ) -> Self {
        Self {
            tls: Some(DownstreamTls {
                certificate: certificate.into(),
                require_client_certificate: true,
            }),
            ..Self::plain(name, port, route)
        }
    }
}

// === impl Secret ===

impl Secret {
    pub fn certificate(
        name: impl Into<String>,
        certificate_chain: impl Into<String>,
        private_key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: SecretKind::Certificate {
                certificate_chain: certificate_chain.into(),
                private_key: private_key.into(),
            },
        }
    }

    pub fn validation(trusted_ca: impl Into<String>) -> Self {
        Self {
            name: VALIDATION_SECRET.to_string(),
            kind: SecretKind::Validation {
                trusted_ca: trusted_ca.into(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> ConfigGraph {
        ConfigGraph {
            clusters: vec![Cluster::new("backend", "backend.svc", 8080).with_mtls(CLIENT_SECRET)],
            routes: vec![RouteConfig::new(
                "ingress",
                vec![VirtualHost::catch_all("all", "backend")],
            )],
            listeners: vec![Listener::mtls("ingress", 8443, "ingress", SERVER_SECRET)],
            secrets: vec![
                Secret::validation("ca"),
                Secret::certificate(SERVER_SECRET, "cert", "key"),
                Secret::certificate(CLIENT_SECRET, "cert", "key"),
            ],
        }
    }

    #[test]
    fn accepts_consistent_graph() {
        assert_eq!(valid().validate(), Ok(()));
        assert_eq!(ConfigGraph::default().validate(), Ok(()));
    }

    #[test]
    fn rejects_dangling_route_cluster() {
        let mut graph = valid();
        graph.clusters.clear();
        assert_eq!(
            graph.validate(),
            Err(GraphError::UndefinedCluster {
                route: "ingress".to_string(),
                cluster: "backend".to_string(),
            })
        );
    }

    #[test]
    fn rejects_dangling_listener_route() {
        let mut graph = valid();
        graph.listeners[0].route = "missing".to_string();
        assert_eq!(
            graph.validate(),
            Err(GraphError::UndefinedRoute {
                listener: "ingress".to_string(),
                route: "missing".to_string(),
            })
        );
    }

    #[test]
    fn rejects_dangling_listener_secret() {
        let mut graph = valid();
        graph.secrets.retain(|s| s.name != SERVER_SECRET);
        assert_eq!(
            graph.validate(),
            Err(GraphError::UndefinedSecret {
                owner: "ingress".to_string(),
                secret: SERVER_SECRET.to_string(),
            })
        );
    }

    #[test]
    fn peer_verification_requires_validation_bundle() {
        let mut graph = valid();
        graph.secrets.retain(|s| s.name != VALIDATION_SECRET);
        assert_eq!(
            graph.validate(),
            Err(GraphError::UndefinedSecret {
                owner: "ingress".to_string(),
                secret: VALIDATION_SECRET.to_string(),
            })
        );

        // A listener that does not verify clients only needs its own
        // certificate.
        graph.listeners[0].tls = Some(DownstreamTls {
            certificate: SERVER_SECRET.to_string(),
            require_client_certificate: false,
        });
        graph.clusters[0].tls = None;
        assert_eq!(graph.validate(), Ok(()));
    }

    #[test]
    fn rejects_dangling_cluster_secret() {
        let mut graph = valid();
        graph.secrets.retain(|s| s.name != CLIENT_SECRET);
        assert_eq!(
            graph.validate(),
            Err(GraphError::UndefinedSecret {
                owner: "backend".to_string(),
                secret: CLIENT_SECRET.to_string(),
            })
        );
    }

    #[test]
    fn rejects_duplicate_names() {
        let mut graph = valid();
        graph
            .clusters
            .push(Cluster::new("backend", "other.svc", 8080));
        assert_eq!(
            graph.validate(),
            Err(GraphError::Duplicate {
                kind: "cluster",
                name: "backend".to_string(),
            })
        );

        // The same name may be reused across kinds.
        let mut graph = valid();
        graph.clusters[0].name = "ingress".to_string();
        graph.routes[0].virtual_hosts[0].routes[0].cluster = "ingress".to_string();
        assert_eq!(graph.validate(), Ok(()));
    }
}
