//! Conversion of configuration graphs into Envoy v3 resources.

use crate::ResourceType;
use atlas_controller_core::graph::{self, ConfigGraph, SecretKind, VALIDATION_SECRET};
use envoy_types::pb::{
    envoy::{
        config::{
            cluster::v3::{self as cluster, cluster::ClusterDiscoveryType},
            core::v3::{self as core, address, config_source, data_source, socket_address},
            endpoint::v3::{self as endpoint, lb_endpoint},
            listener::v3::{self as listener, filter},
            route::v3::{self as route, route_action, route_match},
        },
        extensions::{
            filters::{
                http::router::v3::Router,
                network::http_connection_manager::v3::{
                    self as hcm, http_connection_manager, http_filter,
                },
            },
            transport_sockets::tls::v3::{self as tls, common_tls_context, secret},
            upstreams::http::v3::{
                http_protocol_options::{
                    explicit_http_config::ProtocolConfig, ExplicitHttpConfig,
                    UpstreamProtocolOptions,
                },
                HttpProtocolOptions,
            },
        },
    },
    google::protobuf::{Any, BoolValue, Duration},
};
use prost::Message;
use std::collections::HashMap;

const TLS_TRANSPORT_SOCKET: &str = "envoy.transport_sockets.tls";
const HTTP_CONNECTION_MANAGER: &str = "envoy.filters.network.http_connection_manager";
const ROUTER: &str = "envoy.filters.http.router";
const HTTP_PROTOCOL_OPTIONS: &str = "envoy.extensions.upstreams.http.v3.HttpProtocolOptions";

const UPSTREAM_TLS_URL: &str =
    "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.UpstreamTlsContext";
const DOWNSTREAM_TLS_URL: &str =
    "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.DownstreamTlsContext";
const HCM_URL: &str = "type.googleapis.com/envoy.extensions.filters.network.http_connection_manager.v3.HttpConnectionManager";
const ROUTER_URL: &str = "type.googleapis.com/envoy.extensions.filters.http.router.v3.Router";
const HTTP_PROTOCOL_OPTIONS_URL: &str =
    "type.googleapis.com/envoy.extensions.upstreams.http.v3.HttpProtocolOptions";

const CONNECT_TIMEOUT_SECS: i64 = 5;
const ALPN: [&str; 2] = ["h2", "http/1.1"];

/// Encodes every resource of the graph, tagged with its type and name.
pub(crate) fn encode(graph: &ConfigGraph) -> Vec<(ResourceType, String, Any)> {
    let clusters = graph.clusters.iter().map(|c| {
        let any = pack(ResourceType::Cluster.type_url(), &to_cluster(c));
        (ResourceType::Cluster, c.name.clone(), any)
    });
    let routes = graph.routes.iter().map(|r| {
        let any = pack(ResourceType::Route.type_url(), &to_route_config(r));
        (ResourceType::Route, r.name.clone(), any)
    });
    let listeners = graph.listeners.iter().map(|l| {
        let any = pack(ResourceType::Listener.type_url(), &to_listener(l));
        (ResourceType::Listener, l.name.clone(), any)
    });
    let secrets = graph.secrets.iter().map(|s| {
        let any = pack(ResourceType::Secret.type_url(), &to_secret(s));
        (ResourceType::Secret, s.name.clone(), any)
    });
    clusters.chain(routes).chain(listeners).chain(secrets).collect()
}

fn pack(type_url: &str, msg: &impl Message) -> Any {
    Any {
        type_url: type_url.to_string(),
        value: msg.encode_to_vec(),
    }
}

fn to_cluster(c: &graph::Cluster) -> cluster::Cluster {
    let mut protocol_options = HashMap::new();
    if c.http2 {
        let options = HttpProtocolOptions {
            upstream_protocol_options: Some(UpstreamProtocolOptions::ExplicitHttpConfig(
                ExplicitHttpConfig {
                    protocol_config: Some(ProtocolConfig::Http2ProtocolOptions(
                        core::Http2ProtocolOptions::default(),
                    )),
                },
            )),
            ..Default::default()
        };
        protocol_options.insert(
            HTTP_PROTOCOL_OPTIONS.to_string(),
            pack(HTTP_PROTOCOL_OPTIONS_URL, &options),
        );
    }

    let transport_socket = c.tls.as_ref().map(|tls| {
        let context = tls::UpstreamTlsContext {
            common_tls_context: Some(common_tls(&tls.certificate, true)),
            ..Default::default()
        };
        transport_socket(pack(UPSTREAM_TLS_URL, &context))
    });

    cluster::Cluster {
        name: c.name.clone(),
        connect_timeout: Some(Duration {
            seconds: CONNECT_TIMEOUT_SECS,
            nanos: 0,
        }),
        cluster_discovery_type: Some(ClusterDiscoveryType::Type(
            cluster::cluster::DiscoveryType::LogicalDns as i32,
        )),
        lb_policy: cluster::cluster::LbPolicy::RoundRobin as i32,
        dns_lookup_family: cluster::cluster::DnsLookupFamily::V4Only as i32,
        load_assignment: Some(endpoint::ClusterLoadAssignment {
            cluster_name: c.name.clone(),
            endpoints: vec![endpoint::LocalityLbEndpoints {
                lb_endpoints: vec![endpoint::LbEndpoint {
                    host_identifier: Some(lb_endpoint::HostIdentifier::Endpoint(
                        endpoint::Endpoint {
                            address: Some(socket(&c.host, c.port)),
                            ..Default::default()
                        },
                    )),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        }),
        transport_socket,
        typed_extension_protocol_options: protocol_options,
        ..Default::default()
    }
}

fn to_route_config(r: &graph::RouteConfig) -> route::RouteConfiguration {
    route::RouteConfiguration {
        name: r.name.clone(),
        virtual_hosts: r
            .virtual_hosts
            .iter()
            .map(|vh| route::VirtualHost {
                name: vh.name.clone(),
                domains: vh.domains.clone(),
                routes: vh.routes.iter().map(to_route).collect(),
                ..Default::default()
            })
            .collect(),
        ..Default::default()
    }
}

fn to_route(r: &graph::Route) -> route::Route {
    let action = route::RouteAction {
        cluster_specifier: Some(route_action::ClusterSpecifier::Cluster(r.cluster.clone())),
        host_rewrite_specifier: r
            .host_rewrite
            .clone()
            .map(route_action::HostRewriteSpecifier::HostRewriteLiteral),
        prefix_rewrite: r.prefix_rewrite.clone().unwrap_or_default(),
        ..Default::default()
    };
    route::Route {
        r#match: Some(route::RouteMatch {
            path_specifier: Some(route_match::PathSpecifier::Prefix(r.prefix.clone())),
            ..Default::default()
        }),
        action: Some(route::route::Action::Route(action)),
        ..Default::default()
    }
}

fn to_listener(l: &graph::Listener) -> listener::Listener {
    let manager = hcm::HttpConnectionManager {
        codec_type: http_connection_manager::CodecType::Auto as i32,
        stat_prefix: "http".to_string(),
        route_specifier: Some(http_connection_manager::RouteSpecifier::Rds(hcm::Rds {
            config_source: Some(ads()),
            route_config_name: l.route.clone(),
        })),
        http_filters: vec![hcm::HttpFilter {
            name: ROUTER.to_string(),
            config_type: Some(http_filter::ConfigType::TypedConfig(pack(
                ROUTER_URL,
                &Router::default(),
            ))),
            ..Default::default()
        }],
        ..Default::default()
    };

    let transport_socket = l.tls.as_ref().map(|tls| {
        let context = tls::DownstreamTlsContext {
            common_tls_context: Some(common_tls(
                &tls.certificate,
                tls.require_client_certificate,
            )),
            require_client_certificate: Some(BoolValue {
                value: tls.require_client_certificate,
            }),
            ..Default::default()
        };
        transport_socket(pack(DOWNSTREAM_TLS_URL, &context))
    });

    listener::Listener {
        name: l.name.clone(),
        address: Some(socket("0.0.0.0", l.port)),
        filter_chains: vec![listener::FilterChain {
            filters: vec![listener::Filter {
                name: HTTP_CONNECTION_MANAGER.to_string(),
                config_type: Some(filter::ConfigType::TypedConfig(pack(HCM_URL, &manager))),
            }],
            transport_socket,
            ..Default::default()
        }],
        ..Default::default()
    }
}

fn to_secret(s: &graph::Secret) -> tls::Secret {
    let kind = match &s.kind {
        SecretKind::Certificate {
            certificate_chain,
            private_key,
        } => secret::Type::TlsCertificate(tls::TlsCertificate {
            certificate_chain: Some(inline(certificate_chain)),
            private_key: Some(inline(private_key)),
            ..Default::default()
        }),
        SecretKind::Validation { trusted_ca } => {
            secret::Type::ValidationContext(tls::CertificateValidationContext {
                trusted_ca: Some(inline(trusted_ca)),
                ..Default::default()
            })
        }
    };
    tls::Secret {
        name: s.name.clone(),
        r#type: Some(kind),
    }
}

/// A TLS context presenting `certificate`, verifying peers against the
/// validation bundle when `verify_peer` is set.
fn common_tls(certificate: &str, verify_peer: bool) -> tls::CommonTlsContext {
    tls::CommonTlsContext {
        alpn_protocols: ALPN.iter().map(|p| p.to_string()).collect(),
        tls_certificate_sds_secret_configs: vec![sds(certificate)],
        validation_context_type: verify_peer.then(|| {
            common_tls_context::ValidationContextType::ValidationContextSdsSecretConfig(sds(
                VALIDATION_SECRET,
            ))
        }),
        ..Default::default()
    }
}

fn sds(name: &str) -> tls::SdsSecretConfig {
    tls::SdsSecretConfig {
        name: name.to_string(),
        sds_config: Some(ads()),
    }
}

fn ads() -> core::ConfigSource {
    core::ConfigSource {
        config_source_specifier: Some(config_source::ConfigSourceSpecifier::Ads(
            core::AggregatedConfigSource {},
        )),
        resource_api_version: core::ApiVersion::V3 as i32,
        ..Default::default()
    }
}

fn transport_socket(config: Any) -> core::TransportSocket {
    core::TransportSocket {
        name: TLS_TRANSPORT_SOCKET.to_string(),
        config_type: Some(core::transport_socket::ConfigType::TypedConfig(config)),
    }
}

fn socket(host: &str, port: u16) -> core::Address {
    core::Address {
        address: Some(address::Address::SocketAddress(core::SocketAddress {
            protocol: core::socket_address::Protocol::Tcp as i32,
            address: host.to_string(),
            port_specifier: Some(socket_address::PortSpecifier::PortValue(u32::from(port))),
            ..Default::default()
        })),
    }
}

fn inline(value: &str) -> core::DataSource {
    core::DataSource {
        specifier: Some(data_source::Specifier::InlineString(value.to_string())),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atlas_controller_core::graph::{Cluster, Listener, RouteConfig, Secret, VirtualHost};

    fn graph() -> ConfigGraph {
        ConfigGraph {
            clusters: vec![
                Cluster::new("east-thanos", "192.0.2.10", 11901)
                    .http2()
                    .with_mtls("client"),
                Cluster::new("prometheus", "prometheus-operated", 9090),
            ],
            routes: vec![RouteConfig::new(
                "downstream_thanos",
                vec![VirtualHost::catch_all("backend", "east-thanos")],
            )],
            listeners: vec![Listener::mtls("thanos_sidecar", 11901, "downstream_thanos", "server")],
            secrets: vec![
                Secret::validation("-----BEGIN CERTIFICATE-----"),
                Secret::certificate("server", "cert", "key"),
                Secret::certificate("client", "cert", "key"),
            ],
        }
    }

    fn decode<M: Message + Default>(resources: &[(ResourceType, String, Any)], name: &str) -> M {
        let (_, _, any) = resources
            .iter()
            .find(|(_, n, _)| n == name)
            .expect("resource must exist");
        M::decode(any.value.as_slice()).expect("resource must decode")
    }

    #[test]
    fn clusters_are_logical_dns_with_one_endpoint() {
        let resources = encode(&graph());
        let c: cluster::Cluster = decode(&resources, "east-thanos");
        assert_eq!(c.connect_timeout.map(|d| d.seconds), Some(5));
        assert_eq!(
            c.cluster_discovery_type,
            Some(ClusterDiscoveryType::Type(
                cluster::cluster::DiscoveryType::LogicalDns as i32
            ))
        );
        assert!(c
            .typed_extension_protocol_options
            .contains_key(HTTP_PROTOCOL_OPTIONS));
        let socket = c.transport_socket.expect("cluster must originate TLS");
        assert_eq!(socket.name, TLS_TRANSPORT_SOCKET);

        let plain: cluster::Cluster = decode(&resources, "prometheus");
        assert!(plain.transport_socket.is_none());
        assert!(plain.typed_extension_protocol_options.is_empty());
        let endpoints = plain.load_assignment.expect("must have endpoints").endpoints;
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].lb_endpoints.len(), 1);
    }

    #[test]
    fn listeners_discover_routes_over_ads() {
        let resources = encode(&graph());
        let l: listener::Listener = decode(&resources, "thanos_sidecar");
        let chain = &l.filter_chains[0];
        let Some(filter::ConfigType::TypedConfig(any)) = &chain.filters[0].config_type else {
            panic!("filter must carry a typed config");
        };
        assert_eq!(any.type_url, HCM_URL);
        let manager =
            hcm::HttpConnectionManager::decode(any.value.as_slice()).expect("must decode");
        let Some(http_connection_manager::RouteSpecifier::Rds(rds)) = manager.route_specifier
        else {
            panic!("listener must use RDS");
        };
        assert_eq!(rds.route_config_name, "downstream_thanos");

        let Some(core::transport_socket::ConfigType::TypedConfig(any)) = chain
            .transport_socket
            .as_ref()
            .and_then(|s| s.config_type.clone())
        else {
            panic!("listener must terminate TLS");
        };
        let context =
            tls::DownstreamTlsContext::decode(any.value.as_slice()).expect("must decode");
        assert_eq!(
            context.require_client_certificate.map(|b| b.value),
            Some(true)
        );
    }

    #[test]
    fn secrets_are_inline() {
        let resources = encode(&graph());
        let s: tls::Secret = decode(&resources, VALIDATION_SECRET);
        let Some(secret::Type::ValidationContext(context)) = s.r#type else {
            panic!("validation secret must be a validation context");
        };
        assert_eq!(
            context.trusted_ca.and_then(|d| d.specifier),
            Some(data_source::Specifier::InlineString(
                "-----BEGIN CERTIFICATE-----".to_string()
            ))
        );
    }
}
