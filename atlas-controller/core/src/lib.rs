#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod cluster;
pub mod graph;
pub mod synth;

pub use self::{
    cluster::{AlertRouter, ClusterRecord, Inventory, PROMETHEUS_FQDN, THANOS_FQDN},
    graph::{ConfigGraph, GraphError},
    synth::{Settings, Synthesizer, TlsMaterial},
};

/// The snapshot key (and Envoy node id) of the hub proxy.
pub const HUB_NODE_ID: &str = "atlas";

pub const THANOS_PORT: u16 = 10901;
pub const PROMETHEUS_PORT: u16 = 9090;
pub const ALERTMANAGER_PORT: u16 = 9093;

/// Ports a downstream cluster's proxy listens on for hub traffic.
pub mod cluster_inbound {
    pub const THANOS_PORT: u16 = 11901;
    pub const ALERTMANAGER_PORT: u16 = 11903;
    pub const PROMETHEUS_PORT: u16 = 11904;
}

/// Ports the hub proxy listens on.
pub mod hub {
    pub const ADS_PORT: u16 = 10900;
    pub const THANOS_PORT: u16 = 10901;
    pub const ALERTMANAGER_PORT: u16 = 10903;
    pub const PROMETHEUS_PORT: u16 = 10904;
}
