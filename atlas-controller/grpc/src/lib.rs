#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Serves versioned proxy configuration snapshots over the Envoy v3
//! discovery protocols.

pub mod cache;
pub mod metrics;
mod resource;
pub mod server;
pub mod version;
mod xds;

pub use self::{
    cache::{NamedResource, PublishReport, Snapshot, SnapshotCache},
    metrics::DiscoveryMetrics,
    resource::ResourceType,
    server::DiscoveryServer,
    version::{InvalidNodeId, VersionGenerator, MAX_NODE_ID},
};
