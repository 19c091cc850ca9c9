//! Envoy v3 discovery over gRPC.
//!
//! Every service reads snapshots from the [`SnapshotCache`]; none of them
//! touch reconciliation state. Streams end when the server starts draining.

mod delta;
mod services;
mod sotw;


use self::{delta::DeltaState, sotw::Outcome, sotw::SotwState};
use crate::{
    cache::{Snapshot, SnapshotCache, SnapshotRx},
    metrics::{DiscoveryMetrics, GrpcServerRPCMetrics},
    ResourceType,
};
use envoy_types::pb::envoy::{
    config::core::v3::Node,
    service::discovery::v3::{
        DeltaDiscoveryRequest, DeltaDiscoveryResponse, DiscoveryRequest, DiscoveryResponse,
    },
};
use futures::prelude::*;
use std::{pin::Pin, sync::Arc};
use tracing::{debug, info};

#[derive(Clone)]
pub struct DiscoveryServer {
    cache: SnapshotCache,
    metrics: DiscoveryMetrics,
    drain: drain::Watch,
}

pub(crate) type BoxStream<T> = Pin<Box<dyn Stream<Item = Result<T, tonic::Status>> + Send>>;

/// The proxy a stream serves, identified by the first request's node id.
struct Session {
    cache: SnapshotCache,
    node: Option<(String, SnapshotRx)>,
}

// === impl DiscoveryServer ===

impl DiscoveryServer {
    pub fn new(cache: SnapshotCache, metrics: DiscoveryMetrics, drain: drain::Watch) -> Self {
        Self {
            cache,
            metrics,
            drain,
        }
    }

    pub(crate) fn sotw_stream<S>(
        &self,
        fixed: Option<ResourceType>,
        rpc: GrpcServerRPCMetrics,
        requests: S,
    ) -> BoxStream<DiscoveryResponse>
    where
        S: Stream<Item = Result<DiscoveryRequest, tonic::Status>> + Send + 'static,
    {
        let cache = self.cache.clone();
        let metrics = self.metrics.clone();
        let drain = self.drain.clone();

        Box::pin(async_stream::stream! {
            let _connected = metrics.connected();
            let observer = rpc.start();
            let mut session = Session::new(cache);
            let mut state = SotwState::new(fixed);
            let mut requests = Box::pin(requests);
            tokio::pin! {
                let shutdown = drain.signaled();
            }

            loop {
                tokio::select! {
                    req = requests.next() => {
                        let req = match req {
                            Some(Ok(req)) => req,
                            Some(Err(status)) => {
                                debug!(%status, "Discovery request stream failed");
                                observer.end(status.code());
                                return;
                            }
                            None => return,
                        };
                        observer.msg_received();

                        let ty = match state
                            .resource_type(&req.type_url)
                            .and_then(|ty| session.identify(req.node.as_ref()).map(|()| ty))
                        {
                            Ok(ty) => ty,
                            Err(status) => {
                                observer.end(status.code());
                                yield Err(status);
                                return;
                            }
                        };
                        metrics.request(ty);

                        let snapshot = session.current();
                        match state.on_request(ty, &req, snapshot.as_deref()) {
                            Outcome::Respond(rsp) => {
                                metrics.response(ty);
                                observer.msg_sent();
                                yield Ok(*rsp);
                            }
                            Outcome::Nack => metrics.nack(ty),
                            Outcome::Ack | Outcome::Stale | Outcome::Pending => {}
                        }
                    }

                    snapshot = session.changed() => {
                        if let Some(snapshot) = snapshot {
                            for rsp in state.on_snapshot(&snapshot) {
                                if let Some(ty) = ResourceType::from_type_url(&rsp.type_url) {
                                    metrics.response(ty);
                                }
                                observer.msg_sent();
                                yield Ok(rsp);
                            }
                        }
                    }

                    // If the server starts shutting down, close the stream so
                    // that it doesn't hold the server open.
                    _ = &mut shutdown => return,
                }
            }
        })
    }

    pub(crate) fn delta_stream<S>(
        &self,
        fixed: Option<ResourceType>,
        rpc: GrpcServerRPCMetrics,
        requests: S,
    ) -> BoxStream<DeltaDiscoveryResponse>
    where
        S: Stream<Item = Result<DeltaDiscoveryRequest, tonic::Status>> + Send + 'static,
    {
        let cache = self.cache.clone();
        let metrics = self.metrics.clone();
        let drain = self.drain.clone();

        Box::pin(async_stream::stream! {
            let _connected = metrics.connected();
            let observer = rpc.start();
            let mut session = Session::new(cache);
            let mut state = DeltaState::new(fixed);
            let mut requests = Box::pin(requests);
            tokio::pin! {
                let shutdown = drain.signaled();
            }

            loop {
                tokio::select! {
                    req = requests.next() => {
                        let req = match req {
                            Some(Ok(req)) => req,
                            Some(Err(status)) => {
                                debug!(%status, "Discovery request stream failed");
                                observer.end(status.code());
                                return;
                            }
                            None => return,
                        };
                        observer.msg_received();

                        let ty = match state
                            .resource_type(&req.type_url)
                            .and_then(|ty| session.identify(req.node.as_ref()).map(|()| ty))
                        {
                            Ok(ty) => ty,
                            Err(status) => {
                                observer.end(status.code());
                                yield Err(status);
                                return;
                            }
                        };
                        metrics.request(ty);
                        if req.error_detail.is_some() {
                            metrics.nack(ty);
                        }

                        let snapshot = session.current();
                        if let Some(rsp) = state.on_request(ty, &req, snapshot.as_deref()) {
                            metrics.response(ty);
                            observer.msg_sent();
                            yield Ok(rsp);
                        }
                    }

                    snapshot = session.changed() => {
                        if let Some(snapshot) = snapshot {
                            for rsp in state.on_snapshot(&snapshot) {
                                if let Some(ty) = ResourceType::from_type_url(&rsp.type_url) {
                                    metrics.response(ty);
                                }
                                observer.msg_sent();
                                yield Ok(rsp);
                            }
                        }
                    }

                    _ = &mut shutdown => return,
                }
            }
        })
    }

    pub(crate) fn fetch(
        &self,
        fixed: ResourceType,
        rpc: GrpcServerRPCMetrics,
        req: DiscoveryRequest,
    ) -> Result<tonic::Response<DiscoveryResponse>, tonic::Status> {
        let observer = rpc.start();
        observer.msg_received();
        match self.fetch_snapshot(fixed, &req) {
            Ok(rsp) => {
                observer.msg_sent();
                Ok(tonic::Response::new(rsp))
            }
            Err(status) => {
                observer.end(status.code());
                Err(status)
            }
        }
    }

    fn fetch_snapshot(
        &self,
        fixed: ResourceType,
        req: &DiscoveryRequest,
    ) -> Result<DiscoveryResponse, tonic::Status> {
        let ty = resource_type(Some(fixed), &req.type_url)?;
        let node = node_id(req.node.as_ref())
            .ok_or_else(|| tonic::Status::invalid_argument("request has no node id"))?;
        self.metrics.request(ty);
        let snapshot = self
            .cache
            .get(node)
            .ok_or_else(|| tonic::Status::not_found(format!("no snapshot for node {node}")))?;

        let names = req.resource_names.iter().cloned().collect();
        let resources = snapshot
            .select(ty, &names)
            .into_iter()
            .map(|r| r.resource.clone())
            .collect();
        self.metrics.response(ty);
        Ok(DiscoveryResponse {
            version_info: snapshot.version().to_string(),
            resources,
            type_url: ty.type_url().to_string(),
            ..Default::default()
        })
    }
}

// === impl Session ===

impl Session {
    fn new(cache: SnapshotCache) -> Self {
        Self { cache, node: None }
    }

    /// Binds the stream to the requesting node. Only the first request must
    /// carry the node; later ones may omit it but may not change it.
    fn identify(&mut self, node: Option<&Node>) -> Result<(), tonic::Status> {
        match (&self.node, node_id(node)) {
            (Some((key, _)), Some(id)) if key != id => Err(tonic::Status::invalid_argument(
                format!("node id changed from {key} to {id}"),
            )),
            (Some(_), _) => Ok(()),
            (None, Some(id)) => {
                info!(node = %id, "Proxy connected");
                self.node = Some((id.to_string(), self.cache.subscribe(id)));
                Ok(())
            }
            (None, None) => Err(tonic::Status::invalid_argument("request has no node id")),
        }
    }

    /// The node's snapshot. Reading it does not mark it seen, so a
    /// publication observed while handling a request still reaches every
    /// other watch through [`Session::changed`].
    fn current(&self) -> Option<Arc<Snapshot>> {
        self.node.as_ref().and_then(|(_, rx)| rx.borrow().clone())
    }

    /// Waits for the node's snapshot to change. Never resolves before the
    /// node is known. Resolves to `None` when the snapshot is withdrawn.
    async fn changed(&mut self) -> Option<Arc<Snapshot>> {
        let Some((_, rx)) = self.node.as_mut() else {
            return future::pending().await;
        };
        if rx.changed().await.is_err() {
            return future::pending().await;
        }
        let snapshot = rx.borrow_and_update().clone();
        snapshot
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some((node, rx)) = self.node.take() {
            drop(rx);
            self.cache.release(&node);
            info!(%node, "Proxy disconnected");
        }
    }
}

fn node_id(node: Option<&Node>) -> Option<&str> {
    node.map(|n| n.id.as_str()).filter(|id| !id.is_empty())
}

fn resource_type(
    fixed: Option<ResourceType>,
    type_url: &str,
) -> Result<ResourceType, tonic::Status> {
    match fixed {
        Some(ty) if type_url.is_empty() || type_url == ty.type_url() => Ok(ty),
        Some(ty) => Err(tonic::Status::invalid_argument(format!(
            "{type_url} is not served by the {ty} discovery service"
        ))),
        None => ResourceType::from_type_url(type_url).ok_or_else(|| {
            tonic::Status::invalid_argument(format!("unsupported resource type {type_url:?}"))
        }),
    }
}
