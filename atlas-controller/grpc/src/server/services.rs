use super::{BoxStream, DiscoveryServer};
use crate::ResourceType;
use envoy_types::pb::envoy::service::{
    cluster::v3::cluster_discovery_service_server::{
        ClusterDiscoveryService, ClusterDiscoveryServiceServer,
    },
    discovery::v3::{
        aggregated_discovery_service_server::{
            AggregatedDiscoveryService, AggregatedDiscoveryServiceServer,
        },
        DeltaDiscoveryRequest, DeltaDiscoveryResponse, DiscoveryRequest, DiscoveryResponse,
    },
    endpoint::v3::endpoint_discovery_service_server::{
        EndpointDiscoveryService, EndpointDiscoveryServiceServer,
    },
    listener::v3::listener_discovery_service_server::{
        ListenerDiscoveryService, ListenerDiscoveryServiceServer,
    },
    route::v3::route_discovery_service_server::{
        RouteDiscoveryService, RouteDiscoveryServiceServer,
    },
    runtime::v3::runtime_discovery_service_server::{
        RuntimeDiscoveryService, RuntimeDiscoveryServiceServer,
    },
    secret::v3::secret_discovery_service_server::{
        SecretDiscoveryService, SecretDiscoveryServiceServer,
    },
};

type Requests<T> = tonic::Request<tonic::Streaming<T>>;
type Responses<T> = Result<tonic::Response<BoxStream<T>>, tonic::Status>;

const ADS: &str = "envoy.service.discovery.v3.AggregatedDiscoveryService";

// === impl DiscoveryServer ===

impl DiscoveryServer {
    pub fn aggregated(&self) -> AggregatedDiscoveryServiceServer<Self> {
        AggregatedDiscoveryServiceServer::new(self.clone())
    }

    pub fn listeners(&self) -> ListenerDiscoveryServiceServer<Self> {
        ListenerDiscoveryServiceServer::new(self.clone())
    }

    pub fn routes(&self) -> RouteDiscoveryServiceServer<Self> {
        RouteDiscoveryServiceServer::new(self.clone())
    }

    pub fn clusters(&self) -> ClusterDiscoveryServiceServer<Self> {
        ClusterDiscoveryServiceServer::new(self.clone())
    }

    pub fn endpoints(&self) -> EndpointDiscoveryServiceServer<Self> {
        EndpointDiscoveryServiceServer::new(self.clone())
    }

    pub fn secrets(&self) -> SecretDiscoveryServiceServer<Self> {
        SecretDiscoveryServiceServer::new(self.clone())
    }

    pub fn runtime(&self) -> RuntimeDiscoveryServiceServer<Self> {
        RuntimeDiscoveryServiceServer::new(self.clone())
    }
}

#[async_trait::async_trait]
impl AggregatedDiscoveryService for DiscoveryServer {
    type StreamAggregatedResourcesStream = BoxStream<DiscoveryResponse>;

    async fn stream_aggregated_resources(
        &self,
        req: Requests<DiscoveryRequest>,
    ) -> Responses<DiscoveryResponse> {
        let rpc = self
            .metrics
            .grpc()
            .bidi_stream_rpc(ADS, "StreamAggregatedResources");
        Ok(tonic::Response::new(self.sotw_stream(
            None,
            rpc,
            req.into_inner(),
        )))
    }

    type DeltaAggregatedResourcesStream = BoxStream<DeltaDiscoveryResponse>;

    async fn delta_aggregated_resources(
        &self,
        req: Requests<DeltaDiscoveryRequest>,
    ) -> Responses<DeltaDiscoveryResponse> {
        let rpc = self
            .metrics
            .grpc()
            .bidi_stream_rpc(ADS, "DeltaAggregatedResources");
        Ok(tonic::Response::new(self.delta_stream(
            None,
            rpc,
            req.into_inner(),
        )))
    }
}

/// Implements a single-type discovery service over the shared stream
/// handlers.
macro_rules! single_type_service {
    (
        $service:ident, $name:literal, $ty:expr,
        $stream_ty:ident, $stream:ident, $stream_method:literal,
        $delta_ty:ident, $delta:ident, $delta_method:literal,
        $fetch:ident, $fetch_method:literal $(,)?
    ) => {
        #[async_trait::async_trait]
        impl $service for DiscoveryServer {
            type $stream_ty = BoxStream<DiscoveryResponse>;

            async fn $stream(
                &self,
                req: Requests<DiscoveryRequest>,
            ) -> Responses<DiscoveryResponse> {
                let rpc = self.metrics.grpc().bidi_stream_rpc($name, $stream_method);
                Ok(tonic::Response::new(self.sotw_stream(
                    Some($ty),
                    rpc,
                    req.into_inner(),
                )))
            }

            type $delta_ty = BoxStream<DeltaDiscoveryResponse>;

            async fn $delta(
                &self,
                req: Requests<DeltaDiscoveryRequest>,
            ) -> Responses<DeltaDiscoveryResponse> {
                let rpc = self.metrics.grpc().bidi_stream_rpc($name, $delta_method);
                Ok(tonic::Response::new(self.delta_stream(
                    Some($ty),
                    rpc,
                    req.into_inner(),
                )))
            }

            async fn $fetch(
                &self,
                req: tonic::Request<DiscoveryRequest>,
            ) -> Result<tonic::Response<DiscoveryResponse>, tonic::Status> {
                let rpc = self.metrics.grpc().unary_rpc($name, $fetch_method);
                self.fetch($ty, rpc, req.into_inner())
            }
        }
    };
}

single_type_service!(
    ListenerDiscoveryService, "envoy.service.listener.v3.ListenerDiscoveryService", ResourceType::Listener,
    StreamListenersStream, stream_listeners, "StreamListeners",
    DeltaListenersStream, delta_listeners, "DeltaListeners",
    fetch_listeners, "FetchListeners",
);

single_type_service!(
    RouteDiscoveryService, "envoy.service.route.v3.RouteDiscoveryService", ResourceType::Route,
    StreamRoutesStream, stream_routes, "StreamRoutes",
    DeltaRoutesStream, delta_routes, "DeltaRoutes",
    fetch_routes, "FetchRoutes",
);

single_type_service!(
    ClusterDiscoveryService, "envoy.service.cluster.v3.ClusterDiscoveryService", ResourceType::Cluster,
    StreamClustersStream, stream_clusters, "StreamClusters",
    DeltaClustersStream, delta_clusters, "DeltaClusters",
    fetch_clusters, "FetchClusters",
);

single_type_service!(
    EndpointDiscoveryService, "envoy.service.endpoint.v3.EndpointDiscoveryService", ResourceType::Endpoint,
    StreamEndpointsStream, stream_endpoints, "StreamEndpoints",
    DeltaEndpointsStream, delta_endpoints, "DeltaEndpoints",
    fetch_endpoints, "FetchEndpoints",
);

single_type_service!(
    SecretDiscoveryService, "envoy.service.secret.v3.SecretDiscoveryService", ResourceType::Secret,
    StreamSecretsStream, stream_secrets, "StreamSecrets",
    DeltaSecretsStream, delta_secrets, "DeltaSecrets",
    fetch_secrets, "FetchSecrets",
);

single_type_service!(
    RuntimeDiscoveryService, "envoy.service.runtime.v3.RuntimeDiscoveryService", ResourceType::Runtime,
    StreamRuntimeStream, stream_runtime, "StreamRuntime",
    DeltaRuntimeStream, delta_runtime, "DeltaRuntime",
    fetch_runtime, "FetchRuntime",
);
