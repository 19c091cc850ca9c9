use crate::{cache::PublishReport, ResourceType};
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge, histogram::Histogram},
    registry::{Registry, Unit},
};
use tokio::time;

/// Discovery-server metrics: connected proxies, per-type request and
/// response counts, snapshot publication outcomes, and per-RPC gRPC metrics.
#[derive(Clone, Debug)]
pub struct DiscoveryMetrics {
    grpc: GrpcServerMetricsFamily,
    connected: Gauge,
    requests: Family<TypeLabels, Counter>,
    responses: Family<TypeLabels, Counter>,
    rejected_by_proxy: Family<TypeLabels, Counter>,
    published: Counter,
    rejected: Counter,
}

#[derive(Clone, Debug)]
pub struct GrpcServerMetricsFamily {
    started: Family<Labels, Counter>,
    handling: Family<Labels, Histogram>,
    handled: Family<CodeLabels, Counter>,
    msg_received: Family<Labels, Counter>,
    msg_sent: Family<Labels, Counter>,
}

#[derive(Clone, Debug)]
pub(crate) struct GrpcServerRPCMetrics {
    started: Counter,
    msg_received: Counter,
    msg_sent: Counter,
    handling: Histogram,
    handled: Family<CodeLabels, Counter>,
    labels: Labels,
}

pub(crate) struct ResponseObserver {
    msg_received: Counter,
    msg_sent: Counter,
    handled: Option<ResponseHandle>,
}

/// Counts a connected stream for as long as it is held.
pub(crate) struct Connected(Gauge);

struct ResponseHandle {
    start: time::Instant,
    durations: Histogram,
    codes: Family<CodeLabels, Counter>,
    labels: Labels,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct TypeLabels {
    resource_type: &'static str,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct Labels {
    grpc_service: &'static str,
    grpc_method: &'static str,
    grpc_type: &'static str,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct CodeLabels {
    grpc_service: &'static str,
    grpc_method: &'static str,
    grpc_type: &'static str,
    grpc_code: &'static str,
}

// === DiscoveryMetrics ===

impl DiscoveryMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let connected = Gauge::default();
        reg.register(
            "connected_proxies",
            "Number of open discovery streams",
            connected.clone(),
        );

        let requests = Family::<TypeLabels, Counter>::default();
        reg.register(
            "requests",
            "Total number of discovery requests received",
            requests.clone(),
        );

        let responses = Family::<TypeLabels, Counter>::default();
        reg.register(
            "responses",
            "Total number of discovery responses sent",
            responses.clone(),
        );

        let rejected_by_proxy = Family::<TypeLabels, Counter>::default();
        reg.register(
            "nacks",
            "Total number of responses proxies rejected",
            rejected_by_proxy.clone(),
        );

        let published = Counter::default();
        reg.register(
            "snapshots_published",
            "Total number of snapshots published",
            published.clone(),
        );

        let rejected = Counter::default();
        reg.register(
            "snapshots_rejected",
            "Total number of snapshots that failed validation",
            rejected.clone(),
        );

        let grpc = GrpcServerMetricsFamily::register(reg.sub_registry_with_prefix("grpc_server"));

        Self {
            grpc,
            connected,
            requests,
            responses,
            rejected_by_proxy,
            published,
            rejected,
        }
    }

    pub fn record_publish(&self, report: &PublishReport) {
        self.published.inc_by(report.published.len() as u64);
        self.rejected.inc_by(report.rejected.len() as u64);
    }

    pub(crate) fn connected(&self) -> Connected {
        self.connected.inc();
        Connected(self.connected.clone())
    }

    pub(crate) fn request(&self, ty: ResourceType) {
        self.requests.get_or_create(&TypeLabels::from(ty)).inc();
    }

    pub(crate) fn response(&self, ty: ResourceType) {
        self.responses.get_or_create(&TypeLabels::from(ty)).inc();
    }

    pub(crate) fn nack(&self, ty: ResourceType) {
        self.rejected_by_proxy
            .get_or_create(&TypeLabels::from(ty))
            .inc();
    }

    pub(crate) fn grpc(&self) -> &GrpcServerMetricsFamily {
        &self.grpc
    }
}

impl From<ResourceType> for TypeLabels {
    fn from(ty: ResourceType) -> Self {
        let resource_type = match ty {
            ResourceType::Listener => "listener",
            ResourceType::Route => "route",
            ResourceType::Cluster => "cluster",
            ResourceType::Endpoint => "endpoint",
            ResourceType::Secret => "secret",
            ResourceType::Runtime => "runtime",
        };
        Self { resource_type }
    }
}

// === impl Connected ===

impl Drop for Connected {
    fn drop(&mut self) {
        self.0.dec();
    }
}

// === GrpcServerMetricsFamily ===

impl GrpcServerMetricsFamily {
    pub fn register(reg: &mut Registry) -> Self {
        let started = Family::<Labels, Counter>::default();
        reg.register(
            "started",
            "Total number of RPCs started on the server",
            started.clone(),
        );

        let msg_received = Family::<Labels, Counter>::default();
        reg.register(
            "msg_received",
            "Total number of RPC stream messages received on the server",
            msg_received.clone(),
        );

        let msg_sent = Family::<Labels, Counter>::default();
        reg.register(
            "msg_sent",
            "Total number of gRPC stream messages sent by the server",
            msg_sent.clone(),
        );

        let handled = Family::<CodeLabels, Counter>::default();
        reg.register(
            "handled",
            "Total number of RPCs completed on the server, regardless of success or failure",
            handled.clone(),
        );

        let handling = Family::<Labels, Histogram>::new_with_constructor(|| {
            // Proxies hold discovery streams open for their whole lifetime.
            Histogram::new([0.1, 1.0, 300.0, 3600.0])
        });
        reg.register_with_unit(
            "handling",
            "Histogram of response latency (seconds) of gRPC that had been application-level handled by the server",
            Unit::Seconds,
            handling.clone(),
        );

        Self {
            started,
            msg_received,
            msg_sent,
            handled,
            handling,
        }
    }

    pub(crate) fn unary_rpc(
        &self,
        svc: &'static str,
        method: &'static str,
    ) -> GrpcServerRPCMetrics {
        self.rpc(svc, method, "unary")
    }

    pub(crate) fn bidi_stream_rpc(
        &self,
        svc: &'static str,
        method: &'static str,
    ) -> GrpcServerRPCMetrics {
        self.rpc(svc, method, "bidi_stream")
    }

    fn rpc(
        &self,
        grpc_service: &'static str,
        grpc_method: &'static str,
        grpc_type: &'static str,
    ) -> GrpcServerRPCMetrics {
        let labels = Labels {
            grpc_service,
            grpc_method,
            grpc_type,
        };
        GrpcServerRPCMetrics {
            started: self.started.get_or_create(&labels).clone(),
            msg_received: self.msg_received.get_or_create(&labels).clone(),
            msg_sent: self.msg_sent.get_or_create(&labels).clone(),
            handled: self.handled.clone(),
            handling: self.handling.get_or_create(&labels).clone(),
            labels,
        }
    }
}

// === GrpcServerRPCMetrics ===

impl GrpcServerRPCMetrics {
    pub(crate) fn start(&self) -> ResponseObserver {
        self.started.inc();

        let handled = {
            // Pre-register OK
            let _ = self.handled.get_or_create(&CodeLabels {
                grpc_service: self.labels.grpc_service,
                grpc_method: self.labels.grpc_method,
                grpc_type: self.labels.grpc_type,
                grpc_code: code_str(tonic::Code::Ok),
            });

            Some(ResponseHandle {
                start: time::Instant::now(),
                durations: self.handling.clone(),
                codes: self.handled.clone(),
                labels: self.labels.clone(),
            })
        };

        ResponseObserver {
            msg_received: self.msg_received.clone(),
            msg_sent: self.msg_sent.clone(),
            handled,
        }
    }
}

// === ResponseObserver ===

impl ResponseObserver {
    pub(crate) fn msg_received(&self) {
        self.msg_received.inc();
    }

    pub(crate) fn msg_sent(&self) {
        self.msg_sent.inc();
    }

    pub(crate) fn end(mut self, code: tonic::Code) {
        if let Some(handle) = self.handled.take() {
            handle.inc_end(code);
        }
    }
}

impl Drop for ResponseObserver {
    fn drop(&mut self) {
        if let Some(inner) = self.handled.take() {
            inner.inc_end(tonic::Code::Ok);
        }
    }
}

// === ResponseHandle ===

impl ResponseHandle {
    #[inline]
    fn inc_end(self, code: tonic::Code) {
        let Self {
            start,
            durations,
            codes,
            labels,
        } = self;
        durations.observe(start.elapsed().as_secs_f64());
        codes
            .get_or_create(&CodeLabels {
                grpc_service: labels.grpc_service,
                grpc_method: labels.grpc_method,
                grpc_type: labels.grpc_type,
                grpc_code: code_str(code),
            })
            .inc();
    }
}

fn code_str(code: tonic::Code) -> &'static str {
    use tonic::Code::*;
    match code {
        Ok => "OK",
        Cancelled => "CANCELLED",
        Unknown => "UNKNOWN",
        InvalidArgument => "INVALID_ARGUMENT",
        DeadlineExceeded => "DEADLINE_EXCEEDED",
        NotFound => "NOT_FOUND",
        AlreadyExists => "ALREADY_EXISTS",
        PermissionDenied => "PERMISSION_DENIED",
        ResourceExhausted => "RESOURCE_EXHAUSTED",
        FailedPrecondition => "FAILED_PRECONDITION",
        Aborted => "ABORTED",
        OutOfRange => "OUT_OF_RANGE",
        Unimplemented => "UNIMPLEMENTED",
        Internal => "INTERNAL",
        Unavailable => "UNAVAILABLE",
        DataLoss => "DATA_LOSS",
        Unauthenticated => "UNAUTHENTICATED",
    }
}
