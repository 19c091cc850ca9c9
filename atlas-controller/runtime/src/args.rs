use crate::{
    core, grpc,
    index::{self, CertificateSecrets, KubeServices, Reason, Triggers},
    k8s::{self, watcher, Selector},
    pki::{self, CertStore, KubeSecrets},
    Publisher, Reconciler,
};
use anyhow::{bail, Result};
use clap::Parser;
use prometheus_client::registry::Registry;
use std::{net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, time::Duration};
use tonic::transport::Server;
use tracing::{info, info_span, instrument, Instrument};

#[derive(Debug, Parser)]
#[clap(name = "atlas", about = "A multi-cluster observability control plane")]
pub struct Args {
    #[clap(long, default_value = "atlas=info,warn", env = "ATLAS_CONTROLLER_LOG")]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// The address the discovery server binds.
    #[clap(long, default_value = "0.0.0.0:6305")]
    grpc_addr: SocketAddr,

    /// The host the hub proxy dials to reach the discovery server.
    #[clap(long, default_value = "localhost")]
    ads_host: String,

    #[clap(long, default_value = "6305")]
    ads_port: u16,

    /// Distinguishes snapshot versions produced by concurrent controller
    /// instances. Must be between 1 and 1023.
    #[clap(long, default_value = "1", env = "ATLAS_CONTROLLER_NODE_ID")]
    node_id: u16,

    /// The public address of the hub proxy. Downstream proxies dial it and
    /// the ingress certificate is issued for it.
    #[clap(long, default_value = "localhost")]
    hub_address: String,

    /// Selects the services of alert-router replicas.
    #[clap(long, default_value = "app=kube-prometheus-stack-alertmanager")]
    alertmanager_selector: Selector,

    #[clap(long, default_value = "monitoring", env = "ATLAS_CONTROLLER_NAMESPACE")]
    namespace: String,

    #[clap(long, hide = true)]
    debug_backends: bool,

    #[clap(long, default_value = "5000")]
    store_timeout_ms: u64,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            grpc_addr,
            ads_host,
            ads_port,
            node_id,
            hub_address,
            alertmanager_selector,
            namespace,
            debug_backends,
            store_timeout_ms,
        } = self;

        let versions = grpc::VersionGenerator::new(node_id)?;
        let store_timeout = Duration::from_millis(store_timeout_ms);

        let (triggers, requests) = Triggers::channel();
        let index = index::Index::shared(alertmanager_selector, triggers.clone());
        let secrets = Arc::new(parking_lot::RwLock::new(CertificateSecrets::new(
            triggers.clone(),
        )));

        let mut prom = <Registry>::default();
        index::metrics::register(prom.sub_registry_with_prefix("registry"), index.clone());
        let metrics = grpc::DiscoveryMetrics::register(prom.sub_registry_with_prefix("xds"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        // Bind before anything else is spawned so that a bad address fails
        // startup.
        let listener = TcpListener::bind(grpc_addr).await?;

        // Spawn resource watches.

        let services =
            runtime.watch_namespaced::<k8s::Service>(namespace.clone(), watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(index.clone(), services).instrument(info_span!("services")),
        );

        let cert_secrets =
            runtime.watch_namespaced::<k8s::Secret>(namespace.clone(), watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(secrets, cert_secrets).instrument(info_span!("secrets")),
        );

        let cache = grpc::SnapshotCache::default();

        let certs = CertStore::new(
            KubeSecrets::new(runtime.client(), &namespace, store_timeout),
            pki::Settings::new(hub_address.clone()),
        );
        let settings = core::Settings {
            hub_address,
            ads_host,
            ads_port,
            namespace: namespace.clone(),
            debug_backends,
        };
        let publisher = Publisher {
            cache: cache.clone(),
            metrics: metrics.clone(),
            versions,
        };
        let reconciler = Reconciler::new(
            certs,
            KubeServices::new(runtime.client(), &namespace, store_timeout),
            index,
            settings,
            publisher,
            triggers.clone(),
        );
        tokio::spawn(
            reconciler
                .run(requests, runtime.shutdown_handle())
                .instrument(info_span!("reconcile")),
        );
        triggers.request(Reason::Startup);

        // Run the gRPC server, serving snapshots from the cache.
        tokio::spawn(grpc(
            grpc_addr,
            listener,
            grpc::DiscoveryServer::new(cache, metrics, runtime.shutdown_handle()),
            runtime.shutdown_handle(),
        ));

        // Block the main thread on the shutdown signal. Once it fires, wait for the background tasks to
        // complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

#[instrument(skip_all, fields(port = %addr.port()))]
async fn grpc(
    addr: SocketAddr,
    listener: TcpListener,
    server: grpc::DiscoveryServer,
    drain: drain::Watch,
) -> Result<()> {
    let incoming = tokio_stream::wrappers::TcpListenerStream::new(listener);

    let (close_tx, close_rx) = tokio::sync::oneshot::channel();
    tokio::pin! {
        let srv = Server::builder()
            .max_concurrent_streams(1_000_000)
            .add_service(server.aggregated())
            .add_service(server.listeners())
            .add_service(server.routes())
            .add_service(server.clusters())
            .add_service(server.endpoints())
            .add_service(server.secrets())
            .add_service(server.runtime())
            .serve_with_incoming_shutdown(incoming, async move {
                let _ = close_rx.await;
            });
    }

    info!(%addr, "xDS gRPC server listening");
    tokio::select! {
        res = (&mut srv) => res?,
        handle = drain.signaled() => {
            let _ = close_tx.send(());
            handle.release_after(srv).await?
        }
    }
    Ok(())
}
