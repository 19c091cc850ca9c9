use super::*;
use crate::{
    core::{ConfigGraph, HUB_NODE_ID},
    index::{Index, SidecarError, SidecarSet},
    k8s::{self, labels, ObjectMeta, ServiceSpec},
    pki::{MemoryStore, StoreError},
};
use kubert::index::IndexNamespacedResource;
use maplit::btreemap;
use parking_lot::Mutex;
use prometheus_client::registry::Registry;
use std::sync::Arc;

/// Records every sidecar set it is asked to apply.
#[derive(Clone, Default)]
struct Recorded(Arc<Mutex<Vec<SidecarSet>>>);

#[async_trait::async_trait]
impl SidecarStore for Recorded {
    async fn apply(&self, set: &SidecarSet) -> Result<(), SidecarError> {
        self.0.lock().push(set.clone());
        Ok(())
    }
}

/// A store that always loses the race to create the root.
struct Conflicting;

#[async_trait::async_trait]
impl SecretStore for Conflicting {
    async fn get(&self, _: &str) -> Result<Option<k8s::Secret>, StoreError> {
        Ok(None)
    }

    async fn create(&self, _: k8s::Secret) -> Result<k8s::Secret, StoreError> {
        Err(StoreError::Conflict)
    }

    async fn replace(&self, _: k8s::Secret) -> Result<k8s::Secret, StoreError> {
        Err(StoreError::Conflict)
    }

    async fn apply_owned(&self, _: &k8s::Secret, _: Vec<k8s::Secret>) -> Result<(), StoreError> {
        Err(StoreError::Conflict)
    }
}

fn settings() -> Settings {
    Settings {
        hub_address: "atlas.example.com".to_string(),
        ads_host: "atlas-controller".to_string(),
        ads_port: 6305,
        namespace: "monitoring".to_string(),
        debug_backends: false,
    }
}

fn mk_reconciler<C: SecretStore>(
    secrets: C,
) -> (
    Reconciler<C, Recorded>,
    SnapshotCache,
    Recorded,
    SharedIndex,
    mpsc::Receiver<Reason>,
) {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .try_init()
        .ok();
    let (triggers, rx) = Triggers::channel();
    let selector = "app=kube-prometheus-stack-alertmanager"
        .parse()
        .expect("selector must parse");
    let index = Index::shared(selector, triggers.clone());
    let certs = CertStore::new(
        secrets,
        pki::Settings {
            ingress_common_name: "atlas.example.com".to_string(),
            key_bits: 2048,
        },
    );
    let cache = SnapshotCache::default();
    let publisher = Publisher {
        cache: cache.clone(),
        metrics: DiscoveryMetrics::register(&mut Registry::default()),
        versions: VersionGenerator::new(7).expect("node id must be valid"),
    };
    let sidecars = Recorded::default();
    let reconciler = Reconciler::new(
        certs,
        sidecars.clone(),
        index.clone(),
        settings(),
        publisher,
        triggers,
    );
    (reconciler, cache, sidecars, index, rx)
}

fn mk_cluster(name: &str, replicas: u32) -> k8s::Service {
    k8s::Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("monitoring".to_string()),
            uid: Some(format!("{name}-uid")),
            labels: Some(btreemap! {
                labels::CLUSTER.to_string() => "true".to_string(),
                labels::REPLICAS.to_string() => replicas.to_string(),
            }),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            external_ips: Some(vec!["203.0.113.10".to_string()]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn version_id(version: &str) -> u64 {
    version
        .strip_prefix("v.")
        .and_then(|id| id.parse().ok())
        .expect("version must carry an id")
}

#[tokio::test]
async fn publishes_hub_and_cluster_graphs() {
    let (mut reconciler, cache, sidecars, index, _rx) = mk_reconciler(MemoryStore::new());
    index.write().apply(mk_cluster("east", 3));

    let report = reconciler.reconcile().await.expect("must reconcile");
    assert_eq!(report.published, [HUB_NODE_ID, "east"]);
    assert!(report.rejected.is_empty());

    let hub = cache.get(HUB_NODE_ID).expect("hub must be published");
    let east = cache.get("east").expect("cluster must be published");
    assert_eq!(hub.version(), report.version);
    assert_eq!(east.version(), report.version);

    let applied = sidecars.0.lock().clone();
    assert_eq!(applied.len(), 1);
    assert_eq!(applied[0].cluster, "east");
    assert_eq!(applied[0].services.len(), 3);
}

#[tokio::test]
async fn stable_passes_bump_the_version_only() {
    let secrets = MemoryStore::new();
    let (mut reconciler, cache, _, _, _rx) = mk_reconciler(secrets.clone());

    let first = reconciler.reconcile().await.expect("must reconcile");
    let writes = secrets.writes();
    let hub = cache.get(HUB_NODE_ID).expect("hub must be published");

    let second = reconciler.reconcile().await.expect("must reconcile");
    assert_eq!(secrets.writes(), writes);
    assert!(version_id(&second.version) > version_id(&first.version));

    let republished = cache.get(HUB_NODE_ID).expect("hub must be published");
    for ty in crate::grpc::ResourceType::ALL {
        assert!(hub.resources(ty).eq(republished.resources(ty)));
    }
}

#[tokio::test]
async fn deregistered_clusters_are_withdrawn() {
    let (mut reconciler, cache, _, index, _rx) = mk_reconciler(MemoryStore::new());
    index.write().apply(mk_cluster("east", 1));
    reconciler.reconcile().await.expect("must reconcile");
    assert!(cache.get("east").is_some());

    index.write().delete("monitoring".to_string(), "east".to_string());
    let report = reconciler.reconcile().await.expect("must reconcile");
    assert_eq!(report.withdrawn, ["east"]);
    assert!(cache.get("east").is_none());
    assert!(cache.get(HUB_NODE_ID).is_some());
}

#[tokio::test]
async fn store_failures_publish_nothing() {
    let secrets = MemoryStore::new();
    let (mut reconciler, cache, sidecars, index, _rx) = mk_reconciler(secrets.clone());
    index.write().apply(mk_cluster("east", 1));
    secrets.set_unavailable(true);

    reconciler.reconcile().await.expect_err("must fail");
    assert!(cache.get(HUB_NODE_ID).is_none());
    assert!(sidecars.0.lock().is_empty());

    secrets.set_unavailable(false);
    reconciler.reconcile().await.expect("must reconcile");
    assert!(cache.get(HUB_NODE_ID).is_some());
}

#[tokio::test(start_paused = true)]
async fn conflicts_requeue() {
    let (mut reconciler, cache, _, _, mut rx) = mk_reconciler(Conflicting);

    reconciler.pass(Reason::Startup).await;
    assert!(cache.get(HUB_NODE_ID).is_none());
    assert!(rx.try_recv().is_err());

    let reason = rx.recv().await;
    assert_eq!(reason, Some(Reason::Requeue));
}

#[tokio::test]
async fn runs_passes_until_drained() {
    let (reconciler, cache, _, _, _) = mk_reconciler(MemoryStore::new());
    let (triggers, requests) = Triggers::channel();
    let (signal, watch) = drain::channel();
    let mut hub = cache.subscribe(HUB_NODE_ID);

    let task = tokio::spawn(reconciler.run(requests, watch));
    triggers.request(Reason::Startup);
    hub.changed().await.expect("cache must be open");
    assert!(hub.borrow().is_some());

    signal.drain().await;
    task.await.expect("reconciler must not panic");
}

#[test]
fn invalid_graphs_keep_previous_snapshots() {
    let (reconciler, cache, _, _, _rx) = mk_reconciler(MemoryStore::new());
    let publisher = &reconciler.publisher;

    let good = ConfigGraph::default();
    let first = publisher.publish([("east".to_string(), good)]);
    assert_eq!(first.published, ["east"]);

    let mut bad = ConfigGraph::default();
    bad.listeners.push(crate::core::graph::Listener::plain("l", 80, "missing"));
    let second = publisher.publish([("east".to_string(), bad)]);
    assert_eq!(second.rejected.len(), 1);
    assert_eq!(
        cache.get("east").map(|s| s.version().to_string()),
        Some(first.version)
    );
}
