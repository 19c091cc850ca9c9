use super::*;
use atlas_controller_k8s_api::{OwnerReference, ServiceSpec};
use kubert::index::IndexNamespacedResource;
use maplit::btreemap;
use pretty_assertions::assert_eq;
use tokio::sync::mpsc;

const NS: &str = "monitoring";

fn mk_index() -> (Index, mpsc::Receiver<Reason>) {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .try_init()
        .ok();
    let (triggers, rx) = Triggers::channel();
    let selector = "app=kube-prometheus-stack-alertmanager"
        .parse()
        .expect("selector must parse");
    (Index::new(selector, triggers), rx)
}

fn mk_cluster(name: &str, replicas: Option<&str>, ips: &[&str]) -> k8s::Service {
    let mut labels = btreemap! { labels::CLUSTER.to_string() => "true".to_string() };
    if let Some(replicas) = replicas {
        labels.insert(labels::REPLICAS.to_string(), replicas.to_string());
    }
    k8s::Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NS.to_string()),
            uid: Some(format!("{name}-uid")),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            external_ips: Some(ips.iter().map(|ip| ip.to_string()).collect()),
            ports: Some(vec![k8s::ServicePort {
                name: Some("grpc".to_string()),
                port: 10901,
                node_port: Some(30901),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn mk_alertmanager(name: &str, pod: Option<&str>) -> k8s::Service {
    k8s::Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NS.to_string()),
            labels: Some(btreemap! {
                "app".to_string() => "kube-prometheus-stack-alertmanager".to_string(),
            }),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: pod.map(|pod| {
                btreemap! { labels::STATEFULSET_POD_NAME.to_string() => pod.to_string() }
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn mk_sidecar(name: &str, owner_uid: &str) -> k8s::Service {
    k8s::Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NS.to_string()),
            labels: Some(btreemap! { labels::THANOS_SIDECAR.to_string() => "0".to_string() }),
            owner_references: Some(vec![OwnerReference {
                api_version: "v1".to_string(),
                kind: "Service".to_string(),
                name: "east".to_string(),
                uid: owner_uid.to_string(),
                controller: Some(true),
                ..Default::default()
            }]),
            ..Default::default()
        },
        ..Default::default()
    }
}

#[test]
fn registers_clusters_in_name_order() {
    let (mut index, mut rx) = mk_index();

    let mut west = mk_cluster("west", Some("2"), &["192.0.2.20", "192.0.2.21"]);
    west.metadata.annotations = Some(btreemap! {
        labels::THANOS_SERVICE.to_string() => "thanos-query.observe.svc.cluster.local".to_string(),
        labels::PROMETHEUS_SERVICE.to_string() => "prom.observe.svc.cluster.local".to_string(),
    });
    index.apply(west);
    assert_eq!(rx.try_recv().ok(), Some(Reason::Cluster));
    index.apply(mk_cluster("east", None, &["192.0.2.10"]));

    let inventory = index.inventory();
    let names = inventory
        .clusters
        .iter()
        .map(|c| c.name.as_str())
        .collect::<Vec<_>>();
    assert_eq!(names, ["east", "west"]);

    let east = &inventory.clusters[0];
    assert_eq!(east.replicas.get(), 1);
    assert_eq!(east.thanos_service, atlas_controller_core::THANOS_FQDN);
    assert_eq!(east.address(), Some("192.0.2.10"));

    let west = &inventory.clusters[1];
    assert_eq!(west.replicas.get(), 2);
    assert_eq!(west.thanos_service, "thanos-query.observe.svc.cluster.local");
    assert_eq!(west.prometheus_service, "prom.observe.svc.cluster.local");
    assert_eq!(west.address(), Some("192.0.2.20"));
}

#[test]
fn invalid_replica_counts_fall_back_to_one() {
    let (mut index, _rx) = mk_index();
    for (name, replicas) in [("a", "three"), ("b", "0"), ("c", "-2"), ("d", "")] {
        index.apply(mk_cluster(name, Some(replicas), &["192.0.2.1"]));
    }
    for cluster in index.inventory().clusters {
        assert_eq!(cluster.replicas.get(), 1, "{}", cluster.name);
    }
}

#[test]
fn only_changes_trigger() {
    let (mut index, mut rx) = mk_index();
    index.apply(mk_cluster("east", Some("1"), &["192.0.2.10"]));
    assert_eq!(rx.try_recv().ok(), Some(Reason::Cluster));

    index.apply(mk_cluster("east", Some("1"), &["192.0.2.10"]));
    assert!(rx.try_recv().is_err());

    index.apply(mk_cluster("east", Some("2"), &["192.0.2.10"]));
    assert_eq!(rx.try_recv().ok(), Some(Reason::Cluster));

    index.delete(NS.to_string(), "east".to_string());
    assert_eq!(rx.try_recv().ok(), Some(Reason::Cluster));
    assert!(index.inventory().clusters.is_empty());

    index.delete(NS.to_string(), "east".to_string());
    assert!(rx.try_recv().is_err());
}

#[test]
fn removing_the_label_deregisters() {
    let (mut index, mut rx) = mk_index();
    index.apply(mk_cluster("east", None, &["192.0.2.10"]));
    assert_eq!(rx.try_recv().ok(), Some(Reason::Cluster));

    let mut unlabeled = mk_cluster("east", None, &["192.0.2.10"]);
    unlabeled.metadata.labels = None;
    index.apply(unlabeled);
    assert_eq!(rx.try_recv().ok(), Some(Reason::Cluster));
    assert!(index.inventory().clusters.is_empty());
}

#[test]
fn cluster_without_address_is_registered() {
    let (mut index, _rx) = mk_index();
    index.apply(mk_cluster("east", None, &[]));
    let inventory = index.inventory();
    assert_eq!(inventory.clusters.len(), 1);
    assert_eq!(inventory.clusters[0].address(), None);
}

#[test]
fn alert_routers_pin_a_stateful_pod() {
    let (mut index, mut rx) = mk_index();

    index.apply(mk_alertmanager("alertmanager-operated", None));
    assert!(rx.try_recv().is_err());

    index.apply(mk_alertmanager("am-1", Some("alertmanager-main-1")));
    assert_eq!(rx.try_recv().ok(), Some(Reason::AlertRouter));
    index.apply(mk_alertmanager("am-0", Some("alertmanager-main-0")));

    assert_eq!(
        index.inventory().alert_routers,
        vec![
            AlertRouter {
                name: "am-0".to_string(),
                namespace: NS.to_string(),
            },
            AlertRouter {
                name: "am-1".to_string(),
                namespace: NS.to_string(),
            },
        ]
    );

    let _ = rx.try_recv();
    index.delete(NS.to_string(), "am-0".to_string());
    assert_eq!(rx.try_recv().ok(), Some(Reason::AlertRouter));
    assert_eq!(index.inventory().alert_routers.len(), 1);
}

#[test]
fn empty_alert_router_selector_matches_nothing() {
    let (triggers, _rx) = Triggers::channel();
    let mut index = Index::new(Selector::default(), triggers);
    index.apply(mk_alertmanager("am-0", Some("alertmanager-main-0")));
    assert!(index.inventory().alert_routers.is_empty());
}

#[test]
fn sidecar_services_per_replica() {
    let (mut index, _rx) = mk_index();
    let mut east = mk_cluster("east", Some("2"), &["192.0.2.10"]);
    east.metadata.annotations = Some(btreemap! {
        labels::ENVOY_SELECTORS.to_string() => "app=proxy,tier=edge".to_string(),
    });
    index.apply(east);

    let sets = index.sidecars();
    assert_eq!(sets.len(), 1);
    let set = &sets[0];
    assert_eq!(set.cluster, "east");
    assert!(set.stale.is_empty());

    let names = set
        .services
        .iter()
        .map(|s| s.name_unchecked())
        .collect::<Vec<_>>();
    assert_eq!(names, ["east-thanos-sidecar0", "east-thanos-sidecar1"]);

    let second = &set.services[1];
    assert_eq!(
        second.labels().get(labels::THANOS_SIDECAR).map(String::as_str),
        Some("1")
    );
    let spec = second.spec.as_ref().expect("sidecar must have a spec");
    assert_eq!(spec.cluster_ip.as_deref(), Some("None"));
    assert_eq!(spec.type_.as_deref(), Some("ClusterIP"));
    assert_eq!(
        spec.selector,
        Some(btreemap! {
            "app".to_string() => "proxy".to_string(),
            "tier".to_string() => "edge".to_string(),
        })
    );
    let ports = spec.ports.as_ref().expect("ports must be copied");
    assert_eq!(ports[0].port, 10901);
    assert_eq!(ports[0].node_port, None);
}

#[test]
fn invalid_envoy_selector_uses_default() {
    let (mut index, _rx) = mk_index();
    let mut east = mk_cluster("east", None, &["192.0.2.10"]);
    east.metadata.annotations = Some(btreemap! {
        labels::ENVOY_SELECTORS.to_string() => "app=envoy,,".to_string(),
    });
    index.apply(east);

    let sets = index.sidecars();
    let spec = sets[0].services[0].spec.as_ref().expect("must have a spec");
    assert_eq!(
        spec.selector,
        Some(btreemap! {
            "app".to_string() => "envoy".to_string(),
            "release".to_string() => "atlas".to_string(),
        })
    );
}

#[test]
fn replica_reduction_marks_sidecars_stale() {
    let (mut index, _rx) = mk_index();
    index.apply(mk_cluster("east", Some("1"), &["192.0.2.10"]));
    index.apply(mk_sidecar("east-thanos-sidecar0", "east-uid"));
    index.apply(mk_sidecar("east-thanos-sidecar1", "east-uid"));
    index.apply(mk_sidecar("west-thanos-sidecar0", "west-uid"));

    let sets = index.sidecars();
    assert_eq!(sets[0].stale, vec!["east-thanos-sidecar1".to_string()]);
}
