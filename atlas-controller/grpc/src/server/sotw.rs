use crate::{cache::Snapshot, ResourceType};
use envoy_types::pb::envoy::service::discovery::v3::{DiscoveryRequest, DiscoveryResponse};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, trace, warn};

/// State-of-the-world protocol state for one stream.
#[derive(Debug)]
pub(crate) struct SotwState {
    /// Set for single-type services; aggregated streams multiplex all types.
    fixed: Option<ResourceType>,
    watches: BTreeMap<ResourceType, Watch>,
    nonce: u64,
}

#[derive(Debug, Default)]
struct Watch {
    names: BTreeSet<String>,
    sent: Option<Sent>,
}

#[derive(Debug)]
struct Sent {
    version: String,
    nonce: String,
}

/// What a request asked of the server.
#[derive(Debug, PartialEq)]
pub(crate) enum Outcome {
    Respond(Box<DiscoveryResponse>),
    Ack,
    Nack,
    Stale,
    /// Nothing to send until a snapshot exists.
    Pending,
}

// === impl SotwState ===

impl SotwState {
    pub(crate) fn new(fixed: Option<ResourceType>) -> Self {
        Self {
            fixed,
            watches: BTreeMap::new(),
            nonce: 0,
        }
    }

    pub(crate) fn resource_type(&self, type_url: &str) -> Result<ResourceType, tonic::Status> {
        super::resource_type(self.fixed, type_url)
    }

    pub(crate) fn on_request(
        &mut self,
        ty: ResourceType,
        req: &DiscoveryRequest,
        snapshot: Option<&Snapshot>,
    ) -> Outcome {
        let watch = self.watches.entry(ty).or_default();

        if !req.response_nonce.is_empty() {
            let current = watch.sent.as_ref().map(|s| s.nonce.as_str());
            if current != Some(req.response_nonce.as_str()) {
                trace!(%ty, nonce = %req.response_nonce, "Ignoring stale request");
                return Outcome::Stale;
            }
        }

        let names = req.resource_names.iter().cloned().collect::<BTreeSet<_>>();
        let names_changed = watch.names != names;
        watch.names = names;

        if let Some(error) = req.error_detail.as_ref() {
            warn!(
                %ty,
                version = %req.version_info,
                message = %error.message,
                "Proxy rejected configuration",
            );
            return Outcome::Nack;
        }

        let Some(snapshot) = snapshot else {
            return Outcome::Pending;
        };
        if !names_changed && req.version_info == snapshot.version() {
            debug!(%ty, version = %req.version_info, "Proxy is current");
            return Outcome::Ack;
        }

        Outcome::Respond(Box::new(self.respond(ty, snapshot)))
    }

    /// Responses for every watched type not yet at the snapshot's version.
    pub(crate) fn on_snapshot(&mut self, snapshot: &Snapshot) -> Vec<DiscoveryResponse> {
        let stale = self
            .watches
            .iter()
            .filter(|(_, w)| w.sent.as_ref().map(|s| s.version.as_str()) != Some(snapshot.version()))
            .map(|(ty, _)| *ty)
            .collect::<Vec<_>>();
        stale
            .into_iter()
            .map(|ty| self.respond(ty, snapshot))
            .collect()
    }

    fn respond(&mut self, ty: ResourceType, snapshot: &Snapshot) -> DiscoveryResponse {
        self.nonce += 1;
        let nonce = self.nonce.to_string();
        let watch = self.watches.entry(ty).or_default();
        let resources = snapshot
            .select(ty, &watch.names)
            .into_iter()
            .map(|r| r.resource.clone())
            .collect();
        watch.sent = Some(Sent {
            version: snapshot.version().to_string(),
            nonce: nonce.clone(),
        });
        DiscoveryResponse {
            version_info: snapshot.version().to_string(),
            resources,
            type_url: ty.type_url().to_string(),
            nonce,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::tests::{graph, rpc_status};

    fn request(ty: ResourceType, version: &str, nonce: &str, names: &[&str]) -> DiscoveryRequest {
        DiscoveryRequest {
            version_info: version.to_string(),
            type_url: ty.type_url().to_string(),
            response_nonce: nonce.to_string(),
            resource_names: names.iter().map(|n| n.to_string()).collect(),
            ..Default::default()
        }
    }

    fn respond(outcome: Outcome) -> DiscoveryResponse {
        match outcome {
            Outcome::Respond(rsp) => *rsp,
            outcome => panic!("expected a response, got {outcome:?}"),
        }
    }

    #[test]
    fn initial_request_receives_snapshot() {
        let snapshot = Snapshot::build("east", "v.1", &graph(&["a", "b"])).expect("valid");
        let mut state = SotwState::new(None);
        let rsp = respond(state.on_request(
            ResourceType::Cluster,
            &request(ResourceType::Cluster, "", "", &[]),
            Some(&snapshot),
        ));
        assert_eq!(rsp.version_info, "v.1");
        assert_eq!(rsp.resources.len(), 2);
        assert_eq!(rsp.type_url, ResourceType::Cluster.type_url());
        assert!(!rsp.nonce.is_empty());
    }

    #[test]
    fn ack_parks_until_next_snapshot() {
        let v1 = Snapshot::build("east", "v.1", &graph(&["a"])).expect("valid");
        let v2 = Snapshot::build("east", "v.2", &graph(&["a", "b"])).expect("valid");
        let mut state = SotwState::new(None);
        let ty = ResourceType::Cluster;

        let rsp = respond(state.on_request(ty, &request(ty, "", "", &[]), Some(&v1)));
        let ack = request(ty, &rsp.version_info, &rsp.nonce, &[]);
        assert_eq!(state.on_request(ty, &ack, Some(&v1)), Outcome::Ack);
        assert!(state.on_snapshot(&v1).is_empty());

        let pushed = state.on_snapshot(&v2);
        assert_eq!(pushed.len(), 1);
        assert_eq!(pushed[0].version_info, "v.2");
        assert_eq!(pushed[0].resources.len(), 2);

        // An ACK of the superseded response carries a stale nonce.
        assert_eq!(state.on_request(ty, &ack, Some(&v2)), Outcome::Stale);
    }

    #[test]
    fn nack_parks_the_type() {
        let v1 = Snapshot::build("east", "v.1", &graph(&["a"])).expect("valid");
        let v2 = Snapshot::build("east", "v.2", &graph(&["a"])).expect("valid");
        let mut state = SotwState::new(None);
        let ty = ResourceType::Listener;

        let rsp = respond(state.on_request(ty, &request(ty, "", "", &[]), Some(&v1)));
        let nack = DiscoveryRequest {
            error_detail: Some(rpc_status("listener rejected")),
            ..request(ty, "", &rsp.nonce, &[])
        };
        assert_eq!(state.on_request(ty, &nack, Some(&v1)), Outcome::Nack);
        assert_eq!(state.on_snapshot(&v2).len(), 1);
    }

    #[test]
    fn named_types_follow_subscription_changes() {
        let snapshot = Snapshot::build("east", "v.1", &graph(&["a", "b"])).expect("valid");
        let mut state = SotwState::new(None);
        let ty = ResourceType::Route;

        let rsp = respond(state.on_request(ty, &request(ty, "", "", &["a"]), Some(&snapshot)));
        assert_eq!(rsp.resources.len(), 1);

        let resubscribe = request(ty, &rsp.version_info, &rsp.nonce, &["a", "b"]);
        let rsp = respond(state.on_request(ty, &resubscribe, Some(&snapshot)));
        assert_eq!(rsp.version_info, "v.1");
        assert_eq!(rsp.resources.len(), 2);
    }

    #[test]
    fn waits_for_a_snapshot() {
        let mut state = SotwState::new(Some(ResourceType::Secret));
        let ty = ResourceType::Secret;
        assert_eq!(
            state.on_request(ty, &request(ty, "", "", &["validation"]), None),
            Outcome::Pending
        );

        let snapshot = Snapshot::build("east", "v.1", &graph(&["a"])).expect("valid");
        let pushed = state.on_snapshot(&snapshot);
        assert_eq!(pushed.len(), 1);
        assert_eq!(pushed[0].resources.len(), 1);
    }

    #[test]
    fn single_type_streams_reject_other_types() {
        let state = SotwState::new(Some(ResourceType::Cluster));
        assert_eq!(
            state.resource_type("").expect("defaults to the service type"),
            ResourceType::Cluster
        );
        let error = state
            .resource_type(ResourceType::Listener.type_url())
            .expect_err("must reject");
        assert_eq!(error.code(), tonic::Code::InvalidArgument);
    }
}
