//! The reconciliation pass: certificates, then the registry, then synthesis,
//! then publication.

use crate::{
    core::{Settings, Synthesizer},
    grpc::{DiscoveryMetrics, PublishReport, SnapshotCache, VersionGenerator},
    index::{Reason, SharedIndex, SidecarStore, Triggers},
    pki::{self, CertStore, SecretStore},
};
use anyhow::Result;
use tokio::{sync::mpsc, time};
use tracing::{debug, error, info, info_span, warn, Instrument};

#[cfg(test)]
mod tests;

/// Delay before retrying a pass that lost a write race.
const REQUEUE_DELAY: time::Duration = time::Duration::from_secs(5);

/// Owns all reconciliation state. Passes run one at a time on the task that
/// owns the reconciler; triggers arriving mid-pass coalesce into one
/// follow-up.
pub struct Reconciler<C, S> {
    certs: CertStore<C>,
    sidecars: S,
    index: SharedIndex,
    settings: Settings,
    publisher: Publisher,
    triggers: Triggers,
}

/// Versions and publishes every graph of a pass.
pub struct Publisher {
    pub cache: SnapshotCache,
    pub metrics: DiscoveryMetrics,
    pub versions: VersionGenerator,
}

// === impl Reconciler ===

impl<C, S> Reconciler<C, S>
where
    C: SecretStore,
    S: SidecarStore,
{
    pub fn new(
        certs: CertStore<C>,
        sidecars: S,
        index: SharedIndex,
        settings: Settings,
        publisher: Publisher,
        triggers: Triggers,
    ) -> Self {
        Self {
            certs,
            sidecars,
            index,
            settings,
            publisher,
            triggers,
        }
    }

    /// Runs a pass for every request until the process begins shutting down.
    /// A pass in progress when shutdown is signaled runs to completion.
    pub async fn run(mut self, mut requests: mpsc::Receiver<Reason>, drain: drain::Watch) {
        tokio::pin! {
            let shutdown = drain.signaled();
        }

        loop {
            let reason = tokio::select! {
                reason = requests.recv() => match reason {
                    Some(reason) => reason,
                    None => return,
                },
                _ = &mut shutdown => {
                    debug!("Reconciler shutting down");
                    return;
                }
            };
            self.pass(reason)
                .instrument(info_span!("pass", %reason))
                .await;
        }
    }

    pub(crate) async fn pass(&mut self, reason: Reason) {
        let started = time::Instant::now();
        match self.reconcile().await {
            Ok(report) => info!(
                version = %report.version,
                published = report.published.len(),
                rejected = report.rejected.len(),
                withdrawn = report.withdrawn.len(),
                elapsed = ?started.elapsed(),
                "Reconciled",
            ),
            Err(error) if is_conflict(&error) => {
                info!(%error, delay = ?REQUEUE_DELAY, "Lost a write race; requeueing");
                self.requeue();
            }
            Err(error) => error!(%reason, %error, "Reconciliation failed"),
        }
    }

    /// Runs one pass end to end. Fails before publishing anything if the
    /// certificate material cannot be reconciled; the previously published
    /// snapshots stay in place.
    pub async fn reconcile(&mut self) -> Result<PublishReport> {
        let material = self.certs.reconcile().await?;

        let (inventory, sidecars) = {
            let index = self.index.read();
            (index.inventory(), index.sidecars())
        };
        debug!(
            clusters = inventory.clusters.len(),
            alert_routers = inventory.alert_routers.len(),
            "Read registry",
        );

        for set in &sidecars {
            if let Err(error) = self.sidecars.apply(set).await {
                warn!(cluster = %set.cluster, %error, "Failed to apply sidecar services");
            }
        }

        let tls = material.tls();
        let graphs = Synthesizer::new(&self.settings, &tls, &inventory).graphs();
        Ok(self.publisher.publish(graphs))
    }

    fn requeue(&self) {
        let triggers = self.triggers.clone();
        tokio::spawn(async move {
            time::sleep(REQUEUE_DELAY).await;
            triggers.request(Reason::Requeue);
        });
    }
}

// === impl Publisher ===

impl Publisher {
    pub fn publish(
        &self,
        graphs: impl IntoIterator<Item = (String, crate::core::ConfigGraph)>,
    ) -> PublishReport {
        let version = self.versions.next_version();
        let report = self.cache.publish(&version, graphs);
        self.metrics.record_publish(&report);
        report
    }
}

fn is_conflict(error: &anyhow::Error) -> bool {
    error
        .downcast_ref::<pki::Error>()
        .is_some_and(pki::Error::is_conflict)
}
