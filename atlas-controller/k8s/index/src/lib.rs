#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Watch-fed indexes over the monitoring namespace.
//!
//! The [`registry`] tracks registered downstream clusters and alert-router
//! replicas; [`secrets`] observes certificate secrets. Both request a
//! reconciliation pass through [`Triggers`] whenever what they track changes.

pub mod metrics;
pub mod registry;
pub mod secrets;
pub mod sidecar;

pub use self::{
    registry::{Index, SharedIndex},
    secrets::CertificateSecrets,
    sidecar::{KubeServices, SidecarError, SidecarSet, SidecarStore},
};

use tokio::sync::mpsc;

/// Requests reconciliation passes. At most one request is ever queued, so a
/// burst of changes arriving during a pass results in exactly one follow-up.
#[derive(Clone, Debug)]
pub struct Triggers(mpsc::Sender<Reason>);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Reason {
    Startup,
    Secret,
    Cluster,
    AlertRouter,
    Requeue,
}

// === impl Triggers ===

impl Triggers {
    pub fn channel() -> (Self, mpsc::Receiver<Reason>) {
        let (tx, rx) = mpsc::channel(1);
        (Self(tx), rx)
    }

    pub fn request(&self, reason: Reason) {
        match self.0.try_send(reason) {
            Ok(()) => tracing::debug!(?reason, "Requested reconciliation"),
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::trace!(?reason, "Reconciliation already pending")
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(?reason, "Reconciler has stopped")
            }
        }
    }
}

impl std::fmt::Display for Reason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Startup => "startup",
            Self::Secret => "secret",
            Self::Cluster => "cluster",
            Self::AlertRouter => "alert-router",
            Self::Requeue => "requeue",
        }
        .fmt(f)
    }
}
