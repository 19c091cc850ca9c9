#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use atlas_controller_core as core;
pub use atlas_controller_grpc as grpc;
pub use atlas_controller_k8s_api as k8s;
pub use atlas_controller_k8s_index as index;
pub use atlas_controller_pki as pki;

mod args;
mod reconcile;

pub use self::{
    args::Args,
    reconcile::{Publisher, Reconciler},
};
