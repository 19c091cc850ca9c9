#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod labels;

pub use self::labels::{Labels, Selector};
pub use k8s_openapi::{
    api::core::v1::{Secret, Service, ServicePort, ServiceSpec},
    apimachinery::pkg::apis::meta::v1::OwnerReference,
    ByteString,
};
pub use kube::{
    api::{Api, ObjectMeta, Patch, PatchParams, PostParams, Resource, ResourceExt},
    runtime::watcher,
    Client, Error,
};

/// Field manager used for server-side apply.
pub const FIELD_MANAGER: &str = "atlas-controller";

/// Returns true if the error is an API response with the given status code.
pub fn is_status(error: &Error, code: u16) -> bool {
    matches!(error, Error::Api(status) if status.code == code)
}
