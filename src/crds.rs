use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::CustomResourceExt;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub mod cluster_registrar;
pub mod compute;
pub mod hub;
pub mod hub_config;
pub mod registered_cluster;

pub use cluster_registrar::*;
pub use compute::*;
pub use hub::*;
pub use hub_config::*;
pub use registered_cluster::*;

/// Reference to an object by name within an implied namespace.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct LocalReference {
    pub name: String,
}

impl LocalReference {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// The CRDs this operator owns, in install order.
pub fn owned_crds() -> Vec<CustomResourceDefinition> {
    vec![
        ClusterRegistrar::crd(),
        HubConfig::crd(),
        RegisteredCluster::crd(),
    ]
}
