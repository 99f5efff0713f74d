use super::LocalReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube_derive::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Cluster-scoped singleton pointing the operator at the compute side.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
#[kube(
    group = "registrar.homerow.ca",
    version = "v1alpha1",
    kind = "ClusterRegistrar",
    status = "ClusterRegistrarStatus"
)]
pub struct ClusterRegistrarSpec {
    pub compute_service: ComputeService,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ComputeService {
    /// Secret in the operator namespace holding a `kubeconfig` key for the
    /// compute organization workspace.
    pub compute_kubeconfig_secret_ref: LocalReference,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterRegistrarStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
}
