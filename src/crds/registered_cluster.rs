use std::collections::BTreeMap;

use super::LocalReference;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube_derive::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A request for a remote cluster to join the fleet.
///
/// Lives on the compute side. Everything under `status` mirrors the hub-side
/// `ManagedCluster` and is never read back as input.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
#[kube(
    group = "registrar.homerow.ca",
    version = "v1alpha1",
    kind = "RegisteredCluster",
    namespaced,
    status = "RegisteredClusterStatus",
    printcolumn = r#"{"name":"Joined","type":"string","jsonPath":".status.conditions[?(@.type==\"ManagedClusterJoined\")].status"}"#,
    printcolumn = r#"{"name":"Available","type":"string","jsonPath":".status.conditions[?(@.type==\"ManagedClusterConditionAvailable\")].status"}"#
)]
pub struct RegisteredClusterSpec {
    /// Placement-target workspaces the cluster is published to as a sync target.
    #[serde(default)]
    pub location: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredClusterStatus {
    /// Secret holding the command that imports the cluster.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub import_command_ref: Option<LocalReference>,

    /// Secret holding a kubeconfig for the registered cluster.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_secret_ref: Option<LocalReference>,

    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Total resource capacity reported by the cluster's nodes.
    #[serde(default)]
    pub capacity: BTreeMap<String, Quantity>,

    #[serde(default)]
    pub allocatable: BTreeMap<String, Quantity>,

    #[serde(default)]
    pub version: ClusterVersion,

    #[serde(default)]
    pub cluster_claims: Vec<ClusterClaim>,

    /// Externally reachable API server URL of the registered cluster.
    #[serde(rename = "apiURL", default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,

    #[serde(rename = "clusterID", default, skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct ClusterVersion {
    #[serde(default)]
    pub kubernetes: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct ClusterClaim {
    pub name: String,
    pub value: String,
}
