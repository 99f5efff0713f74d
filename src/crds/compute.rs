//! Compute-side resources published by the workspace control plane.

use kube_derive::CustomResource;
use serde::{Deserialize, Serialize};

/// Annotation carrying the logical workspace an object lives in.
pub const LOGICAL_CLUSTER_ANNOTATION: &str = "kcp.io/cluster";

/// A placement target that workloads in a workspace can be scheduled to.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
#[kube(
    group = "workload.kcp.io",
    version = "v1alpha1",
    kind = "SyncTarget",
    schema = "disabled"
)]
pub struct SyncTargetSpec {
    #[serde(default)]
    pub unschedulable: bool,
}

/// An exported API surface and the virtual workspaces serving it.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
#[kube(
    group = "apis.kcp.io",
    version = "v1alpha1",
    kind = "APIExport",
    status = "APIExportStatus",
    schema = "disabled"
)]
pub struct APIExportSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_resource_schemas: Option<Vec<String>>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct APIExportStatus {
    #[serde(default)]
    pub virtual_workspaces: Vec<VirtualWorkspace>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct VirtualWorkspace {
    pub url: String,
}
