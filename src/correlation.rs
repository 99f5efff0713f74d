//! Label-based identity linking a `RegisteredCluster` to the objects it owns on
//! other control planes.
//!
//! Owner references do not cross control-plane boundaries, so every object the
//! controller creates on a hub carries these labels instead, and watch events
//! on those objects are routed back to their registration through them.

use std::collections::BTreeMap;

use kube::ResourceExt;
use kube::runtime::reflector::ObjectRef;

use crate::Error;
use crate::crds::{LOGICAL_CLUSTER_ANNOTATION, RegisteredCluster};

pub const REGISTERED_CLUSTER_NAME_LABEL: &str = "registrar.homerow.ca/registered-cluster-name";
pub const REGISTERED_CLUSTER_NAMESPACE_LABEL: &str =
    "registrar.homerow.ca/registered-cluster-namespace";
pub const REGISTERED_CLUSTER_UID_LABEL: &str = "registrar.homerow.ca/registered-cluster-uid";
pub const CLUSTER_SET_LABEL: &str = "cluster.open-cluster-management.io/clusterset";

/// Annotation recording which workspace placed the membership.
pub const PLACEMENT_ANNOTATION: &str = "registrar.homerow.ca/placement-workspace";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CorrelationIndex {
    name: String,
    namespace: String,
    uid: String,
    workspace: String,
    cluster_set: String,
}

impl CorrelationIndex {
    pub fn for_registration(rc: &RegisteredCluster) -> Result<Self, Error> {
        let name = rc.name_any();
        let namespace = rc.namespace().ok_or_else(|| Error::MissingField {
            kind: "RegisteredCluster",
            name: name.clone(),
            field: "metadata.namespace",
        })?;
        let uid = rc.uid().ok_or_else(|| Error::MissingField {
            kind: "RegisteredCluster",
            name: name.clone(),
            field: "metadata.uid",
        })?;
        let workspace = rc
            .annotations()
            .get(LOGICAL_CLUSTER_ANNOTATION)
            .cloned()
            .unwrap_or_else(|| namespace.clone());
        let cluster_set = cluster_set_name(&workspace);

        Ok(Self {
            name,
            namespace,
            uid,
            workspace,
            cluster_set,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Workspace the registration lives in.
    pub fn workspace(&self) -> &str {
        &self.workspace
    }

    pub fn cluster_set(&self) -> &str {
        &self.cluster_set
    }

    /// Full label set stamped on a membership.
    pub fn labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (REGISTERED_CLUSTER_NAME_LABEL.to_owned(), self.name.clone()),
            (
                REGISTERED_CLUSTER_NAMESPACE_LABEL.to_owned(),
                self.namespace.clone(),
            ),
            (REGISTERED_CLUSTER_UID_LABEL.to_owned(), self.uid.clone()),
            (CLUSTER_SET_LABEL.to_owned(), self.cluster_set.clone()),
        ])
    }

    /// Labels stamped on add-on and distribution objects. The cluster set is a
    /// property of the membership only.
    pub fn owner_labels(&self) -> BTreeMap<String, String> {
        let mut labels = self.labels();
        labels.remove(CLUSTER_SET_LABEL);
        labels
    }

    /// Label selector matching every membership correlated to this registration.
    pub fn selector(&self) -> String {
        self.labels()
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn annotations(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(PLACEMENT_ANNOTATION.to_owned(), self.workspace.clone())])
    }
}

/// Resolve the registration a correlated object belongs to, if it carries the
/// name and namespace labels.
pub fn registration_ref(labels: &BTreeMap<String, String>) -> Option<ObjectRef<RegisteredCluster>> {
    let name = labels.get(REGISTERED_CLUSTER_NAME_LABEL)?;
    let namespace = labels.get(REGISTERED_CLUSTER_NAMESPACE_LABEL)?;
    Some(ObjectRef::new(name).within(namespace))
}

/// Name of the cluster set holding memberships placed from `workspace`.
///
/// Workspace paths are `:` separated and may contain `-`, neither of which
/// survives as-is in a label value that must stay unique per workspace, so `-`
/// is doubled before `:` becomes a single `-`.
pub fn cluster_set_name(workspace: &str) -> String {
    workspace.replace('-', "--").replace(':', "-")
}
