//! Mirrors a `ManagedCluster`'s observed state onto its `RegisteredCluster`.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::ResourceExt;

use crate::crds::{CLUSTER_ID_LABEL, ManagedCluster, RegisteredClusterStatus};

pub const CONDITION_TRUE: &str = "True";

/// Status of the condition of type `type_`, if present.
pub fn condition_status<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a str> {
    conditions
        .iter()
        .find(|c| c.type_ == type_)
        .map(|c| c.status.as_str())
}

pub fn is_condition_true(conditions: &[Condition], type_: &str) -> bool {
    condition_status(conditions, type_) == Some(CONDITION_TRUE)
}

/// Set `condition` in `conditions`, keyed by type.
///
/// The existing `lastTransitionTime` is kept unless the status flips. Reason,
/// message and observed generation always follow the incoming condition.
pub fn set_condition(conditions: &mut Vec<Condition>, condition: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            if existing.status != condition.status {
                existing.status = condition.status;
                existing.last_transition_time = if condition.last_transition_time.0.timestamp() == 0 {
                    Time(chrono::Utc::now())
                } else {
                    condition.last_transition_time
                };
            }
            existing.reason = condition.reason;
            existing.message = condition.message;
            existing.observed_generation = condition.observed_generation;
        }
        None => conditions.push(condition),
    }
}

/// Merge `incoming` into a copy of `conditions`, keeping unrelated types.
pub fn merge_conditions(
    conditions: &[Condition],
    incoming: impl IntoIterator<Item = Condition>,
) -> Vec<Condition> {
    let mut merged = conditions.to_vec();
    for condition in incoming {
        set_condition(&mut merged, condition);
    }
    merged
}

/// Project `membership` onto `current`.
///
/// Artifact references already recorded on `current` are carried over; every
/// other field reflects the membership, including values it no longer reports.
pub fn project(current: &RegisteredClusterStatus, membership: &ManagedCluster) -> RegisteredClusterStatus {
    let mut status = current.clone();
    status.api_url = api_url(membership);
    status.cluster_id = cluster_id(membership);
    let Some(observed) = membership.status.as_ref() else {
        return status;
    };

    status.conditions = merge_conditions(&current.conditions, observed.conditions.iter().cloned());
    status.capacity = observed.capacity.clone();
    status.allocatable = observed.allocatable.clone();
    status.version = observed.version.clone();
    status.cluster_claims = observed.cluster_claims.clone();
    status
}

/// URL of the first client config the join agent advertised.
pub fn api_url(membership: &ManagedCluster) -> Option<String> {
    membership
        .spec
        .managed_cluster_client_configs
        .first()
        .map(|c| c.url.clone())
        .filter(|url| !url.is_empty())
}

pub fn cluster_id(membership: &ManagedCluster) -> Option<String> {
    membership
        .labels()
        .get(CLUSTER_ID_LABEL)
        .filter(|id| !id.is_empty())
        .cloned()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::{TimeZone, Utc};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use kube::api::ObjectMeta;

    use super::*;
    use crate::crds::{
        CONDITION_AVAILABLE, CONDITION_JOINED, ClientConfig, ClusterClaim, ClusterVersion,
        LocalReference, ManagedClusterSpec, ManagedClusterStatus,
    };

    fn condition(type_: &str, status: &str, at: i64) -> Condition {
        Condition {
            type_: type_.to_owned(),
            status: status.to_owned(),
            reason: "Reason".to_owned(),
            message: String::new(),
            observed_generation: None,
            last_transition_time: Time(Utc.timestamp_opt(at, 0).unwrap()),
        }
    }

    #[test]
    fn merge_keeps_unrelated_conditions() {
        let merged = merge_conditions(
            &[condition("A", "True", 100)],
            [condition("B", "True", 200)],
        );

        assert_eq!(merged.len(), 2);
        assert_eq!(condition_status(&merged, "A"), Some("True"));
        assert_eq!(condition_status(&merged, "B"), Some("True"));
        assert_eq!(merged[0].last_transition_time.0.timestamp(), 100);
        assert_eq!(merged[1].last_transition_time.0.timestamp(), 200);
    }

    #[test]
    fn unchanged_status_keeps_transition_time() {
        let mut incoming = condition("A", "True", 500);
        incoming.message = "still fine".to_owned();
        let merged = merge_conditions(&[condition("A", "True", 100)], [incoming]);

        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].last_transition_time.0.timestamp(), 100);
        assert_eq!(merged[0].message, "still fine");
    }

    #[test]
    fn flipped_status_takes_incoming_transition_time() {
        let merged = merge_conditions(&[condition("A", "False", 100)], [condition("A", "True", 300)]);
        assert_eq!(merged[0].status, "True");
        assert_eq!(merged[0].last_transition_time.0.timestamp(), 300);
    }

    #[test]
    fn condition_lookup() {
        let conditions = [condition("Joined", "True", 1)];
        assert_eq!(condition_status(&conditions, "Joined"), Some("True"));
        assert_eq!(condition_status(&conditions, "Available"), None);
        assert!(is_condition_true(&conditions, "Joined"));
    }

    fn joined_membership() -> ManagedCluster {
        ManagedCluster {
            metadata: ObjectMeta {
                name: Some("registered-cluster-x7k2p".to_owned()),
                labels: Some(BTreeMap::from([(
                    CLUSTER_ID_LABEL.to_owned(),
                    "8bcc855c-259f-46fd-adda-485ef99f2438".to_owned(),
                )])),
                ..ObjectMeta::default()
            },
            spec: ManagedClusterSpec {
                hub_accepts_client: true,
                managed_cluster_client_configs: vec![ClientConfig {
                    url: "https://example.com:443".to_owned(),
                    ca_bundle: None,
                }],
            },
            status: Some(ManagedClusterStatus {
                conditions: vec![
                    condition(CONDITION_AVAILABLE, "True", 10),
                    condition(CONDITION_JOINED, "True", 10),
                ],
                allocatable: BTreeMap::from([
                    ("cpu".to_owned(), Quantity("2".to_owned())),
                    ("memory".to_owned(), Quantity("2".to_owned())),
                ]),
                capacity: BTreeMap::from([
                    ("cpu".to_owned(), Quantity("1".to_owned())),
                    ("memory".to_owned(), Quantity("1".to_owned())),
                ]),
                version: ClusterVersion {
                    kubernetes: "1.19.2".to_owned(),
                },
                cluster_claims: vec![ClusterClaim {
                    name: "registeredCluster".to_owned(),
                    value: "registered-cluster".to_owned(),
                }],
            }),
        }
    }

    #[test]
    fn projects_membership_fields() {
        let current = RegisteredClusterStatus {
            import_command_ref: Some(LocalReference::new("registered-cluster-import")),
            ..RegisteredClusterStatus::default()
        };
        let status = project(&current, &joined_membership());

        assert_eq!(status.allocatable["cpu"], Quantity("2".to_owned()));
        assert_eq!(status.capacity["cpu"], Quantity("1".to_owned()));
        assert_eq!(status.version.kubernetes, "1.19.2");
        assert_eq!(status.cluster_claims.len(), 1);
        assert_eq!(status.conditions.len(), 2);
        assert_eq!(status.api_url.as_deref(), Some("https://example.com:443"));
        assert_eq!(
            status.cluster_id.as_deref(),
            Some("8bcc855c-259f-46fd-adda-485ef99f2438")
        );
        assert_eq!(status.import_command_ref, current.import_command_ref);
    }

    #[test]
    fn projection_is_stable() {
        let membership = joined_membership();
        let once = project(&RegisteredClusterStatus::default(), &membership);
        let twice = project(&once, &membership);
        assert_eq!(once, twice);
    }

    #[test]
    fn shrinking_membership_drops_stale_values() {
        let mut membership = joined_membership();
        membership.status.as_mut().unwrap().capacity.insert("gpu".to_owned(), Quantity("4".to_owned()));
        let before = project(&RegisteredClusterStatus::default(), &membership);
        assert!(before.capacity.contains_key("gpu"));

        let observed = membership.status.as_mut().unwrap();
        observed.capacity.remove("gpu");
        observed.cluster_claims.clear();
        membership.spec.managed_cluster_client_configs.clear();
        let after = project(&before, &membership);

        assert_eq!(after.capacity.keys().collect::<Vec<_>>(), vec!["cpu", "memory"]);
        assert!(after.cluster_claims.is_empty());
        assert_eq!(after.api_url, None);
        assert_eq!(project(&after, &membership), after);
    }

    #[test]
    fn cluster_id_waits_for_label() {
        let mut membership = joined_membership();
        membership.metadata.labels = None;
        let status = project(&RegisteredClusterStatus::default(), &membership);
        assert_eq!(status.cluster_id, None);
    }
}
