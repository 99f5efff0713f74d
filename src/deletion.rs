//! Ordered teardown of everything a `RegisteredCluster` caused to exist.
//!
//! Each pass walks the plan from the front. A dependent that is still present
//! gets a delete issued and the pass ends with a requeue, so the next step is
//! only reached once the previous one is confirmed gone. Dependents already
//! absent are skipped within the same pass.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use kube::ResourceExt;
use tracing::{debug, info};

use crate::Error;
use crate::crds::ManagedCluster;

/// Wait after deleting a lightweight dependent.
pub const DEPENDENT_REQUEUE: Duration = Duration::from_secs(1);
/// Wait after deleting the membership, which the hub tears down in stages.
pub const MEMBERSHIP_REQUEUE: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DependentKind {
    ManifestWork,
    ManagedClusterAddOn,
    ManagedServiceAccount,
    ManagedCluster,
    /// A sync target published into a compute workspace.
    SyncTarget { workspace: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Dependent {
    pub kind: DependentKind,
    pub namespace: Option<String>,
    pub name: String,
}

impl Dependent {
    fn namespaced(kind: DependentKind, namespace: &str, name: &str) -> Self {
        Self {
            kind,
            namespace: Some(namespace.to_owned()),
            name: name.to_owned(),
        }
    }

    fn cluster_scoped(kind: DependentKind, name: &str) -> Self {
        Self {
            kind,
            namespace: None,
            name: name.to_owned(),
        }
    }

    /// How long to wait for this dependent to disappear once deleted.
    pub fn requeue_after(&self) -> Duration {
        match self.kind {
            DependentKind::ManagedCluster => MEMBERSHIP_REQUEUE,
            _ => DEPENDENT_REQUEUE,
        }
    }
}

impl fmt::Display for Dependent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.kind {
            DependentKind::ManifestWork => "ManifestWork",
            DependentKind::ManagedClusterAddOn => "ManagedClusterAddOn",
            DependentKind::ManagedServiceAccount => "ManagedServiceAccount",
            DependentKind::ManagedCluster => "ManagedCluster",
            DependentKind::SyncTarget { .. } => "SyncTarget",
        };
        match &self.namespace {
            Some(namespace) => write!(f, "{kind} {namespace}/{}", self.name),
            None => write!(f, "{kind} {}", self.name),
        }
    }
}

/// Names of the add-on objects created alongside a membership.
#[derive(Clone, Copy, Debug)]
pub struct AddonNames<'a> {
    pub addon: &'a str,
    pub service_account: &'a str,
}

/// The dependents of one registration, in teardown order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeletionPlan {
    steps: Vec<Dependent>,
}

impl DeletionPlan {
    /// Plan the teardown of `membership` and everything hanging off it.
    ///
    /// Without a membership there is nothing on the hub to wait for.
    pub fn for_membership(
        membership: Option<&ManagedCluster>,
        addon: AddonNames<'_>,
        locations: &[String],
    ) -> Self {
        let Some(membership) = membership else {
            return Self::default();
        };
        let cluster = membership.name_any();

        let mut steps = vec![
            Dependent::namespaced(DependentKind::ManifestWork, &cluster, addon.service_account),
            Dependent::namespaced(DependentKind::ManagedClusterAddOn, &cluster, addon.addon),
            Dependent::namespaced(
                DependentKind::ManagedServiceAccount,
                &cluster,
                addon.service_account,
            ),
        ];
        // Sync targets are named after the membership, so they go while it
        // still exists to be found.
        steps.extend(locations.iter().map(|workspace| {
            Dependent::cluster_scoped(
                DependentKind::SyncTarget {
                    workspace: workspace.clone(),
                },
                &cluster,
            )
        }));
        steps.push(Dependent::cluster_scoped(DependentKind::ManagedCluster, &cluster));
        Self { steps }
    }

    pub fn steps(&self) -> &[Dependent] {
        &self.steps
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Presence {
    Present,
    Absent,
}

/// What to do about one dependent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// Issue a delete and come back after the given delay.
    Delete { requeue_after: Duration },
    /// Confirmed gone, move to the next dependent now.
    Advance,
}

/// Decide the transition for `dependent` given whether it still exists.
pub fn step(dependent: &Dependent, presence: Presence) -> Verdict {
    match presence {
        Presence::Present => Verdict::Delete {
            requeue_after: dependent.requeue_after(),
        },
        Presence::Absent => Verdict::Advance,
    }
}

/// Outcome of one teardown pass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Teardown {
    /// Waiting on the dependent at `step` to disappear.
    Requeue { step: usize, after: Duration },
    /// Every dependent is confirmed absent; the finalizer may go.
    Complete,
}

/// Where dependents are looked up and deleted.
#[async_trait]
pub trait DependentStore: Send + Sync {
    /// Whether `dependent` still exists. A 404 is `Ok(false)`.
    async fn exists(&self, dependent: &Dependent) -> Result<bool, Error>;

    /// Request deletion of `dependent`. A 404 is `Ok(())`.
    async fn delete(&self, dependent: &Dependent) -> Result<(), Error>;
}

/// Run one teardown pass over `plan`.
pub async fn run(plan: &DeletionPlan, store: &dyn DependentStore) -> Result<Teardown, Error> {
    for (index, dependent) in plan.steps().iter().enumerate() {
        let presence = if store.exists(dependent).await? {
            Presence::Present
        } else {
            Presence::Absent
        };

        match step(dependent, presence) {
            Verdict::Delete { requeue_after } => {
                info!(step = index, %dependent, "deleting dependent");
                store.delete(dependent).await?;
                return Ok(Teardown::Requeue {
                    step: index,
                    after: requeue_after,
                });
            }
            Verdict::Advance => debug!(step = index, %dependent, "dependent confirmed absent"),
        }
    }
    Ok(Teardown::Complete)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use kube::api::ObjectMeta;

    use super::*;

    const ADDON: AddonNames<'static> = AddonNames {
        addon: "managed-serviceaccount",
        service_account: "cluster-registrar",
    };

    fn membership() -> ManagedCluster {
        ManagedCluster {
            metadata: ObjectMeta {
                name: Some("rc-abcde".to_owned()),
                ..ObjectMeta::default()
            },
            spec: Default::default(),
            status: None,
        }
    }

    /// Objects that take a number of passes to vanish after their delete.
    #[derive(Default)]
    struct SlowStore {
        /// remaining passes before a deleted object disappears, `None` if not deleted yet
        present: Mutex<HashMap<String, Option<u32>>>,
        linger: HashMap<String, u32>,
        deletes: Mutex<Vec<String>>,
    }

    impl SlowStore {
        fn with(names: &[&str]) -> Self {
            Self {
                present: Mutex::new(names.iter().map(|n| (n.to_string(), None)).collect()),
                ..Self::default()
            }
        }

        fn lingering(mut self, name: &str, passes: u32) -> Self {
            self.linger.insert(name.to_owned(), passes);
            self
        }

        fn tick(&self) {
            let mut present = self.present.lock().unwrap();
            present.retain(|_, remaining| match remaining {
                Some(0) => false,
                Some(n) => {
                    *n -= 1;
                    true
                }
                None => true,
            });
        }
    }

    #[async_trait]
    impl DependentStore for SlowStore {
        async fn exists(&self, dependent: &Dependent) -> Result<bool, Error> {
            Ok(self.present.lock().unwrap().contains_key(&dependent.to_string()))
        }

        async fn delete(&self, dependent: &Dependent) -> Result<(), Error> {
            let key = dependent.to_string();
            self.deletes.lock().unwrap().push(key.clone());
            if let Some(remaining) = self.present.lock().unwrap().get_mut(&key) {
                if remaining.is_none() {
                    *remaining = Some(self.linger.get(&key).copied().unwrap_or(0));
                }
            }
            Ok(())
        }
    }

    #[test]
    fn plan_orders_membership_last() {
        let plan = DeletionPlan::for_membership(Some(&membership()), ADDON, &["root:ws".to_owned()]);
        let kinds: Vec<_> = plan.steps().iter().map(|d| d.kind.clone()).collect();
        assert_eq!(
            kinds,
            vec![
                DependentKind::ManifestWork,
                DependentKind::ManagedClusterAddOn,
                DependentKind::ManagedServiceAccount,
                DependentKind::SyncTarget {
                    workspace: "root:ws".to_owned()
                },
                DependentKind::ManagedCluster,
            ]
        );
        assert_eq!(plan.steps()[0].namespace.as_deref(), Some("rc-abcde"));
        assert_eq!(plan.steps()[4].namespace, None);
        assert_eq!(plan.steps()[4].name, "rc-abcde");
    }

    #[test]
    fn no_membership_means_empty_plan() {
        assert!(DeletionPlan::for_membership(None, ADDON, &[]).steps().is_empty());
    }

    #[test]
    fn membership_deletion_waits_longer() {
        let plan = DeletionPlan::for_membership(Some(&membership()), ADDON, &[]);
        assert_eq!(
            step(&plan.steps()[0], Presence::Present),
            Verdict::Delete {
                requeue_after: Duration::from_secs(1)
            }
        );
        assert_eq!(
            step(&plan.steps()[3], Presence::Present),
            Verdict::Delete {
                requeue_after: Duration::from_secs(5)
            }
        );
        assert_eq!(step(&plan.steps()[3], Presence::Absent), Verdict::Advance);
    }

    #[tokio::test]
    async fn absent_dependents_are_skipped_in_one_pass() {
        let plan = DeletionPlan::for_membership(Some(&membership()), ADDON, &[]);
        let store = SlowStore::with(&["ManagedCluster rc-abcde"]);

        let outcome = run(&plan, &store).await.unwrap();
        assert_eq!(
            outcome,
            Teardown::Requeue {
                step: 3,
                after: MEMBERSHIP_REQUEUE
            }
        );
        assert_eq!(*store.deletes.lock().unwrap(), vec!["ManagedCluster rc-abcde"]);
    }

    #[tokio::test]
    async fn slow_distribution_blocks_membership_deletion() {
        let plan = DeletionPlan::for_membership(Some(&membership()), ADDON, &[]);
        let store = SlowStore::with(&[
            "ManifestWork rc-abcde/cluster-registrar",
            "ManagedClusterAddOn rc-abcde/managed-serviceaccount",
            "ManagedServiceAccount rc-abcde/cluster-registrar",
            "ManagedCluster rc-abcde",
        ])
        .lingering("ManifestWork rc-abcde/cluster-registrar", 3);

        let mut passes = 0;
        loop {
            passes += 1;
            assert!(passes < 20, "teardown did not converge");
            let outcome = run(&plan, &store).await.unwrap();
            if outcome == Teardown::Complete {
                break;
            }
            let deletes = store.deletes.lock().unwrap().clone();
            let work_gone = !store
                .present
                .lock()
                .unwrap()
                .contains_key("ManifestWork rc-abcde/cluster-registrar");
            if !work_gone {
                assert!(
                    deletes.iter().all(|d| d.starts_with("ManifestWork")),
                    "deleted {deletes:?} while the ManifestWork still exists"
                );
            }
            store.tick();
        }

        let deletes = store.deletes.lock().unwrap().clone();
        let first_membership = deletes
            .iter()
            .position(|d| d.starts_with("ManagedCluster "))
            .unwrap();
        let last_work = deletes
            .iter()
            .rposition(|d| d.starts_with("ManifestWork"))
            .unwrap();
        assert!(last_work < first_membership);
        // the work took several passes to vanish and was re-requested each time
        assert!(deletes.iter().filter(|d| d.starts_with("ManifestWork")).count() > 1);
    }

    #[tokio::test]
    async fn errors_other_than_absence_propagate() {
        struct Broken;

        #[async_trait]
        impl DependentStore for Broken {
            async fn exists(&self, _: &Dependent) -> Result<bool, Error> {
                Err(Error::Config("hub unreachable".to_owned()))
            }

            async fn delete(&self, _: &Dependent) -> Result<(), Error> {
                unreachable!()
            }
        }

        let plan = DeletionPlan::for_membership(Some(&membership()), ADDON, &[]);
        assert!(run(&plan, &Broken).await.is_err());
    }
}
