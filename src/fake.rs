//! In-memory stand-ins for the hub and compute control planes.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{DynamicObject, ObjectMeta};
use kube::ResourceExt;

use crate::Error;
use crate::applier::{Applier, TemplateSet};
use crate::compute::ComputeClient;
use crate::crds::{ManagedCluster, ManifestWork, RegisteredCluster, RegisteredClusterStatus};
use crate::deletion::{Dependent, DependentKind};
use crate::hub::HubClient;

/// Records applied objects. Re-applying identical content is not a write.
#[derive(Default)]
pub struct FakeApplier {
    objects: Mutex<BTreeMap<String, serde_json::Value>>,
    writes: Mutex<usize>,
}

impl FakeApplier {
    pub fn writes(&self) -> usize {
        *self.writes.lock().unwrap()
    }

    /// Applied object by `<kind> <namespace>/<name>` or `<kind> <name>`.
    pub fn object(&self, key: &str) -> Option<serde_json::Value> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    fn apply(
        &self,
        templates: &TemplateSet,
        values: &serde_json::Value,
        namespace_override: Option<&str>,
        files: &[&str],
    ) -> Result<Vec<DynamicObject>, Error> {
        let mut applied = Vec::new();
        for file in files {
            for mut value in templates.render(file, values)? {
                if let Some(namespace) = namespace_override {
                    value["metadata"]["namespace"] = serde_json::Value::from(namespace);
                }
                let kind = value["kind"].as_str().unwrap_or_default().to_owned();
                let name = value["metadata"]["name"].as_str().unwrap_or_default().to_owned();
                let key = match value["metadata"]["namespace"].as_str() {
                    Some(namespace) => format!("{kind} {namespace}/{name}"),
                    None => format!("{kind} {name}"),
                };

                let previous = self.objects.lock().unwrap().insert(key, value.clone());
                if previous.as_ref() != Some(&value) {
                    *self.writes.lock().unwrap() += 1;
                }
                applied.push(serde_json::from_value(value)?);
            }
        }
        Ok(applied)
    }
}

#[async_trait]
impl Applier for FakeApplier {
    async fn apply_directly(
        &self,
        templates: &TemplateSet,
        values: &serde_json::Value,
        _dry_run: bool,
        namespace_override: Option<&str>,
        files: &[&str],
    ) -> Result<Vec<DynamicObject>, Error> {
        self.apply(templates, values, namespace_override, files)
    }

    async fn apply_custom_resources(
        &self,
        templates: &TemplateSet,
        values: &serde_json::Value,
        _dry_run: bool,
        namespace_override: Option<&str>,
        files: &[&str],
    ) -> Result<Vec<DynamicObject>, Error> {
        self.apply(templates, values, namespace_override, files)
    }
}

#[derive(Default)]
struct HubState {
    clusters: Vec<ManagedCluster>,
    secrets: HashMap<(String, String), Secret>,
    works: HashMap<(String, String), ManifestWork>,
    /// Other dependents, by display name.
    present: BTreeSet<String>,
    /// Deletes that have been requested but not yet carried out.
    lingering: HashMap<String, u32>,
    deletes: Vec<String>,
    writes: usize,
    generated: usize,
}

/// A hub holding memberships, secrets and manifest works in memory.
#[derive(Default)]
pub struct FakeHub {
    state: Mutex<HubState>,
}

impl FakeHub {
    pub fn writes(&self) -> usize {
        self.state.lock().unwrap().writes
    }

    pub fn deletes(&self) -> Vec<String> {
        self.state.lock().unwrap().deletes.clone()
    }

    pub fn clusters(&self) -> Vec<ManagedCluster> {
        self.state.lock().unwrap().clusters.clone()
    }

    pub fn insert_cluster(&self, cluster: ManagedCluster) {
        self.state.lock().unwrap().clusters.push(cluster);
    }

    /// Replace the membership of the same name, as the join agent would.
    pub fn update_cluster(&self, cluster: ManagedCluster) {
        let mut state = self.state.lock().unwrap();
        if let Some(existing) = state
            .clusters
            .iter_mut()
            .find(|c| c.name_any() == cluster.name_any())
        {
            *existing = cluster;
        }
    }

    pub fn insert_secret(&self, namespace: &str, name: &str, data: &[(&str, &[u8])]) {
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.to_owned()),
                namespace: Some(namespace.to_owned()),
                ..ObjectMeta::default()
            },
            data: Some(
                data.iter()
                    .map(|(k, v)| (k.to_string(), ByteString(v.to_vec())))
                    .collect(),
            ),
            ..Secret::default()
        };
        self.state
            .lock()
            .unwrap()
            .secrets
            .insert((namespace.to_owned(), name.to_owned()), secret);
    }

    pub fn insert_work(&self, work: ManifestWork) {
        let key = (work.namespace().unwrap_or_default(), work.name_any());
        let mut state = self.state.lock().unwrap();
        state.present.insert(format!("ManifestWork {}/{}", key.0, key.1));
        state.works.insert(key, work);
    }

    pub fn insert_dependent(&self, display: &str) {
        self.state.lock().unwrap().present.insert(display.to_owned());
    }

    /// Make the next delete of `display` take `passes` extra checks to land.
    pub fn linger(&self, display: &str, passes: u32) {
        self.state
            .lock()
            .unwrap()
            .lingering
            .insert(display.to_owned(), passes);
    }
}

fn matches_selector(cluster: &ManagedCluster, selector: &str) -> bool {
    selector.split(',').filter(|s| !s.is_empty()).all(|term| {
        let (key, value) = term.split_once('=').unwrap_or((term, ""));
        cluster.labels().get(key).map(String::as_str) == Some(value)
    })
}

#[async_trait]
impl HubClient for FakeHub {
    async fn list_managed_clusters(&self, selector: &str) -> Result<Vec<ManagedCluster>, Error> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .clusters
            .iter()
            .filter(|c| matches_selector(c, selector))
            .cloned()
            .collect())
    }

    async fn create_managed_cluster(&self, cluster: &ManagedCluster) -> Result<ManagedCluster, Error> {
        let mut state = self.state.lock().unwrap();
        state.generated += 1;
        state.writes += 1;
        let mut created = cluster.clone();
        let prefix = cluster.metadata.generate_name.clone().unwrap_or_default();
        created.metadata.name = Some(format!("{prefix}{:05}", state.generated));
        created.metadata.uid = Some(format!("uid-{}", state.generated));
        state.clusters.push(created.clone());
        Ok(created)
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error> {
        let key = (namespace.to_owned(), name.to_owned());
        Ok(self.state.lock().unwrap().secrets.get(&key).cloned())
    }

    async fn get_manifest_work(&self, namespace: &str, name: &str) -> Result<Option<ManifestWork>, Error> {
        let key = (namespace.to_owned(), name.to_owned());
        Ok(self.state.lock().unwrap().works.get(&key).cloned())
    }

    async fn exists(&self, dependent: &Dependent) -> Result<bool, Error> {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        let display = dependent.to_string();
        if state.deletes.contains(&display) {
            match state.lingering.get(&display).copied() {
                Some(0) => {
                    state.lingering.remove(&display);
                    remove(state, dependent);
                }
                Some(remaining) => {
                    state.lingering.insert(display.clone(), remaining - 1);
                }
                None => {}
            }
        }
        Ok(match dependent.kind {
            DependentKind::ManagedCluster => state.clusters.iter().any(|c| c.name_any() == dependent.name),
            _ => state.present.contains(&display),
        })
    }

    async fn delete(&self, dependent: &Dependent) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let display = dependent.to_string();
        state.deletes.push(display.clone());
        state.writes += 1;
        if !state.lingering.contains_key(&display) {
            remove(&mut state, dependent);
        }
        Ok(())
    }
}

fn remove(state: &mut HubState, dependent: &Dependent) {
    match dependent.kind {
        DependentKind::ManagedCluster => state.clusters.retain(|c| c.name_any() != dependent.name),
        DependentKind::ManifestWork => {
            let key = (dependent.namespace.clone().unwrap_or_default(), dependent.name.clone());
            state.works.remove(&key);
            state.present.remove(&dependent.to_string());
        }
        _ => {
            state.present.remove(&dependent.to_string());
        }
    }
}

#[derive(Default)]
struct ComputeState {
    finalizers: Vec<(String, String)>,
    statuses: Vec<RegisteredClusterStatus>,
    sync_targets: BTreeSet<(String, String)>,
    writes: usize,
}

/// A compute side that records writes and hands out one shared applier.
#[derive(Default)]
pub struct FakeCompute {
    state: Mutex<ComputeState>,
    pub applier: Arc<FakeApplier>,
}

impl FakeCompute {
    pub fn writes(&self) -> usize {
        self.state.lock().unwrap().writes + self.applier.writes()
    }

    /// Finalizer operations as `(op, finalizer)`.
    pub fn finalizer_ops(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().finalizers.clone()
    }

    pub fn last_status(&self) -> Option<RegisteredClusterStatus> {
        self.state.lock().unwrap().statuses.last().cloned()
    }

    pub fn insert_sync_target(&self, workspace: &str, name: &str) {
        self.state
            .lock()
            .unwrap()
            .sync_targets
            .insert((workspace.to_owned(), name.to_owned()));
    }
}

#[async_trait]
impl ComputeClient for FakeCompute {
    async fn add_finalizer(&self, _rc: &RegisteredCluster, finalizer: &str) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.finalizers.push(("add".to_owned(), finalizer.to_owned()));
        state.writes += 1;
        Ok(())
    }

    async fn remove_finalizer(&self, _rc: &RegisteredCluster, finalizer: &str) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.finalizers.push(("remove".to_owned(), finalizer.to_owned()));
        state.writes += 1;
        Ok(())
    }

    async fn patch_status(
        &self,
        _rc: &RegisteredCluster,
        status: &RegisteredClusterStatus,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.statuses.push(status.clone());
        state.writes += 1;
        Ok(())
    }

    fn applier_for(&self, _workspace: Option<&str>) -> Result<Arc<dyn Applier>, Error> {
        Ok(self.applier.clone())
    }

    async fn sync_target_exists(&self, workspace: &str, name: &str) -> Result<bool, Error> {
        let key = (workspace.to_owned(), name.to_owned());
        Ok(self.state.lock().unwrap().sync_targets.contains(&key))
    }

    async fn delete_sync_target(&self, workspace: &str, name: &str) -> Result<(), Error> {
        let key = (workspace.to_owned(), name.to_owned());
        let mut state = self.state.lock().unwrap();
        state.sync_targets.remove(&key);
        state.writes += 1;
        Ok(())
    }
}
