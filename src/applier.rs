//! Rendering and applying the manifest bundles the controller materializes.
//!
//! The reconciler only sees the [`Applier`] trait. Re-applying identical
//! rendered output must leave the target objects untouched, which server-side
//! apply gives us for free.

use std::sync::Arc;

use async_trait::async_trait;
use kube::api::{Api, DynamicObject, GroupVersionKind, Patch, PatchParams};
use kube::discovery::{self, Scope};
use kube::{Client, ResourceExt};
use minijinja::{AutoEscape, Environment, UndefinedBehavior};
use serde::Deserialize;
use tracing::debug;

use crate::Error;
use crate::throttle::Throttle;

/// Field manager recorded on every object this operator applies.
pub const FIELD_MANAGER: &str = "cluster-registrar";

/// A named collection of embedded manifest templates.
#[derive(Debug)]
pub struct TemplateSet {
    files: &'static [(&'static str, &'static str)],
}

pub const IMPORT_SECRET_TEMPLATE: &str = "compute/import_secret.yaml";
pub const CLUSTER_SECRET_TEMPLATE: &str = "compute/cluster_secret.yaml";
pub const SYNC_TARGET_TEMPLATE: &str = "compute/sync_target.yaml";
pub const MANAGED_CLUSTER_ADDON_TEMPLATE: &str = "hub/managed_cluster_addon.yaml";
pub const MANAGED_SERVICE_ACCOUNT_TEMPLATE: &str = "hub/managed_service_account.yaml";
pub const MANIFEST_WORK_TEMPLATE: &str = "hub/manifest_work.yaml";

pub static TEMPLATES: TemplateSet = TemplateSet {
    files: &[
        (
            IMPORT_SECRET_TEMPLATE,
            include_str!("../templates/compute/import_secret.yaml"),
        ),
        (
            CLUSTER_SECRET_TEMPLATE,
            include_str!("../templates/compute/cluster_secret.yaml"),
        ),
        (
            SYNC_TARGET_TEMPLATE,
            include_str!("../templates/compute/sync_target.yaml"),
        ),
        (
            MANAGED_CLUSTER_ADDON_TEMPLATE,
            include_str!("../templates/hub/managed_cluster_addon.yaml"),
        ),
        (
            MANAGED_SERVICE_ACCOUNT_TEMPLATE,
            include_str!("../templates/hub/managed_service_account.yaml"),
        ),
        (
            MANIFEST_WORK_TEMPLATE,
            include_str!("../templates/hub/manifest_work.yaml"),
        ),
    ],
};

impl TemplateSet {
    pub fn source(&self, file: &str) -> Option<&'static str> {
        self.files
            .iter()
            .find(|(name, _)| *name == file)
            .map(|(_, source)| *source)
    }

    /// Render `file` with `values` into the objects it describes.
    pub fn render(&self, file: &str, values: &serde_json::Value) -> Result<Vec<serde_json::Value>, Error> {
        let source = self
            .source(file)
            .ok_or_else(|| Error::template(file, "no such template"))?;

        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.set_auto_escape_callback(|_| AutoEscape::None);
        let rendered = env
            .render_str(source, values)
            .map_err(|e| Error::template(file, e))?;

        let mut objects = Vec::new();
        for document in serde_yaml::Deserializer::from_str(&rendered) {
            let value = serde_json::Value::deserialize(document)?;
            if !value.is_null() {
                objects.push(value);
            }
        }
        Ok(objects)
    }
}

/// Materializes rendered templates on one control plane.
#[async_trait]
pub trait Applier: Send + Sync {
    /// Apply objects of built-in kinds.
    async fn apply_directly(
        &self,
        templates: &TemplateSet,
        values: &serde_json::Value,
        dry_run: bool,
        namespace_override: Option<&str>,
        files: &[&str],
    ) -> Result<Vec<DynamicObject>, Error>;

    /// Apply objects of kinds served by CRDs.
    async fn apply_custom_resources(
        &self,
        templates: &TemplateSet,
        values: &serde_json::Value,
        dry_run: bool,
        namespace_override: Option<&str>,
        files: &[&str],
    ) -> Result<Vec<DynamicObject>, Error>;
}

/// Applier backed by server-side apply against a kube client.
#[derive(Clone)]
pub struct KubeApplier {
    client: Client,
    throttle: Option<Arc<Throttle>>,
}

impl KubeApplier {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            throttle: None,
        }
    }

    pub fn throttled(client: Client, throttle: Arc<Throttle>) -> Self {
        Self {
            client,
            throttle: Some(throttle),
        }
    }

    async fn apply(
        &self,
        templates: &TemplateSet,
        values: &serde_json::Value,
        dry_run: bool,
        namespace_override: Option<&str>,
        files: &[&str],
        builtin_only: bool,
    ) -> Result<Vec<DynamicObject>, Error> {
        let mut params = PatchParams::apply(FIELD_MANAGER).force();
        params.dry_run = dry_run;

        let mut applied = Vec::new();
        for file in files {
            for value in templates.render(file, values)? {
                let mut object: DynamicObject = serde_json::from_value(value)?;
                let gvk = gvk_of(&object, file)?;
                if builtin_only && !is_builtin_group(&gvk.group) {
                    return Err(Error::template(
                        *file,
                        format!("{} is not a built-in kind", gvk.kind),
                    ));
                }

                if let Some(throttle) = &self.throttle {
                    throttle.acquire().await;
                }
                let (resource, capabilities) = discovery::pinned_kind(&self.client, &gvk).await?;
                let api: Api<DynamicObject> = match capabilities.scope {
                    Scope::Namespaced => {
                        let namespace = namespace_override
                            .map(str::to_owned)
                            .or_else(|| object.namespace())
                            .unwrap_or_else(|| self.client.default_namespace().to_owned());
                        object.metadata.namespace = Some(namespace.clone());
                        Api::namespaced_with(self.client.clone(), &namespace, &resource)
                    }
                    Scope::Cluster => Api::all_with(self.client.clone(), &resource),
                };

                let name = object.name_any();
                debug!(kind = %gvk.kind, %name, dry_run, "applying");
                if let Some(throttle) = &self.throttle {
                    throttle.acquire().await;
                }
                applied.push(api.patch(&name, &params, &Patch::Apply(&object)).await?);
            }
        }
        Ok(applied)
    }
}

#[async_trait]
impl Applier for KubeApplier {
    async fn apply_directly(
        &self,
        templates: &TemplateSet,
        values: &serde_json::Value,
        dry_run: bool,
        namespace_override: Option<&str>,
        files: &[&str],
    ) -> Result<Vec<DynamicObject>, Error> {
        self.apply(templates, values, dry_run, namespace_override, files, true)
            .await
    }

    async fn apply_custom_resources(
        &self,
        templates: &TemplateSet,
        values: &serde_json::Value,
        dry_run: bool,
        namespace_override: Option<&str>,
        files: &[&str],
    ) -> Result<Vec<DynamicObject>, Error> {
        self.apply(templates, values, dry_run, namespace_override, files, false)
            .await
    }
}

fn gvk_of(object: &DynamicObject, file: &str) -> Result<GroupVersionKind, Error> {
    let types = object
        .types
        .as_ref()
        .ok_or_else(|| Error::template(file, "rendered object has no apiVersion/kind"))?;
    let (group, version) = match types.api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", types.api_version.as_str()),
    };
    Ok(GroupVersionKind::gvk(group, version, &types.kind))
}

fn is_builtin_group(group: &str) -> bool {
    group.is_empty() || !group.contains('.') || group.ends_with(".k8s.io")
}
