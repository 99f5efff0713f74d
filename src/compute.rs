//! Clients for the compute-side control plane serving `RegisteredCluster`s.
//!
//! Registrations are served through the virtual workspace of an APIExport.
//! The controller watches that endpoint across all workspaces and writes back
//! through clients scoped to one workspace at `<url>/clusters/<workspace>`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, anyhow, bail};
use async_trait::async_trait;
use dashmap::DashMap;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Resource, ResourceExt};
use serde_json::json;
use tokio_retry2::strategy::{ExponentialBackoff, jitter};
use tokio_retry2::{Retry, RetryError};
use tracing::{debug, info, warn};

use crate::Error;
use crate::applier::{Applier, FIELD_MANAGER, KubeApplier};
use crate::crds::{APIExport, ClusterRegistrar, RegisteredCluster, RegisteredClusterStatus, SyncTarget};
use crate::error::is_kube_not_found;
use crate::hub::{KUBECONFIG_KEY, secret_value};

/// Writes the controller makes on the compute side.
#[async_trait]
pub trait ComputeClient: Send + Sync {
    /// Append `finalizer` to the registration's finalizers.
    async fn add_finalizer(&self, rc: &RegisteredCluster, finalizer: &str) -> Result<(), Error>;

    async fn remove_finalizer(&self, rc: &RegisteredCluster, finalizer: &str) -> Result<(), Error>;

    /// Apply `status` as the whole status subresource; spec and metadata are untouched.
    async fn patch_status(
        &self,
        rc: &RegisteredCluster,
        status: &RegisteredClusterStatus,
    ) -> Result<(), Error>;

    /// Applier writing into `workspace`, or the export endpoint itself for `None`.
    fn applier_for(&self, workspace: Option<&str>) -> Result<Arc<dyn Applier>, Error>;

    async fn sync_target_exists(&self, workspace: &str, name: &str) -> Result<bool, Error>;

    async fn delete_sync_target(&self, workspace: &str, name: &str) -> Result<(), Error>;
}

/// Clients rooted at the virtual workspace of the compute APIExport.
pub struct ComputeClientSet {
    /// Client for the export endpoint, spanning every workspace.
    client: Client,
    config: kube::Config,
    scoped: DashMap<String, Client>,
}

impl ComputeClientSet {
    /// Resolve the export endpoint from the `ClusterRegistrar` singleton and
    /// build clients for it.
    pub async fn connect(controller: &Client, namespace: &str, export_name: &str) -> anyhow::Result<Self> {
        let registrars: Api<ClusterRegistrar> = Api::all(controller.clone());
        let mut registrars = registrars
            .list(&ListParams::default())
            .await
            .context("listing ClusterRegistrars")?
            .items;
        if registrars.len() != 1 {
            bail!("expected exactly one ClusterRegistrar, found {}", registrars.len());
        }
        let registrar = registrars.remove(0);
        let secret_name = &registrar.spec.compute_service.compute_kubeconfig_secret_ref.name;

        let secrets: Api<Secret> = Api::namespaced(controller.clone(), namespace);
        let secret = secrets
            .get(secret_name)
            .await
            .with_context(|| format!("reading compute kubeconfig secret {namespace}/{secret_name}"))?;
        let kubeconfig = Kubeconfig::from_yaml(&secret_value(&secret, KUBECONFIG_KEY)?)
            .context("parsing compute kubeconfig")?;
        let org_config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .context("building compute client config")?;
        let org_client = Client::try_from(org_config.clone()).context("building compute client")?;

        let url = lookup_export_url(&org_client, export_name).await?;
        info!(export = export_name, %url, "resolved compute virtual workspace");

        Self::for_url(&org_config, &url)
    }

    fn for_url(base: &kube::Config, url: &str) -> anyhow::Result<Self> {
        let mut config = base.clone();
        config.cluster_url = url.parse().with_context(|| format!("invalid export URL {url}"))?;
        let client = Client::try_from(config.clone()).context("building virtual workspace client")?;
        Ok(Self {
            client,
            config,
            scoped: DashMap::new(),
        })
    }

    /// Client spanning every workspace behind the export.
    pub fn client(&self) -> Client {
        self.client.clone()
    }

    /// Client scoped to `workspace`, or the export-wide client for `None`.
    pub fn client_for(&self, workspace: Option<&str>) -> Result<Client, Error> {
        let Some(workspace) = workspace else {
            return Ok(self.client.clone());
        };
        if let Some(client) = self.scoped.get(workspace) {
            return Ok(client.clone());
        }

        let mut config = self.config.clone();
        config.cluster_url = workspace_url(&self.config.cluster_url.to_string(), workspace)
            .parse()
            .map_err(|e| Error::Config(format!("workspace {workspace}: {e}")))?;
        let client = Client::try_from(config)?;
        self.scoped.insert(workspace.to_owned(), client.clone());
        Ok(client)
    }

    fn registrations(&self, rc: &RegisteredCluster) -> Result<Api<RegisteredCluster>, Error> {
        let namespace = rc.namespace().ok_or_else(|| Error::MissingField {
            kind: "RegisteredCluster",
            name: rc.name_any(),
            field: "metadata.namespace",
        })?;
        let client = self.client_for(workspace_of(rc))?;
        Ok(Api::namespaced(client, &namespace))
    }

    async fn patch_finalizers(&self, rc: &RegisteredCluster, finalizers: Vec<String>) -> Result<(), Error> {
        let patch = json!({
            "metadata": {
                "finalizers": finalizers,
                "resourceVersion": rc.resource_version(),
            }
        });
        self.registrations(rc)?
            .patch(&rc.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// Workspace a registration was served from, when served through a virtual
/// workspace.
pub fn workspace_of(rc: &RegisteredCluster) -> Option<&str> {
    rc.annotations()
        .get(crate::crds::LOGICAL_CLUSTER_ANNOTATION)
        .map(String::as_str)
}

/// URL of `workspace` behind the virtual workspace at `base`.
pub fn workspace_url(base: &str, workspace: &str) -> String {
    format!("{}/clusters/{workspace}", base.trim_end_matches('/'))
}

/// Server-side apply body for a registration's status.
///
/// Collections are always present so that entries the membership dropped are
/// removed; unset optional fields are released by omission.
pub fn status_apply(status: &RegisteredClusterStatus) -> serde_json::Value {
    json!({
        "apiVersion": RegisteredCluster::api_version(&()),
        "kind": RegisteredCluster::kind(&()),
        "status": status,
    })
}

/// First published virtual workspace of `export`.
pub fn export_url(export: &APIExport) -> Option<&str> {
    export
        .status
        .as_ref()?
        .virtual_workspaces
        .first()
        .map(|vw| vw.url.as_str())
        .filter(|url| !url.is_empty())
}

/// Read the export's endpoint, retrying while it has none published yet.
async fn lookup_export_url(client: &Client, export_name: &str) -> anyhow::Result<String> {
    let exports: Api<APIExport> = Api::all(client.clone());
    let strategy = ExponentialBackoff::from_millis(100)
        .max_delay(Duration::from_secs(5))
        .map(jitter)
        .take(8);

    Retry::spawn(strategy, async || -> Result<String, RetryError<anyhow::Error>> {
        match exports.get_opt(export_name).await {
            Ok(Some(export)) => match export_url(&export) {
                Some(url) => Ok(url.to_owned()),
                None => {
                    debug!(export = export_name, "APIExport has no virtual workspace yet");
                    Err(RetryError::transient(anyhow!(
                        "APIExport {export_name} has no virtual workspace URL"
                    )))
                }
            },
            Ok(None) => Err(RetryError::permanent(anyhow!("APIExport {export_name} not found"))),
            Err(e) => {
                warn!(export = export_name, error = %e, "looking up APIExport");
                Err(RetryError::transient(e.into()))
            }
        }
    })
    .await
}

#[async_trait]
impl ComputeClient for ComputeClientSet {
    async fn add_finalizer(&self, rc: &RegisteredCluster, finalizer: &str) -> Result<(), Error> {
        let mut finalizers = rc.finalizers().to_vec();
        if finalizers.iter().any(|f| f == finalizer) {
            return Ok(());
        }
        finalizers.push(finalizer.to_owned());
        self.patch_finalizers(rc, finalizers).await
    }

    async fn remove_finalizer(&self, rc: &RegisteredCluster, finalizer: &str) -> Result<(), Error> {
        let finalizers: Vec<String> = rc
            .finalizers()
            .iter()
            .filter(|f| *f != finalizer)
            .cloned()
            .collect();
        if finalizers.len() == rc.finalizers().len() {
            return Ok(());
        }
        self.patch_finalizers(rc, finalizers).await
    }

    async fn patch_status(
        &self,
        rc: &RegisteredCluster,
        status: &RegisteredClusterStatus,
    ) -> Result<(), Error> {
        let patch = status_apply(status);
        self.registrations(rc)?
            .patch_status(&rc.name_any(), &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(&patch))
            .await?;
        Ok(())
    }

    fn applier_for(&self, workspace: Option<&str>) -> Result<Arc<dyn Applier>, Error> {
        Ok(Arc::new(KubeApplier::new(self.client_for(workspace)?)))
    }

    async fn sync_target_exists(&self, workspace: &str, name: &str) -> Result<bool, Error> {
        let api: Api<SyncTarget> = Api::all(self.client_for(Some(workspace))?);
        Ok(api.get_opt(name).await?.is_some())
    }

    async fn delete_sync_target(&self, workspace: &str, name: &str) -> Result<(), Error> {
        let api: Api<SyncTarget> = Api::all(self.client_for(Some(workspace))?);
        match api.delete(name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(e) if is_kube_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
