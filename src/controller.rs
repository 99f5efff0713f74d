//! The registration reconciler.
//!
//! Every pass recomputes where a `RegisteredCluster` stands from the objects it
//! can observe and takes at most one provisioning step per missing piece:
//! finalizer, membership, import command, add-on bundle, cluster credential,
//! sync targets, then status. Nothing about progress is kept in memory apart
//! from per-key retry backoff.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use dashmap::DashMap;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{DynamicObject, ObjectMeta};
use kube::runtime::controller::Action;
use kube::runtime::reflector::ObjectRef;
use kube::{Resource, ResourceExt};
use regex::Regex;
use serde_json::json;
use tokio_retry2::strategy::ExponentialFactorBackoff;
use tracing::{debug, info, instrument, warn};

use crate::Error;
use crate::applier::{
    CLUSTER_SECRET_TEMPLATE, IMPORT_SECRET_TEMPLATE, MANAGED_CLUSTER_ADDON_TEMPLATE,
    MANAGED_SERVICE_ACCOUNT_TEMPLATE, MANIFEST_WORK_TEMPLATE, SYNC_TARGET_TEMPLATE, TEMPLATES,
};
use crate::compute::{ComputeClient, workspace_of};
use crate::correlation::CorrelationIndex;
use crate::crds::{
    CONDITION_APPLIED, CONDITION_JOINED, LocalReference, ManagedCluster, ManagedClusterSpec,
    RegisteredCluster,
};
use crate::deletion::{self, AddonNames, DeletionPlan, Dependent, DependentKind, DependentStore, Teardown};
use crate::hub::{HubBinding, HubClient, HubSelector};
use crate::status::{self, is_condition_true};

/// Finalizer holding a registration until its dependents are gone.
pub const FINALIZER: &str = "registrar.homerow.ca/cleanup";

/// Add-on distributing the service account used for cluster credentials.
pub const ADDON_NAME: &str = "managed-serviceaccount";
/// Service account created on each registered cluster.
pub const SERVICE_ACCOUNT_NAME: &str = "cluster-registrar";

pub const IMPORT_CRDS_KEY: &str = "crdsv1.yaml";
pub const IMPORT_KEY: &str = "import.yaml";
pub const TOKEN_KEY: &str = "token";
pub const CA_KEY: &str = "ca.crt";

/// Retry delay for dependents another agent has yet to create.
pub const NOT_FOUND_REQUEUE: Duration = Duration::from_secs(1);
const BACKOFF_BASE_MILLIS: u64 = 500;
const BACKOFF_MAX: Duration = Duration::from_secs(300);

const ADDON: AddonNames<'static> = AddonNames {
    addon: ADDON_NAME,
    service_account: SERVICE_ACCOUNT_NAME,
};

/// Shared state handed to every reconcile.
pub struct Context {
    pub hubs: Arc<dyn HubSelector>,
    pub compute: Arc<dyn ComputeClient>,
    /// Labels matching any of these are not copied onto sync targets.
    pub label_excludes: Vec<Regex>,
    failures: DashMap<ObjectRef<RegisteredCluster>, u32>,
}

impl Context {
    pub fn new(
        hubs: Arc<dyn HubSelector>,
        compute: Arc<dyn ComputeClient>,
        label_excludes: Vec<Regex>,
    ) -> Self {
        Self {
            hubs,
            compute,
            label_excludes,
            failures: DashMap::new(),
        }
    }

    /// Drop the retry state of a registration that no longer exists.
    pub fn forget(&self, key: &ObjectRef<DynamicObject>) {
        let mut registration = ObjectRef::<RegisteredCluster>::new(&key.name);
        if let Some(namespace) = &key.namespace {
            registration = registration.within(namespace);
        }
        self.failures.remove(&registration);
    }
}

#[instrument(skip(rc, ctx), fields(registration = %ObjectRef::from_obj(&*rc)))]
pub async fn reconcile(rc: Arc<RegisteredCluster>, ctx: Arc<Context>) -> Result<Action, Error> {
    let result = reconcile_registration(&rc, &ctx).await;
    if result.is_ok() {
        ctx.failures.remove(&ObjectRef::from_obj(&*rc));
    }
    result
}

pub fn error_policy(rc: Arc<RegisteredCluster>, error: &Error, ctx: Arc<Context>) -> Action {
    let key = ObjectRef::from_obj(&*rc);
    if error.is_not_found() {
        debug!(registration = %key, %error, "waiting for dependent");
        return Action::requeue(NOT_FOUND_REQUEUE);
    }

    let attempts = {
        let mut attempts = ctx.failures.entry(key.clone()).or_insert(0);
        *attempts += 1;
        *attempts
    };
    let delay = backoff_delay(attempts);
    warn!(registration = %key, %error, attempts, ?delay, "reconcile failed");
    Action::requeue(delay)
}

/// Delay before retry number `attempts`, doubling from 500ms up to 5 minutes.
pub fn backoff_delay(attempts: u32) -> Duration {
    // The strategy's own `max_delay` warns on every step past the cap.
    ExponentialFactorBackoff::from_millis(BACKOFF_BASE_MILLIS, 2.0)
        .map(|delay| delay.min(BACKOFF_MAX))
        .nth(attempts.saturating_sub(1) as usize)
        .unwrap_or(BACKOFF_MAX)
}

async fn reconcile_registration(rc: &RegisteredCluster, ctx: &Context) -> Result<Action, Error> {
    let deleting = rc.meta().deletion_timestamp.is_some();
    let finalized = rc.finalizers().iter().any(|f| f == FINALIZER);

    if !finalized {
        if deleting {
            return Ok(Action::await_change());
        }
        ctx.compute.add_finalizer(rc, FINALIZER).await?;
        debug!("added finalizer");
        return Ok(Action::requeue(Duration::ZERO));
    }

    let index = CorrelationIndex::for_registration(rc)?;
    let hub = ctx.hubs.select(index.namespace()).ok_or_else(|| Error::NoHub {
        namespace: index.namespace().to_owned(),
    })?;

    if deleting {
        let membership = find_membership(hub.client.as_ref(), &index).await?;
        return finalize(rc, membership.as_ref(), &hub, ctx).await;
    }

    let membership = ensure_membership(hub.client.as_ref(), &index).await?;
    let joined = membership
        .status
        .as_ref()
        .is_some_and(|s| is_condition_true(&s.conditions, CONDITION_JOINED));
    if !joined {
        debug!(membership = %membership.name_any(), "waiting for cluster to join");
        return Ok(Action::await_change());
    }

    let mut next = rc.status.clone().unwrap_or_default();
    next.import_command_ref = Some(sync_import_command(rc, &index, &membership, &hub, ctx).await?);
    sync_addon(&index, &membership, &hub).await?;
    if let Some(secret_ref) = sync_cluster_secret(rc, &index, &membership, &hub, ctx).await? {
        next.cluster_secret_ref = Some(secret_ref);
    }
    sync_targets(rc, &index, &membership, ctx).await?;

    let next = status::project(&next, &membership);
    if rc.status.as_ref() != Some(&next) {
        ctx.compute.patch_status(rc, &next).await?;
        info!(membership = %membership.name_any(), "updated status");
    }
    Ok(Action::await_change())
}

/// The membership correlated to `index`, if one exists.
async fn find_membership(hub: &dyn HubClient, index: &CorrelationIndex) -> Result<Option<ManagedCluster>, Error> {
    let mut found = hub.list_managed_clusters(&index.selector()).await?;
    match found.len() {
        0 => Ok(None),
        1 => Ok(found.pop()),
        count => Err(Error::DuplicateMembership {
            namespace: index.namespace().to_owned(),
            name: index.name().to_owned(),
            count,
        }),
    }
}

async fn ensure_membership(hub: &dyn HubClient, index: &CorrelationIndex) -> Result<ManagedCluster, Error> {
    if let Some(membership) = find_membership(hub, index).await? {
        return Ok(membership);
    }

    let membership = ManagedCluster {
        metadata: ObjectMeta {
            generate_name: Some(format!("{}-", index.name())),
            labels: Some(index.labels()),
            annotations: Some(index.annotations()),
            ..ObjectMeta::default()
        },
        spec: ManagedClusterSpec {
            hub_accepts_client: true,
            ..ManagedClusterSpec::default()
        },
        status: None,
    };
    let created = hub.create_managed_cluster(&membership).await?;
    info!(membership = %created.name_any(), cluster_set = index.cluster_set(), "created membership");
    Ok(created)
}

/// Shell command importing a cluster from the two import payloads.
pub fn import_command(crds: &[u8], import: &[u8]) -> String {
    format!(
        "echo \"{}\" | base64 --decode | kubectl apply -f - && sleep 2 && echo \"{}\" | base64 --decode | kubectl apply -f -",
        STANDARD.encode(crds),
        STANDARD.encode(import),
    )
}

fn secret_bytes<'a>(secret: &'a Secret, key: &'static str) -> Result<&'a [u8], Error> {
    secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .map(|bytes| bytes.0.as_slice())
        .ok_or_else(|| Error::MissingField {
            kind: "Secret",
            name: secret.name_any(),
            field: key,
        })
}

async fn sync_import_command(
    rc: &RegisteredCluster,
    index: &CorrelationIndex,
    membership: &ManagedCluster,
    hub: &HubBinding,
    ctx: &Context,
) -> Result<LocalReference, Error> {
    let cluster = membership.name_any();
    let source = format!("{cluster}-import");
    let secret = hub
        .client
        .get_secret(&cluster, &source)
        .await?
        .ok_or_else(|| Error::not_found("Secret", &cluster, &source))?;

    let command = import_command(
        secret_bytes(&secret, IMPORT_CRDS_KEY)?,
        secret_bytes(&secret, IMPORT_KEY)?,
    );
    let name = format!("{}-import", rc.name_any());
    let values = json!({
        "name": name,
        "namespace": index.namespace(),
        "owner": owner_reference(rc)?,
        "import_command": STANDARD.encode(command),
        "labels": index.owner_labels(),
    });
    ctx.compute
        .applier_for(workspace_of(rc))?
        .apply_directly(&TEMPLATES, &values, false, Some(index.namespace()), &[IMPORT_SECRET_TEMPLATE])
        .await?;
    Ok(LocalReference::new(name))
}

async fn sync_addon(index: &CorrelationIndex, membership: &ManagedCluster, hub: &HubBinding) -> Result<(), Error> {
    let values = json!({
        "addon_name": ADDON_NAME,
        "service_account_name": SERVICE_ACCOUNT_NAME,
        "cluster_namespace": membership.name_any(),
        "labels": index.owner_labels(),
    });
    hub.applier
        .apply_custom_resources(
            &TEMPLATES,
            &values,
            false,
            None,
            &[
                MANAGED_CLUSTER_ADDON_TEMPLATE,
                MANAGED_SERVICE_ACCOUNT_TEMPLATE,
                MANIFEST_WORK_TEMPLATE,
            ],
        )
        .await?;
    Ok(())
}

/// Publish a kubeconfig for the registered cluster once the add-on has
/// delivered its service account.
async fn sync_cluster_secret(
    rc: &RegisteredCluster,
    index: &CorrelationIndex,
    membership: &ManagedCluster,
    hub: &HubBinding,
    ctx: &Context,
) -> Result<Option<LocalReference>, Error> {
    let cluster = membership.name_any();
    let applied = hub
        .client
        .get_manifest_work(&cluster, SERVICE_ACCOUNT_NAME)
        .await?
        .and_then(|work| work.status)
        .is_some_and(|s| is_condition_true(&s.conditions, CONDITION_APPLIED));
    if !applied {
        debug!(membership = %cluster, "add-on not applied yet");
        return Ok(None);
    }

    let secret = hub
        .client
        .get_secret(&cluster, SERVICE_ACCOUNT_NAME)
        .await?
        .ok_or_else(|| Error::not_found("Secret", &cluster, SERVICE_ACCOUNT_NAME))?;
    let token = secret_bytes(&secret, TOKEN_KEY)?;
    let ca = secret_bytes(&secret, CA_KEY)?;
    let server = status::api_url(membership).ok_or_else(|| Error::MissingField {
        kind: "ManagedCluster",
        name: cluster.clone(),
        field: "spec.managedClusterClientConfigs",
    })?;

    let kubeconfig = kubeconfig_for(&cluster, &server, token, ca)?;
    let name = format!("{}-cluster-secret", rc.name_any());
    let values = json!({
        "name": name,
        "namespace": index.namespace(),
        "owner": owner_reference(rc)?,
        "kubeconfig": STANDARD.encode(kubeconfig),
        "token": STANDARD.encode(token),
        "ca_crt": STANDARD.encode(ca),
        "labels": index.owner_labels(),
    });
    ctx.compute
        .applier_for(workspace_of(rc))?
        .apply_directly(&TEMPLATES, &values, false, Some(index.namespace()), &[CLUSTER_SECRET_TEMPLATE])
        .await?;
    Ok(Some(LocalReference::new(name)))
}

/// Owner reference making the compute-side secrets of `rc` go with it.
fn owner_reference(rc: &RegisteredCluster) -> Result<OwnerReference, Error> {
    rc.controller_owner_ref(&()).ok_or_else(|| Error::MissingField {
        kind: "RegisteredCluster",
        name: rc.name_any(),
        field: "metadata.uid",
    })
}

/// A token-authenticated kubeconfig for `server`.
pub fn kubeconfig_for(cluster: &str, server: &str, token: &[u8], ca: &[u8]) -> Result<String, Error> {
    let token = std::str::from_utf8(token).map_err(|e| {
        Error::Serialization(format!("service account token for {cluster} is not UTF-8: {e}"))
    })?;
    let config = json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{
            "name": cluster,
            "cluster": {
                "server": server,
                "certificate-authority-data": STANDARD.encode(ca),
            },
        }],
        "users": [{
            "name": SERVICE_ACCOUNT_NAME,
            "user": { "token": token },
        }],
        "contexts": [{
            "name": cluster,
            "context": { "cluster": cluster, "user": SERVICE_ACCOUNT_NAME },
        }],
        "current-context": cluster,
    });
    Ok(serde_yaml::to_string(&config)?)
}

/// Labels copied onto a sync target: the registration's, then the
/// membership's, minus excluded keys, with the correlation labels on top.
pub fn sync_target_labels(
    rc: &RegisteredCluster,
    membership: &ManagedCluster,
    index: &CorrelationIndex,
    excludes: &[Regex],
) -> BTreeMap<String, String> {
    let mut labels: BTreeMap<String, String> = rc
        .labels()
        .iter()
        .chain(membership.labels())
        .filter(|(key, _)| !excludes.iter().any(|re| re.is_match(key)))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    labels.extend(index.owner_labels());
    labels
}

async fn sync_targets(
    rc: &RegisteredCluster,
    index: &CorrelationIndex,
    membership: &ManagedCluster,
    ctx: &Context,
) -> Result<(), Error> {
    if rc.spec.location.is_empty() {
        return Ok(());
    }
    let values = json!({
        "name": membership.name_any(),
        "labels": sync_target_labels(rc, membership, index, &ctx.label_excludes),
    });
    for workspace in &rc.spec.location {
        ctx.compute
            .applier_for(Some(workspace.as_str()))?
            .apply_custom_resources(&TEMPLATES, &values, false, None, &[SYNC_TARGET_TEMPLATE])
            .await?;
    }
    Ok(())
}

/// Dependents of one registration across its hub and the compute side.
struct RegistrationDependents<'a> {
    hub: &'a dyn HubClient,
    compute: &'a dyn ComputeClient,
}

#[async_trait::async_trait]
impl DependentStore for RegistrationDependents<'_> {
    async fn exists(&self, dependent: &Dependent) -> Result<bool, Error> {
        match &dependent.kind {
            DependentKind::SyncTarget { workspace } => {
                self.compute.sync_target_exists(workspace, &dependent.name).await
            }
            _ => self.hub.exists(dependent).await,
        }
    }

    async fn delete(&self, dependent: &Dependent) -> Result<(), Error> {
        match &dependent.kind {
            DependentKind::SyncTarget { workspace } => {
                self.compute.delete_sync_target(workspace, &dependent.name).await
            }
            _ => self.hub.delete(dependent).await,
        }
    }
}

async fn finalize(
    rc: &RegisteredCluster,
    membership: Option<&ManagedCluster>,
    hub: &HubBinding,
    ctx: &Context,
) -> Result<Action, Error> {
    let plan = DeletionPlan::for_membership(membership, ADDON, &rc.spec.location);
    let store = RegistrationDependents {
        hub: hub.client.as_ref(),
        compute: ctx.compute.as_ref(),
    };

    match deletion::run(&plan, &store).await? {
        Teardown::Requeue { step, after } => {
            debug!(step, ?after, "teardown in progress");
            Ok(Action::requeue(after))
        }
        Teardown::Complete => {
            ctx.compute.remove_finalizer(rc, FINALIZER).await?;
            info!("dependents removed, released finalizer");
            Ok(Action::await_change())
        }
    }
}
