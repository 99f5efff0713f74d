//! Connections to the hub control planes that own cluster memberships.
//!
//! The set of hubs is read once at startup from the `HubConfig`s in the
//! operator namespace. Bring-up is all-or-nothing: one unusable descriptor
//! aborts the process.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use anyhow::{Context as _, anyhow};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use k8s_openapi::NamespaceResourceScope;
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tracing::{info, warn};

use crate::Error;
use crate::applier::{Applier, KubeApplier};
use crate::crds::{
    HubConfig, ManagedCluster, ManagedClusterAddOn, ManagedServiceAccount, ManifestWork,
};
use crate::deletion::{Dependent, DependentKind};
use crate::error::is_kube_not_found;
use crate::throttle::Throttle;

/// Secret key holding a serialized kubeconfig.
pub const KUBECONFIG_KEY: &str = "kubeconfig";

/// Reads and writes the hub-side objects the reconciler touches.
#[async_trait]
pub trait HubClient: Send + Sync {
    /// List memberships matching a label selector.
    async fn list_managed_clusters(&self, selector: &str) -> Result<Vec<ManagedCluster>, Error>;

    async fn create_managed_cluster(&self, cluster: &ManagedCluster) -> Result<ManagedCluster, Error>;

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error>;

    async fn get_manifest_work(&self, namespace: &str, name: &str) -> Result<Option<ManifestWork>, Error>;

    /// Whether a hub-side dependent still exists.
    async fn exists(&self, dependent: &Dependent) -> Result<bool, Error>;

    /// Delete a hub-side dependent. Already gone counts as success.
    async fn delete(&self, dependent: &Dependent) -> Result<(), Error>;
}

/// [`HubClient`] backed by a kube client, rate limited per hub.
#[derive(Clone)]
pub struct KubeHubClient {
    client: Client,
    throttle: Arc<Throttle>,
}

impl KubeHubClient {
    pub fn new(client: Client, throttle: Arc<Throttle>) -> Self {
        Self { client, throttle }
    }

    fn namespaced<K>(&self, dependent: &Dependent) -> Result<Api<K>, Error>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
    {
        let namespace = dependent.namespace.as_deref().ok_or_else(|| Error::MissingField {
            kind: "Dependent",
            name: dependent.name.clone(),
            field: "namespace",
        })?;
        Ok(Api::namespaced(self.client.clone(), namespace))
    }

    async fn exists_in<K>(&self, api: Api<K>, name: &str) -> Result<bool, Error>
    where
        K: Resource + Clone + DeserializeOwned + Debug,
    {
        self.throttle.acquire().await;
        Ok(api.get_opt(name).await?.is_some())
    }

    async fn delete_in<K>(&self, api: Api<K>, name: &str) -> Result<(), Error>
    where
        K: Resource + Clone + DeserializeOwned + Debug,
    {
        self.throttle.acquire().await;
        match api.delete(name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(e) if is_kube_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn unsupported(dependent: &Dependent) -> Error {
    Error::Config(format!("{dependent} does not live on a hub"))
}

#[async_trait]
impl HubClient for KubeHubClient {
    async fn list_managed_clusters(&self, selector: &str) -> Result<Vec<ManagedCluster>, Error> {
        self.throttle.acquire().await;
        let api: Api<ManagedCluster> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default().labels(selector)).await?.items)
    }

    async fn create_managed_cluster(&self, cluster: &ManagedCluster) -> Result<ManagedCluster, Error> {
        self.throttle.acquire().await;
        let api: Api<ManagedCluster> = Api::all(self.client.clone());
        Ok(api.create(&PostParams::default(), cluster).await?)
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error> {
        self.throttle.acquire().await;
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_manifest_work(&self, namespace: &str, name: &str) -> Result<Option<ManifestWork>, Error> {
        self.throttle.acquire().await;
        let api: Api<ManifestWork> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn exists(&self, dependent: &Dependent) -> Result<bool, Error> {
        let name = &dependent.name;
        match dependent.kind {
            DependentKind::ManifestWork => {
                self.exists_in(self.namespaced::<ManifestWork>(dependent)?, name).await
            }
            DependentKind::ManagedClusterAddOn => {
                self.exists_in(self.namespaced::<ManagedClusterAddOn>(dependent)?, name)
                    .await
            }
            DependentKind::ManagedServiceAccount => {
                self.exists_in(self.namespaced::<ManagedServiceAccount>(dependent)?, name)
                    .await
            }
            DependentKind::ManagedCluster => {
                self.exists_in(Api::<ManagedCluster>::all(self.client.clone()), name)
                    .await
            }
            DependentKind::SyncTarget { .. } => Err(unsupported(dependent)),
        }
    }

    async fn delete(&self, dependent: &Dependent) -> Result<(), Error> {
        let name = &dependent.name;
        match dependent.kind {
            DependentKind::ManifestWork => {
                self.delete_in(self.namespaced::<ManifestWork>(dependent)?, name).await
            }
            DependentKind::ManagedClusterAddOn => {
                self.delete_in(self.namespaced::<ManagedClusterAddOn>(dependent)?, name)
                    .await
            }
            DependentKind::ManagedServiceAccount => {
                self.delete_in(self.namespaced::<ManagedServiceAccount>(dependent)?, name)
                    .await
            }
            DependentKind::ManagedCluster => {
                self.delete_in(Api::<ManagedCluster>::all(self.client.clone()), name)
                    .await
            }
            DependentKind::SyncTarget { .. } => Err(unsupported(dependent)),
        }
    }
}

/// A live connection to one hub.
pub struct HubBinding {
    pub name: String,
    pub config: HubConfig,
    pub client: Arc<dyn HubClient>,
    pub applier: Arc<dyn Applier>,
    /// Raw client used to watch the hub. Absent for bindings built in tests.
    pub kube: Option<Client>,
}

impl HubBinding {
    /// Connect to the hub described by `config`, reading its credential secret
    /// through `client`.
    pub async fn connect(client: &Client, config: HubConfig) -> anyhow::Result<Self> {
        let name = config.name_any();
        let namespace = config
            .namespace()
            .ok_or_else(|| anyhow!("HubConfig {name} has no namespace"))?;
        let secret_name = &config.spec.kube_config_secret_ref.name;

        let secrets: Api<Secret> = Api::namespaced(client.clone(), &namespace);
        let secret = secrets
            .get(secret_name)
            .await
            .with_context(|| format!("reading secret {namespace}/{secret_name} for hub {name}"))?;
        let kubeconfig = secret_value(&secret, KUBECONFIG_KEY)
            .with_context(|| format!("secret {namespace}/{secret_name} for hub {name}"))?;

        let kubeconfig = Kubeconfig::from_yaml(&kubeconfig)
            .with_context(|| format!("parsing kubeconfig for hub {name}"))?;
        let kube_config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .with_context(|| format!("building client config for hub {name}"))?;
        let hub_client = Client::try_from(kube_config)
            .with_context(|| format!("building client for hub {name}"))?;

        let qps = config
            .spec
            .effective_qps()
            .with_context(|| format!("HubConfig {name} has an invalid qps {:?}", config.spec.qps))?;
        let throttle = Arc::new(Throttle::new(config.spec.effective_burst(), qps));

        info!(hub = %name, burst = config.spec.effective_burst(), qps, "bound hub");
        Ok(Self {
            name,
            client: Arc::new(KubeHubClient::new(hub_client.clone(), throttle.clone())),
            applier: Arc::new(KubeApplier::throttled(hub_client.clone(), throttle)),
            kube: Some(hub_client),
            config,
        })
    }
}

/// Read `key` from a secret as UTF-8, from `data` or `stringData`.
pub fn secret_value(secret: &Secret, key: &str) -> anyhow::Result<String> {
    if let Some(bytes) = secret.data.as_ref().and_then(|d| d.get(key)) {
        return String::from_utf8(bytes.0.clone()).with_context(|| format!("key {key} is not UTF-8"));
    }
    secret
        .string_data
        .as_ref()
        .and_then(|d| d.get(key))
        .cloned()
        .ok_or_else(|| anyhow!("missing key {key}"))
}

/// Chooses the hub serving a registration.
pub trait HubSelector: Send + Sync {
    fn select(&self, namespace: &str) -> Option<Arc<HubBinding>>;
}

/// Immutable, name-indexed set of hub bindings in discovery order.
#[derive(Clone, Default)]
pub struct HubRegistry {
    bindings: Vec<Arc<HubBinding>>,
    index: HashMap<String, usize>,
}

impl HubRegistry {
    /// Bind every `HubConfig` in `namespace`.
    pub async fn build(client: &Client, namespace: &str) -> anyhow::Result<Self> {
        let api: Api<HubConfig> = Api::namespaced(client.clone(), namespace);
        let configs = api
            .list(&ListParams::default())
            .await
            .with_context(|| format!("listing HubConfigs in {namespace}"))?;

        let mut bindings = Vec::with_capacity(configs.items.len());
        for config in configs.items {
            bindings.push(HubBinding::connect(client, config).await?);
        }
        if bindings.is_empty() {
            warn!(%namespace, "no HubConfig found, registrations will not progress");
        }
        Ok(Self::from_bindings(bindings))
    }

    pub fn from_bindings(bindings: impl IntoIterator<Item = HubBinding>) -> Self {
        let mut registry = Self::default();
        for binding in bindings {
            registry = registry.rebind(binding);
        }
        registry
    }

    pub fn get(&self, name: &str) -> Option<Arc<HubBinding>> {
        self.index.get(name).map(|&i| self.bindings[i].clone())
    }

    pub fn bindings(&self) -> &[Arc<HubBinding>] {
        &self.bindings
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// A registry with `binding` replacing the one of the same name, or
    /// appended when the name is new.
    pub fn rebind(&self, binding: HubBinding) -> Self {
        let mut next = self.clone();
        let binding = Arc::new(binding);
        match next.index.get(&binding.name) {
            Some(&i) => next.bindings[i] = binding,
            None => {
                next.index.insert(binding.name.clone(), next.bindings.len());
                next.bindings.push(binding);
            }
        }
        next
    }

    /// The hub serving registrations in `namespace`.
    ///
    /// Always the first bound hub; the namespace is not consulted yet.
    pub fn get_hub_cluster(&self, _namespace: &str) -> Option<Arc<HubBinding>> {
        self.bindings.first().cloned()
    }
}

impl HubSelector for HubRegistry {
    fn select(&self, namespace: &str) -> Option<Arc<HubBinding>> {
        self.get_hub_cluster(namespace)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::ByteString;
    use kube::api::ObjectMeta;

    use super::*;
    use crate::fake::{FakeApplier, FakeHub};

    fn binding(name: &str, burst: u32) -> HubBinding {
        let mut config = HubConfig::new(name, Default::default());
        config.spec.burst = burst;
        HubBinding {
            name: name.to_owned(),
            config,
            client: Arc::new(FakeHub::default()),
            applier: Arc::new(FakeApplier::default()),
            kube: None,
        }
    }

    #[test]
    fn selection_always_resolves_to_the_first_hub() {
        let registry = HubRegistry::from_bindings([binding("east", 0), binding("west", 0)]);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.select("anything").unwrap().name, "east");
        assert_eq!(registry.select("other").unwrap().name, "east");
        assert_eq!(registry.get("west").unwrap().name, "west");
        assert!(registry.get("north").is_none());
    }

    #[test]
    fn empty_registry_selects_nothing() {
        assert!(HubRegistry::default().select("default").is_none());
    }

    #[test]
    fn rebind_replaces_in_place_without_touching_the_original() {
        let registry = HubRegistry::from_bindings([binding("east", 0), binding("west", 0)]);
        let rotated = registry.rebind(binding("east", 7));

        assert_eq!(rotated.len(), 2);
        assert_eq!(rotated.bindings()[0].config.spec.burst, 7);
        assert_eq!(rotated.bindings()[1].name, "west");
        assert_eq!(registry.get("east").unwrap().config.spec.burst, 0);
    }

    #[test]
    fn reads_secret_keys_from_data_or_string_data() {
        let secret = Secret {
            metadata: ObjectMeta::default(),
            data: Some(BTreeMap::from([(
                KUBECONFIG_KEY.to_owned(),
                ByteString(b"apiVersion: v1".to_vec()),
            )])),
            string_data: Some(BTreeMap::from([("token".to_owned(), "abc".to_owned())])),
            ..Secret::default()
        };
        assert_eq!(secret_value(&secret, KUBECONFIG_KEY).unwrap(), "apiVersion: v1");
        assert_eq!(secret_value(&secret, "token").unwrap(), "abc");
        assert!(secret_value(&secret, "ca.crt").is_err());
    }
}
