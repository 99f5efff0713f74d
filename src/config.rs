//! Runtime configuration.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Runtime configuration data, read from the process environment.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// Namespace holding the `HubConfig`s and the compute kubeconfig secret.
    #[serde(rename = "pod_namespace")]
    pub namespace: String,

    /// Name of the APIExport whose virtual workspace serves `RegisteredCluster`s.
    #[serde(default = "Config::default_apiexport_name")]
    pub apiexport_name: String,

    /// Label patterns never copied onto a SyncTarget.
    #[serde(default = "Config::default_sync_target_label_excludes")]
    pub sync_target_label_excludes: Vec<String>,

    /// Maximum number of registrations reconciled in parallel.
    #[serde(default = "Config::default_controller_concurrency")]
    pub controller_concurrency: u16,

    /// Address serving `/healthz` and `/readyz`.
    #[serde(default = "Config::default_health_addr")]
    pub health_addr: SocketAddr,

    /// Run only while holding the leader lease in `POD_NAMESPACE`.
    #[serde(default)]
    pub enable_leader_election: bool,

    /// Identity recorded on the leader lease.
    #[serde(default)]
    pub pod_name: Option<String>,
}

impl Config {
    /// Build the config from the environment.
    ///
    /// `POD_NAMESPACE` has no default; running without it is a startup error.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(std::env::vars())
    }

    pub fn from_vars(vars: impl IntoIterator<Item = (String, String)>) -> Result<Self> {
        let config: Self = envy::from_iter(vars).context("error building config from env")?;
        if config.namespace.is_empty() {
            anyhow::bail!("POD_NAMESPACE is set but empty");
        }
        Ok(config)
    }

    fn default_apiexport_name() -> String {
        "compute-apis".to_owned()
    }

    fn default_sync_target_label_excludes() -> Vec<String> {
        vec![r"^feature\.open-cluster-management\.io/".to_owned()]
    }

    fn default_controller_concurrency() -> u16 {
        16
    }

    fn default_health_addr() -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], 8081))
    }

    /// Lease holder identity, unique per replica.
    pub fn identity(&self) -> String {
        self.pod_name
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| format!("cluster-registrar-{}", std::process::id()))
    }
}
