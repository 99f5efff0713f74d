use super::LocalReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube_derive::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Default request burst for a hub client when `burst` is zero.
pub const DEFAULT_BURST: u32 = 200;
/// Default requests per second for a hub client when `qps` is empty.
pub const DEFAULT_QPS: f32 = 100.0;

/// Connection descriptor for one hub control plane.
///
/// Read once when the hub set is built. Rotating the referenced credential
/// means updating this object and rebuilding the binding.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
#[kube(
    group = "registrar.homerow.ca",
    version = "v1alpha1",
    kind = "HubConfig",
    namespaced,
    status = "HubConfigStatus"
)]
pub struct HubConfigSpec {
    /// Secret in the same namespace holding a `kubeconfig` key.
    pub kube_config_secret_ref: LocalReference,

    /// Maximum request burst. Zero means [`DEFAULT_BURST`].
    #[serde(default)]
    pub burst: u32,

    /// Requests per second, as a decimal string. Empty means [`DEFAULT_QPS`].
    #[serde(default)]
    pub qps: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HubConfigStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl HubConfigSpec {
    pub fn effective_burst(&self) -> u32 {
        if self.burst == 0 { DEFAULT_BURST } else { self.burst }
    }

    pub fn effective_qps(&self) -> Result<f32, std::num::ParseFloatError> {
        if self.qps.is_empty() {
            Ok(DEFAULT_QPS)
        } else {
            self.qps.trim().parse()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttling_defaults_apply_when_unset() {
        let spec = HubConfigSpec::default();
        assert_eq!(spec.effective_burst(), 200);
        assert_eq!(spec.effective_qps().unwrap(), 100.0);
    }

    #[test]
    fn throttling_values_are_taken_from_the_descriptor() {
        let spec = HubConfigSpec {
            burst: 50,
            qps: "12.5".to_owned(),
            ..HubConfigSpec::default()
        };
        assert_eq!(spec.effective_burst(), 50);
        assert_eq!(spec.effective_qps().unwrap(), 12.5);
    }

    #[test]
    fn malformed_qps_is_rejected() {
        let spec = HubConfigSpec {
            qps: "fast".to_owned(),
            ..HubConfigSpec::default()
        };
        assert!(spec.effective_qps().is_err());
    }
}
