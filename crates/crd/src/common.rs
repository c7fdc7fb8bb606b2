//! Types shared by the monitoring custom resources

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    ConfigMapKeySelector, EmptyDirVolumeSource, EphemeralVolumeSource, PersistentVolumeClaimSpec,
    SecretKeySelector,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Subset of object metadata that may be embedded in a spec
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddedObjectMetadata {
    /// Name of the embedded object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Labels of the embedded object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
    /// Annotations of the embedded object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

/// A persistent volume claim template embedded in a storage spec
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddedPersistentVolumeClaim {
    /// Metadata of the generated claim template
    #[serde(default)]
    pub metadata: EmbeddedObjectMetadata,
    /// Claim spec; access modes default to `ReadWriteOnce`
    #[serde(default)]
    pub spec: PersistentVolumeClaimSpec,
}

/// Storage backing the data directory. At most one of the sources is honored,
/// in the order `emptyDir`, `ephemeral`, `volumeClaimTemplate`.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageSpec {
    /// Deprecated: mount the data volume without a sub path
    #[serde(default)]
    pub disable_mount_sub_path: bool,
    /// Use an `emptyDir` volume
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub empty_dir: Option<EmptyDirVolumeSource>,
    /// Use a generic ephemeral volume
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ephemeral: Option<EphemeralVolumeSource>,
    /// Use a persistent volume claim template
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_claim_template: Option<EmbeddedPersistentVolumeClaim>,
}

/// Reference to a key in either a secret or a config map
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretOrConfigMap {
    /// Secret key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<SecretKeySelector>,
    /// Config map key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map: Option<ConfigMapKeySelector>,
}

/// TLS settings of the built-in web server
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WebTlsConfig {
    /// Server certificate
    pub cert: SecretOrConfigMap,
    /// Server private key
    pub key_secret: SecretKeySelector,
    /// CA used to verify client certificates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ca: Option<SecretOrConfigMap>,
    /// Client authentication policy (e.g. `RequireAndVerifyClientCert`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_auth_type: Option<String>,
    /// Minimum TLS version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_version: Option<String>,
    /// Maximum TLS version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_version: Option<String>,
}

/// HTTP server settings of the built-in web server
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WebHttpConfig {
    /// Enable HTTP/2
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http2: Option<bool>,
    /// Extra response headers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,
}

/// Fields rendered into the web configuration file
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WebConfigFileFields {
    /// TLS settings; enables HTTPS when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_config: Option<WebTlsConfig>,
    /// HTTP settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_config: Option<WebHttpConfig>,
}

/// How the reloader sidecar asks the main process to reload
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum ReloadStrategy {
    /// POST to the `/-/reload` endpoint
    #[default]
    #[serde(rename = "HTTP")]
    Http,
    /// Send `SIGHUP` to the main process
    ProcessSignal,
}

/// Extra label selectors injected into topology spread constraints
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum AdditionalLabelSelectors {
    /// Select pods of the same resource, all shards
    OnResource,
    /// Select pods of the same resource and shard
    OnShard,
}

/// Topology spread constraint with optional generated label selectors
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TopologySpreadConstraint {
    /// The plain Kubernetes constraint
    #[serde(flatten)]
    pub core: k8s_openapi::api::core::v1::TopologySpreadConstraint,
    /// Which generated selector labels to add to `labelSelector`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_label_selectors: Option<AdditionalLabelSelectors>,
}

/// Observed state common to all workload-backed resources
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadStatus {
    /// Whether reconciliation is paused
    #[serde(default)]
    pub paused: bool,
    /// Number of replicas across all shards
    #[serde(default)]
    pub replicas: i32,
    /// Conditions describing the last synthesis
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}
