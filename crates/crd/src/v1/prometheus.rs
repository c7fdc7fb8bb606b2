//! `Prometheus` resource and the fields it shares with `PrometheusAgent`

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Affinity, Container, LocalObjectReference, PodSecurityContext, ResourceRequirements,
    Toleration, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::common::{
    EmbeddedObjectMetadata, ReloadStrategy, StorageSpec, TopologySpreadConstraint,
    WebConfigFileFields, WorkloadStatus,
};

/// Web server settings of a Prometheus-family process
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PrometheusWebSpec {
    /// Fields rendered into the web configuration file
    #[serde(flatten)]
    pub web_config_file_fields: WebConfigFileFields,
    /// Title of the web UI
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_title: Option<String>,
    /// Maximum number of simultaneous connections
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<i32>,
}

/// Fields shared by `Prometheus` and `PrometheusAgent`
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CommonPrometheusFields {
    /// Labels and annotations propagated to the pods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_metadata: Option<EmbeddedObjectMetadata>,

    /// Selects `ServiceMonitor` objects; absent selects all in scope
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_monitor_selector: Option<LabelSelector>,
    /// Selects namespaces to look for `ServiceMonitor` objects in; absent means own namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_monitor_namespace_selector: Option<LabelSelector>,
    /// Selects `PodMonitor` objects; absent selects all in scope
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_monitor_selector: Option<LabelSelector>,
    /// Selects namespaces to look for `PodMonitor` objects in; absent means own namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_monitor_namespace_selector: Option<LabelSelector>,
    /// Selects `Probe` objects; absent selects all in scope
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe_selector: Option<LabelSelector>,
    /// Selects namespaces to look for `Probe` objects in; absent means own namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe_namespace_selector: Option<LabelSelector>,

    /// Version of the software, used for flag gating and the default image tag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Full image reference; overrides every other image field
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Deprecated: image repository without tag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_image: Option<String>,
    /// Deprecated: image tag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    /// Deprecated: image digest
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha: Option<String>,
    /// Image pull policy for every generated container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,
    /// Pull secrets for the pods
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_pull_secrets: Vec<LocalObjectReference>,

    /// Number of replicas per shard
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    /// Number of shards
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shards: Option<i32>,

    /// Externally reachable URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_url: Option<String>,
    /// Route prefix of the web server; defaults to `/`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route_prefix: Option<String>,
    /// Name of the web port; defaults to `web`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_name: Option<String>,
    /// Bind to the loopback interface only
    #[serde(default)]
    pub listen_local: bool,
    /// Web server settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web: Option<PrometheusWebSpec>,

    /// Storage of the data directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageSpec>,
    /// Additional volumes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,
    /// Additional mounts for the main container
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_mounts: Vec<VolumeMount>,
    /// Secrets mounted under `/etc/prometheus/secrets/<name>`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<String>,
    /// Config maps mounted under `/etc/prometheus/configmaps/<name>`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub config_maps: Vec<String>,

    /// Container overrides merged into the generated containers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub containers: Vec<Container>,
    /// Init container overrides merged into the generated init containers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub init_containers: Vec<Container>,
    /// Resources of the main container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    /// Log level; `info` is the default and emits no flag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
    /// Log format; `logfmt` is the default and emits no flag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_format: Option<String>,
    /// Feature flags passed through `--enable-feature`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enable_features: Vec<String>,
    /// Accept remote-write requests
    #[serde(default)]
    pub enable_remote_write_receiver: bool,
    /// How configuration reloads are triggered
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reload_strategy: Option<ReloadStrategy>,
    /// Upper bound for startup before the startup probe fails
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum_startup_duration_seconds: Option<i32>,
    /// Minimum seconds a pod must be ready before it counts as available
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_ready_seconds: Option<i32>,

    /// Node selector of the pods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<BTreeMap<String, String>>,
    /// Affinity of the pods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,
    /// Tolerations of the pods
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,
    /// Topology spread constraints of the pods
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub topology_spread_constraints: Vec<TopologySpreadConstraint>,
    /// Priority class of the pods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_class_name: Option<String>,
    /// Pod security context
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_context: Option<PodSecurityContext>,
    /// Service account of the pods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
    /// Mount the service account token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub automount_service_account_token: Option<bool>,
}

/// Spec object for the `Prometheus` CRD
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
#[kube(kind = "Prometheus", group = "monitoring.coreos.com", version = "v1")]
#[kube(plural = "prometheuses", shortname = "prom")]
#[kube(status = "WorkloadStatus")]
#[kube(namespaced)]
pub struct PrometheusSpec {
    /// Fields shared with agent mode
    #[serde(flatten)]
    pub common: CommonPrometheusFields,
    /// How long samples are kept
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention: Option<String>,
    /// Maximum bytes kept on disk
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention_size: Option<String>,
    /// Enable the admin HTTP API
    #[serde(default, rename = "enableAdminAPI")]
    pub enable_admin_api: bool,
    /// Query log file; a bare file name is placed in a generated volume
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_log_file: Option<String>,
    /// Disable local block compaction
    #[serde(default)]
    pub disable_compaction: bool,
}
