//! `Alertmanager` resource

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Affinity, Container, HostAlias, LocalObjectReference, PodSecurityContext, ResourceRequirements,
    Toleration, TopologySpreadConstraint, Volume, VolumeMount,
};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::common::{
    EmbeddedObjectMetadata, ReloadStrategy, SecretOrConfigMap, StorageSpec, WebConfigFileFields,
    WorkloadStatus,
};

/// Web server settings of Alertmanager
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AlertmanagerWebSpec {
    /// Fields rendered into the web configuration file
    #[serde(flatten)]
    pub web_config_file_fields: WebConfigFileFields,
    /// Maximum concurrent GET requests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub get_concurrency: Option<u32>,
    /// Request timeout in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u32>,
}

/// Settings for the generated Alertmanager configuration
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AlertmanagerGlobalConfiguration {
    /// Name of the `AlertmanagerConfig` used as global configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Notification templates projected into `/etc/alertmanager/templates`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub templates: Vec<SecretOrConfigMap>,
}

/// Spec object for the `Alertmanager` CRD
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
#[kube(kind = "Alertmanager", group = "monitoring.coreos.com", version = "v1")]
#[kube(shortname = "am")]
#[kube(status = "WorkloadStatus")]
#[kube(namespaced)]
pub struct AlertmanagerSpec {
    /// Labels and annotations propagated to the pods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_metadata: Option<EmbeddedObjectMetadata>,

    /// Version of Alertmanager, used for flag gating and the default image tag
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

    /// Number of cluster members
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    /// How long data is kept; defaults to `120h`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention: Option<String>,
    /// Storage of the data directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageSpec>,

    /// Externally reachable URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_url: Option<String>,
    /// Route prefix of the web server; defaults to `/`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route_prefix: Option<String>,
    /// Name of the web port; defaults to `web`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_name: Option<String>,
    /// Bind the web server to the loopback interface only
    #[serde(default)]
    pub listen_local: bool,
    /// Web server settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web: Option<AlertmanagerWebSpec>,

    /// Extra peers outside of the generated replica set
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_peers: Vec<String>,
    /// Address advertised to peers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_advertise_address: Option<String>,
    /// Gossip interval between peers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_gossip_interval: Option<String>,
    /// Push-pull interval between peers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_pushpull_interval: Option<String>,
    /// Timeout for peer acknowledgements
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_peer_timeout: Option<String>,
    /// Label isolating peer traffic; defaults to `<namespace>/<name>`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_label: Option<String>,
    /// Enable clustering even with a single replica
    #[serde(default)]
    pub force_enable_cluster_mode: bool,

    /// Log level; `info` is the default and emits no flag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
    /// Log format; `logfmt` is the default and emits no flag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_format: Option<String>,
    /// How configuration reloads are triggered
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reload_strategy: Option<ReloadStrategy>,
    /// Generated configuration settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alertmanager_configuration: Option<AlertmanagerGlobalConfiguration>,

    /// Secrets mounted under `/etc/alertmanager/secrets/<name>`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<String>,
    /// Config maps mounted under `/etc/alertmanager/configmaps/<name>`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub config_maps: Vec<String>,
    /// Additional volumes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,
    /// Additional mounts for the main container
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_mounts: Vec<VolumeMount>,
    /// Container overrides merged into the generated containers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub containers: Vec<Container>,
    /// Init container overrides merged into the generated init containers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub init_containers: Vec<Container>,
    /// Resources of the main container; memory request defaults to `200Mi`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
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
    /// Extra `/etc/hosts` entries of the pods
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub host_aliases: Vec<HostAlias>,
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
