//! `monitoring.coreos.com/v1alpha1` resources

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::common::WorkloadStatus;
use crate::v1::CommonPrometheusFields;

/// Spec object for the `PrometheusAgent` CRD
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
#[kube(kind = "PrometheusAgent", group = "monitoring.coreos.com", version = "v1alpha1")]
#[kube(shortname = "promagent")]
#[kube(status = "WorkloadStatus")]
#[kube(namespaced)]
pub struct PrometheusAgentSpec {
    /// Fields shared with server mode
    #[serde(flatten)]
    pub common: CommonPrometheusFields,
}
