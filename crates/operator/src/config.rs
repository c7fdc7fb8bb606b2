//! Operator-wide settings, read once at startup from `VIGIL_*` environment variables

use std::collections::{BTreeMap, BTreeSet};
use std::env;
use std::time::Duration;

use serde::Serialize;

use crate::{Error, Result};

/// Image and resources of the config reloader sidecar
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ReloaderConfig {
    /// Reloader image
    pub image: String,
    /// CPU request; empty means unset
    pub cpu_request: String,
    /// CPU limit; empty means unset
    pub cpu_limit: String,
    /// Memory request; empty means unset
    pub memory_request: String,
    /// Memory limit; empty means unset
    pub memory_limit: String,
}

impl Default for ReloaderConfig {
    fn default() -> Self {
        Self {
            image: "quay.io/prometheus-operator/prometheus-config-reloader:v0.76.0".into(),
            cpu_request: "10m".into(),
            cpu_limit: "10m".into(),
            memory_request: "50Mi".into(),
            memory_limit: "50Mi".into(),
        }
    }
}

/// Immutable configuration passed into every synthesis call.
///
/// The serialized form holds only the values that reach rendered workloads
/// and feeds the change-detection hash.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct OperatorConfig {
    /// Image repository used when a Prometheus target names no image
    pub prometheus_base_image: String,
    /// Version used when a Prometheus target names no version
    pub prometheus_default_version: String,
    /// Image repository used when an Alertmanager target names no image
    pub alertmanager_base_image: String,
    /// Version used when an Alertmanager target names no version
    pub alertmanager_default_version: String,
    /// Cluster DNS domain; when set, peer addresses are fully qualified
    pub cluster_domain: Option<String>,
    /// Host name sidecars use to reach the main process
    pub local_host: String,
    /// Reloader sidecar settings
    pub reloader: ReloaderConfig,
    /// Labels added to every generated object
    pub labels: BTreeMap<String, String>,
    /// Annotations added to every generated object
    pub annotations: BTreeMap<String, String>,
    /// Namespaces monitors may be selected from; `None` allows all
    #[serde(skip)]
    pub namespace_allow_list: Option<BTreeSet<String>>,
    /// Replica count used when a target does not set one
    pub min_replicas: i32,
    /// Upper bound for a single authorization query
    #[serde(skip)]
    pub authz_timeout: Duration,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            prometheus_base_image: "quay.io/prometheus/prometheus".into(),
            prometheus_default_version: "v2.54.1".into(),
            alertmanager_base_image: "quay.io/prometheus/alertmanager".into(),
            alertmanager_default_version: "v0.27.0".into(),
            cluster_domain: None,
            local_host: "localhost".into(),
            reloader: ReloaderConfig::default(),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            namespace_allow_list: None,
            min_replicas: 1,
            authz_timeout: Duration::from_secs(10),
        }
    }
}

impl OperatorConfig {
    /// Reads the configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] when a numeric or map variable is malformed.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Reads the configuration through `lookup`, falling back to defaults.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] when a numeric or map variable is malformed.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("VIGIL_PROMETHEUS_BASE_IMAGE") {
            config.prometheus_base_image = v;
        }
        if let Some(v) = get("VIGIL_PROMETHEUS_DEFAULT_VERSION") {
            config.prometheus_default_version = v;
        }
        if let Some(v) = get("VIGIL_ALERTMANAGER_BASE_IMAGE") {
            config.alertmanager_base_image = v;
        }
        if let Some(v) = get("VIGIL_ALERTMANAGER_DEFAULT_VERSION") {
            config.alertmanager_default_version = v;
        }
        config.cluster_domain = get("VIGIL_CLUSTER_DOMAIN");
        if let Some(v) = get("VIGIL_LOCAL_HOST") {
            config.local_host = v;
        }

        if let Some(v) = get("VIGIL_RELOADER_IMAGE") {
            config.reloader.image = v;
        }
        if let Some(v) = lookup("VIGIL_RELOADER_CPU_REQUEST") {
            config.reloader.cpu_request = v;
        }
        if let Some(v) = lookup("VIGIL_RELOADER_CPU_LIMIT") {
            config.reloader.cpu_limit = v;
        }
        if let Some(v) = lookup("VIGIL_RELOADER_MEMORY_REQUEST") {
            config.reloader.memory_request = v;
        }
        if let Some(v) = lookup("VIGIL_RELOADER_MEMORY_LIMIT") {
            config.reloader.memory_limit = v;
        }

        if let Some(v) = get("VIGIL_LABELS") {
            config.labels = parse_map("VIGIL_LABELS", &v)?;
        }
        if let Some(v) = get("VIGIL_ANNOTATIONS") {
            config.annotations = parse_map("VIGIL_ANNOTATIONS", &v)?;
        }
        if let Some(v) = get("VIGIL_NAMESPACES") {
            let namespaces: BTreeSet<String> = v
                .split(',')
                .map(str::trim)
                .filter(|ns| !ns.is_empty())
                .map(String::from)
                .collect();
            config.namespace_allow_list = Some(namespaces);
        }
        if let Some(v) = get("VIGIL_MIN_REPLICAS") {
            config.min_replicas = v.trim().parse().map_err(|e| {
                Error::InvalidInput(format!("VIGIL_MIN_REPLICAS={v:?}: {e}"))
            })?;
        }
        if let Some(v) = get("VIGIL_AUTHZ_TIMEOUT_SECS") {
            let secs: u64 = v.trim().parse().map_err(|e| {
                Error::InvalidInput(format!("VIGIL_AUTHZ_TIMEOUT_SECS={v:?}: {e}"))
            })?;
            config.authz_timeout = Duration::from_secs(secs);
        }

        Ok(config)
    }
}

/// Parses `k1=v1,k2=v2`
fn parse_map(var: &str, raw: &str) -> Result<BTreeMap<String, String>> {
    raw.split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (k, v) = pair
                .split_once('=')
                .ok_or_else(|| Error::InvalidInput(format!("{var}: {pair:?} is not key=value")))?;
            Ok((k.trim().to_string(), v.trim().to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_environment() {
        temp_env::with_vars_unset(
            ["VIGIL_CLUSTER_DOMAIN", "VIGIL_NAMESPACES", "VIGIL_MIN_REPLICAS"],
            || {
                let config = OperatorConfig::from_env().unwrap();
                assert_eq!(config, OperatorConfig::default());
                assert_eq!(config.min_replicas, 1);
                assert!(config.namespace_allow_list.is_none());
            },
        );
    }

    #[test]
    fn reads_overrides_from_environment() {
        temp_env::with_vars(
            [
                ("VIGIL_CLUSTER_DOMAIN", Some("cluster.local")),
                ("VIGIL_NAMESPACES", Some("monitoring, apps ,")),
                ("VIGIL_LABELS", Some("team=obs,tier=infra")),
                ("VIGIL_RELOADER_CPU_LIMIT", Some("")),
                ("VIGIL_AUTHZ_TIMEOUT_SECS", Some("3")),
            ],
            || {
                let config = OperatorConfig::from_env().unwrap();
                assert_eq!(config.cluster_domain.as_deref(), Some("cluster.local"));
                assert_eq!(
                    config.namespace_allow_list,
                    Some(BTreeSet::from(["apps".to_string(), "monitoring".to_string()]))
                );
                assert_eq!(config.labels.get("team").map(String::as_str), Some("obs"));
                assert_eq!(config.reloader.cpu_limit, "");
                assert_eq!(config.authz_timeout, Duration::from_secs(3));
            },
        );
    }

    #[test]
    fn rejects_malformed_values() {
        temp_env::with_var("VIGIL_MIN_REPLICAS", Some("two"), || {
            assert!(matches!(
                OperatorConfig::from_env(),
                Err(Error::InvalidInput(_))
            ));
        });
        temp_env::with_var("VIGIL_LABELS", Some("novalue"), || {
            assert!(OperatorConfig::from_env().is_err());
        });
    }
}
