//! Compilation of targets into the stateful workloads that run them.
//!
//! Every function here is pure: the same target, operator configuration,
//! selected monitors and configuration artifact always yield byte-identical
//! objects and the same change-detection hash. Nothing is cached between
//! calls.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec, StatefulSetUpdateStrategy};
use k8s_openapi::api::core::v1::{
    Capabilities, ExecAction, HTTPGetAction, PersistentVolumeClaim, PodSpec, PodTemplateSpec,
    Probe, Secret, SecurityContext, Service,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::ObjectMeta;
use kube::{Resource, ResourceExt};
use serde::Serialize;
use serde_json::Value;
use vigil_crd::common::ReloadStrategy;
use vigil_crd::v1::CommonPrometheusFields;
use vigil_crd::{Prometheus, PrometheusAgent};

use crate::artifact::{ConfigArtifact, ConfigArtifactBuilder, PROMETHEUS_CONFIG_KEY};
use crate::hash::{INPUT_HASH_ANNOTATION, InputHasher, propagated_annotations};
use crate::selector::SelectorSpec;
use crate::{Diagnostics, Error, OperatorConfig, Result};

mod alertmanager;
mod prometheus;
mod reloader;
mod volumes;
mod webconfig;

pub use alertmanager::{alertmanager_config_artifact, synthesize_alertmanager};
pub use prometheus::synthesize_prometheus;
pub use reloader::ReloaderBuilder;
pub use volumes::dns1123_label;

/// Label carrying the shard index of a Prometheus pod
pub const SHARD_LABEL: &str = "operator.prometheus.io/shard";
/// Label carrying the owning target's name
pub const NAME_LABEL: &str = "operator.prometheus.io/name";
/// Label carrying `server` or `agent`
pub const MODE_LABEL: &str = "operator.prometheus.io/mode";

const APP_NAME_LABEL: &str = "app.kubernetes.io/name";
const APP_INSTANCE_LABEL: &str = "app.kubernetes.io/instance";
const APP_MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
const APP_VERSION_LABEL: &str = "app.kubernetes.io/version";
const MANAGED_BY: &str = "vigil";

const DEFAULT_CONTAINER_ANNOTATION: &str = "kubectl.kubernetes.io/default-container";

const PROBE_TIMEOUT_SECONDS: i32 = 3;

/// A Prometheus-family target, resolved once from its custom resource
#[derive(Clone, Copy, Debug)]
pub enum Target<'a> {
    /// A `Prometheus` server
    Server(&'a Prometheus),
    /// A `PrometheusAgent`
    Agent(&'a PrometheusAgent),
}

/// Operating mode of a Prometheus-family target
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Full server with local TSDB and query API
    Server,
    /// Remote-write only agent
    Agent,
}

impl Mode {
    fn as_str(self) -> &'static str {
        match self {
            Mode::Server => "server",
            Mode::Agent => "agent",
        }
    }
}

impl<'a> From<&'a Prometheus> for Target<'a> {
    fn from(p: &'a Prometheus) -> Self {
        Target::Server(p)
    }
}

impl<'a> From<&'a PrometheusAgent> for Target<'a> {
    fn from(p: &'a PrometheusAgent) -> Self {
        Target::Agent(p)
    }
}

impl<'a> Target<'a> {
    /// Name prefix of every generated object
    #[must_use]
    pub fn prefix(&self) -> &'static str {
        match self {
            Target::Server(_) => "prometheus",
            Target::Agent(_) => "prom-agent",
        }
    }

    /// Kind of the custom resource
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Target::Server(_) => "Prometheus",
            Target::Agent(_) => "PrometheusAgent",
        }
    }

    /// Server or agent
    #[must_use]
    pub fn mode(&self) -> Mode {
        match self {
            Target::Server(_) => Mode::Server,
            Target::Agent(_) => Mode::Agent,
        }
    }

    /// Fields shared by both modes
    #[must_use]
    pub fn common_fields(&self) -> &'a CommonPrometheusFields {
        match *self {
            Target::Server(p) => &p.spec.common,
            Target::Agent(p) => &p.spec.common,
        }
    }

    fn meta(&self) -> &'a ObjectMeta {
        match *self {
            Target::Server(p) => &p.metadata,
            Target::Agent(p) => &p.metadata,
        }
    }

    /// Name of the custom resource
    #[must_use]
    pub fn name(&self) -> &'a str {
        self.meta().name.as_deref().unwrap_or_default()
    }

    /// Namespace of the custom resource
    #[must_use]
    pub fn namespace(&self) -> &'a str {
        self.meta().namespace.as_deref().unwrap_or_default()
    }

    /// `<prefix>-<name>`
    #[must_use]
    pub fn prefixed_name(&self) -> String {
        format!("{}-{}", self.prefix(), self.name())
    }

    /// Workload name of shard `shard`
    #[must_use]
    pub fn shard_name(&self, shard: i32) -> String {
        if shard == 0 {
            self.prefixed_name()
        } else {
            format!("{}-shard-{shard}", self.prefixed_name())
        }
    }

    /// Name of the secret holding the compressed configuration
    #[must_use]
    pub fn config_secret_name(&self) -> String {
        self.prefixed_name()
    }

    /// Name of the secret holding the web server configuration
    #[must_use]
    pub fn web_config_secret_name(&self) -> String {
        format!("{}-web-config", self.prefixed_name())
    }

    /// Name of the `i`-th TLS asset secret
    #[must_use]
    pub fn tls_assets_secret_name(&self, i: usize) -> String {
        format!("{}-tls-assets-{i}", self.prefixed_name())
    }

    /// Headless service shared by all targets of the mode in a namespace
    #[must_use]
    pub fn governing_service_name(&self) -> &'static str {
        match self {
            Target::Server(_) => "prometheus-operated",
            Target::Agent(_) => "prometheus-agent-operated",
        }
    }

    fn app_name(&self) -> &'static str {
        match self {
            Target::Server(_) => "prometheus",
            Target::Agent(_) => "prometheus-agent",
        }
    }

    /// Number of shards, at least 1
    #[must_use]
    pub fn shards(&self) -> i32 {
        self.common_fields().shards.filter(|s| *s > 1).unwrap_or(1)
    }

    /// Replicas per shard; negative values become 1
    #[must_use]
    pub fn replicas(&self, config: &OperatorConfig) -> i32 {
        match self.common_fields().replicas {
            Some(r) if r < 0 => 1,
            Some(r) => r,
            None => config.min_replicas,
        }
    }

    fn controller_owner_ref(&self) -> Option<OwnerReference> {
        match self {
            Target::Server(p) => p.controller_owner_ref(&()),
            Target::Agent(p) => p.controller_owner_ref(&()),
        }
    }

    fn owner_ref(&self) -> Option<OwnerReference> {
        match self {
            Target::Server(p) => p.owner_ref(&()),
            Target::Agent(p) => p.owner_ref(&()),
        }
    }

    fn hash_object(&self, hasher: InputHasher) -> Result<InputHasher> {
        match self {
            Target::Server(p) => hasher.object("target", *p),
            Target::Agent(p) => hasher.object("target", *p),
        }
    }

    /// Selection settings of the service monitors, pod monitors and probes
    /// this target scrapes, in that order
    #[must_use]
    pub fn monitor_selectors(&self, config: &OperatorConfig) -> [SelectorSpec; 3] {
        let fields = self.common_fields();
        let spec = |field: &str, selector: &Option<LabelSelector>, namespace_selector: &Option<LabelSelector>| {
            SelectorSpec {
                field: field.to_string(),
                selector: selector.clone(),
                namespace_selector: namespace_selector.clone(),
                allow_list: config.namespace_allow_list.clone(),
            }
        };
        [
            spec(
                "serviceMonitorSelector",
                &fields.service_monitor_selector,
                &fields.service_monitor_namespace_selector,
            ),
            spec(
                "podMonitorSelector",
                &fields.pod_monitor_selector,
                &fields.pod_monitor_namespace_selector,
            ),
            spec(
                "probeSelector",
                &fields.probe_selector,
                &fields.probe_namespace_selector,
            ),
        ]
    }

    /// Compresses `payload` into the configuration artifact of this target.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CompressionError`] when the encoder fails.
    pub fn config_artifact(&self, payload: &[u8]) -> Result<ConfigArtifact> {
        ConfigArtifactBuilder::new(self.config_secret_name(), PROMETHEUS_CONFIG_KEY).build(payload)
    }

    /// The configuration secret for `artifact`, labeled and owned like the workloads
    #[must_use]
    pub fn config_secret(&self, artifact: ConfigArtifact, config: &OperatorConfig) -> Secret {
        artifact.into_secret(ObjectMeta {
            namespace: Some(self.namespace().to_string()),
            labels: Some(config.labels.clone()),
            annotations: Some(config.annotations.clone()),
            owner_references: self.controller_owner_ref().map(|o| vec![o]),
            ..Default::default()
        })
    }
}

/// Everything besides the target that reaches a rendered workload
#[derive(Clone, Copy, Debug)]
pub struct SynthesisInputs<'a> {
    /// Operator-wide settings
    pub config: &'a OperatorConfig,
    /// Stored configuration; its name is referenced by the config volume
    pub artifact: &'a ConfigArtifact,
    /// Selected monitors by key, see [`SelectionResult::fingerprint`](crate::selector::SelectionResult::fingerprint)
    pub monitors: &'a BTreeMap<String, Value>,
    /// Names of the TLS asset secrets, projected in order
    pub tls_asset_secrets: &'a [String],
}

impl SynthesisInputs<'_> {
    /// Feeds everything except the target into `hasher`
    fn hash_into(&self, hasher: InputHasher) -> Result<InputHasher> {
        Ok(hasher
            .json("config", self.config)?
            .json("monitors", self.monitors)?
            .bytes("artifact.name", self.artifact.name.as_bytes())
            .bytes("artifact.key", self.artifact.key.as_bytes())
            .bytes("artifact.data", &self.artifact.data)
            .json("tlsAssets", self.tls_asset_secrets)?)
    }
}

/// The synthesized objects of one target
#[derive(Clone, Debug, Default, Serialize)]
pub struct Workloads {
    /// One workload per shard, in shard order
    pub statefulsets: Vec<StatefulSet>,
    /// Governing headless service
    pub service: Service,
    /// Web server configuration, when the version reads one
    pub web_config: Option<Secret>,
    /// Soft failures found while synthesizing
    pub diagnostics: Diagnostics,
}

impl Workloads {
    /// Workload name and change-detection hash of every workload
    #[must_use]
    pub fn input_hashes(&self) -> Vec<(String, String)> {
        self.statefulsets
            .iter()
            .map(|sts| {
                let hash = sts
                    .annotations()
                    .get(INPUT_HASH_ANNOTATION)
                    .cloned()
                    .unwrap_or_default();
                (sts.name_any(), hash)
            })
            .collect()
    }
}

/// Resolves the container image.
///
/// An explicit image wins, then `base:tag`, then `base@sha256:sha`, then
/// `base:version`.
pub(crate) fn image_path(
    image: Option<&str>,
    base_image: &str,
    version: &str,
    tag: Option<&str>,
    sha: Option<&str>,
) -> Result<String> {
    fn non_empty(v: Option<&str>) -> Option<&str> {
        v.map(str::trim).filter(|v| !v.is_empty())
    }

    let path = if let Some(image) = non_empty(image) {
        image.to_string()
    } else if let Some(tag) = non_empty(tag) {
        format!("{base_image}:{tag}")
    } else if let Some(sha) = non_empty(sha) {
        format!("{base_image}@sha256:{sha}")
    } else if !version.is_empty() {
        format!("{base_image}:{version}")
    } else {
        base_image.to_string()
    };

    if path.trim().is_empty() {
        return Err(Error::InvalidInput("empty container image".into()));
    }
    Ok(path)
}

/// Joins a route prefix and a path into a clean absolute path
pub(crate) fn route_path(prefix: &str, path: &str) -> String {
    let joined = format!("{}/{}", prefix.trim_end_matches('/'), path.trim_start_matches('/'));
    if joined.starts_with('/') {
        joined
    } else {
        format!("/{joined}")
    }
}

/// Route prefix with the `/` default
pub(crate) fn route_prefix(raw: Option<&str>) -> &str {
    raw.filter(|p| !p.is_empty()).unwrap_or("/")
}

/// Log level or format, unless it is the default the process already uses
pub(crate) fn non_default<'s>(value: Option<&'s str>, default: &str) -> Option<&'s str> {
    value.filter(|v| !v.is_empty() && *v != default)
}

/// Restricted security context shared by every generated container
pub(crate) fn restricted_security_context() -> SecurityContext {
    SecurityContext {
        allow_privilege_escalation: Some(false),
        read_only_root_filesystem: Some(true),
        capabilities: Some(Capabilities {
            drop: Some(vec!["ALL".into()]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// What a probe checks
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum ProbeCheck {
    /// Shell command inside the container
    Exec(ExecAction),
    /// HTTP GET against a container port
    Http(HTTPGetAction),
}

/// Liveness/readiness check: HTTP against the named port, or a shell
/// probe against the loopback when the process only listens there.
pub(crate) fn probe_check(
    path: &str,
    port_name: &str,
    loopback_port: u16,
    listen_local: bool,
    https: bool,
) -> ProbeCheck {
    if listen_local {
        let url = format!("http://localhost:{loopback_port}{path}");
        return ProbeCheck::Exec(ExecAction {
            command: Some(vec![
                "sh".into(),
                "-c".into(),
                format!(
                    r#"if [ -x "$(command -v curl)" ]; then exec curl --fail {url}; elif [ -x "$(command -v wget)" ]; then exec wget -q -O /dev/null {url}; else exit 1; fi"#
                ),
            ]),
        });
    }

    ProbeCheck::Http(HTTPGetAction {
        path: Some(path.to_string()),
        port: IntOrString::String(port_name.to_string()),
        scheme: https.then(|| "HTTPS".to_string()),
        ..Default::default()
    })
}

pub(crate) fn probe(check: ProbeCheck, period: i32, failure_threshold: i32) -> Probe {
    let (exec, http_get) = match check {
        ProbeCheck::Exec(exec) => (Some(exec), None),
        ProbeCheck::Http(http) => (None, Some(http)),
    };
    Probe {
        exec,
        http_get,
        timeout_seconds: Some(PROBE_TIMEOUT_SECONDS),
        period_seconds: Some(period),
        failure_threshold: Some(failure_threshold),
        ..Default::default()
    }
}

/// Union of `layers`; later layers win on equal keys
pub(crate) fn merged<'m>(
    layers: impl IntoIterator<Item = &'m BTreeMap<String, String>>,
) -> BTreeMap<String, String> {
    layers
        .into_iter()
        .flat_map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())))
        .collect()
}

/// Reload strategy with its default
pub(crate) fn reload_strategy(raw: Option<ReloadStrategy>) -> ReloadStrategy {
    raw.unwrap_or_default()
}

/// Inputs shared by every workload wrapper
pub(crate) struct WorkloadTemplate {
    pub name: String,
    pub namespace: String,
    pub owner: Option<OwnerReference>,
    pub target_labels: BTreeMap<String, String>,
    pub target_annotations: BTreeMap<String, String>,
    pub selector_labels: BTreeMap<String, String>,
    pub pod_labels: BTreeMap<String, String>,
    pub pod_annotations: BTreeMap<String, String>,
    pub default_container: &'static str,
    pub replicas: i32,
    pub service_name: &'static str,
    pub min_ready_seconds: Option<i32>,
    pub pod_spec: PodSpec,
    pub claims: Vec<PersistentVolumeClaim>,
}

impl WorkloadTemplate {
    /// Wraps the pod spec into a stateful workload carrying `input_hash`
    pub fn build(self, config: &OperatorConfig, input_hash: &str) -> StatefulSet {
        let hash = BTreeMap::from([(INPUT_HASH_ANNOTATION.to_string(), input_hash.to_string())]);
        let annotations = merged([
            &propagated_annotations(&self.target_annotations),
            &config.annotations,
            &hash,
        ]);

        let selector = merged([&config.labels, &self.selector_labels]);
        let template_labels = merged([&config.labels, &self.pod_labels, &self.selector_labels]);
        let default_container = BTreeMap::from([(
            DEFAULT_CONTAINER_ANNOTATION.to_string(),
            self.default_container.to_string(),
        )]);
        let template_annotations = merged([&default_container, &self.pod_annotations, &hash]);

        StatefulSet {
            metadata: ObjectMeta {
                name: Some(self.name),
                namespace: Some(self.namespace),
                labels: Some(merged([&self.target_labels, &config.labels])),
                annotations: Some(annotations),
                owner_references: self.owner.map(|o| vec![o]),
                ..Default::default()
            },
            spec: Some(StatefulSetSpec {
                replicas: Some(self.replicas),
                service_name: Some(self.service_name.to_string()),
                min_ready_seconds: self.min_ready_seconds,
                pod_management_policy: Some("Parallel".into()),
                update_strategy: Some(StatefulSetUpdateStrategy {
                    type_: Some("RollingUpdate".into()),
                    ..Default::default()
                }),
                selector: LabelSelector {
                    match_labels: Some(selector),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(template_labels),
                        annotations: Some(template_annotations),
                        ..Default::default()
                    }),
                    spec: Some(self.pod_spec),
                },
                volume_claim_templates: (!self.claims.is_empty()).then_some(self.claims),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

/// Non-empty vectors only, so unset lists stay absent in the output
pub(crate) fn some_if_any<T>(items: Vec<T>) -> Option<Vec<T>> {
    (!items.is_empty()).then_some(items)
}

#[cfg(test)]
mod tests {
    use vigil_crd::v1::PrometheusSpec;
    use vigil_crd::v1_alpha1::PrometheusAgentSpec;

    use super::*;

    #[test]
    fn target_variants_carry_prefix_and_kind() {
        let server = Prometheus::new("main", PrometheusSpec::default());
        let agent = PrometheusAgent::new("edge", PrometheusAgentSpec::default());

        let server = Target::from(&server);
        let agent = Target::from(&agent);

        assert_eq!(server.prefixed_name(), "prometheus-main");
        assert_eq!(agent.prefixed_name(), "prom-agent-edge");
        assert_eq!(server.kind(), "Prometheus");
        assert_eq!(agent.mode(), Mode::Agent);
        assert_eq!(server.shard_name(0), "prometheus-main");
        assert_eq!(server.shard_name(2), "prometheus-main-shard-2");
        assert_eq!(agent.governing_service_name(), "prometheus-agent-operated");
    }

    #[test]
    fn replicas_and_shards_are_normalized() {
        let config = OperatorConfig::default();
        let mut prom = Prometheus::new("main", PrometheusSpec::default());
        assert_eq!(Target::from(&prom).replicas(&config), 1);
        assert_eq!(Target::from(&prom).shards(), 1);

        prom.spec.common.replicas = Some(-3);
        prom.spec.common.shards = Some(-1);
        assert_eq!(Target::from(&prom).replicas(&config), 1);
        assert_eq!(Target::from(&prom).shards(), 1);

        prom.spec.common.replicas = Some(0);
        prom.spec.common.shards = Some(4);
        assert_eq!(Target::from(&prom).replicas(&config), 0);
        assert_eq!(Target::from(&prom).shards(), 4);
    }

    #[test]
    fn monitor_selectors_carry_allow_list() {
        let mut prom = Prometheus::new("main", PrometheusSpec::default());
        prom.spec.common.pod_monitor_selector = Some(LabelSelector {
            match_labels: Some(BTreeMap::from([("team".into(), "obs".into())])),
            ..Default::default()
        });
        let config = OperatorConfig {
            namespace_allow_list: Some(["monitoring".to_string()].into()),
            ..OperatorConfig::default()
        };

        let [service, pod, probe] = Target::from(&prom).monitor_selectors(&config);
        assert_eq!(service.field, "serviceMonitorSelector");
        assert!(service.selector.is_none());
        assert_eq!(pod.selector, prom.spec.common.pod_monitor_selector);
        assert_eq!(probe.field, "probeSelector");
        assert_eq!(probe.allow_list, config.namespace_allow_list);
    }

    #[test]
    fn image_resolution_order() {
        let base = "quay.io/prometheus/prometheus";
        assert_eq!(
            image_path(Some("my/prom:1"), base, "v2.54.1", Some("t"), None).unwrap(),
            "my/prom:1"
        );
        assert_eq!(
            image_path(Some(""), base, "v2.54.1", Some("t"), None).unwrap(),
            format!("{base}:t")
        );
        assert_eq!(
            image_path(None, base, "v2.54.1", None, Some("abc")).unwrap(),
            format!("{base}@sha256:abc")
        );
        assert_eq!(
            image_path(None, base, "v2.54.1", None, None).unwrap(),
            format!("{base}:v2.54.1")
        );
        assert!(image_path(None, "", "", None, None).is_err());
    }

    #[test]
    fn route_paths_are_clean() {
        assert_eq!(route_path("/", "/-/healthy"), "/-/healthy");
        assert_eq!(route_path("/prom/", "/-/ready"), "/prom/-/ready");
        assert_eq!(route_path("prom", "-/reload"), "/prom/-/reload");
    }

    #[test]
    fn loopback_probe_uses_shell() {
        let probe = probe(probe_check("/-/healthy", "web", 9090, true, false), 5, 6);
        let command = probe.exec.unwrap().command.unwrap();
        assert_eq!(command[..2], ["sh", "-c"]);
        assert!(command[2].contains("curl --fail http://localhost:9090/-/healthy"));
        assert!(probe.http_get.is_none());

        let ProbeCheck::Http(http) = probe_check("/-/healthy", "web", 9090, false, true) else {
            panic!("expected an HTTP check");
        };
        assert_eq!(http.scheme.as_deref(), Some("HTTPS"));
        assert_eq!(http.port, IntOrString::String("web".into()));
    }
}
