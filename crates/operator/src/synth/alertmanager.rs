//! Alertmanager cluster workload

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, EnvVarSource, ObjectFieldSelector, PodSpec, Probe,
    ResourceRequirements, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::ObjectMeta;
use kube::{Resource, ResourceExt};
use semver::Version;
use tracing::{debug, instrument};
use vigil_crd::Alertmanager;
use vigil_crd::common::ReloadStrategy;

use super::reloader::ReloaderBuilder;
use super::volumes::{
    config_out_volume, data_storage, mount, secret_volume, templates_volume, tls_assets_volume,
    user_mounts,
};
use super::webconfig::WebConfig;
use super::{
    APP_INSTANCE_LABEL, APP_MANAGED_BY_LABEL, APP_NAME_LABEL, APP_VERSION_LABEL, MANAGED_BY,
    SynthesisInputs, WorkloadTemplate, Workloads, image_path, merged, non_default, probe,
    probe_check, reload_strategy, restricted_security_context, route_path, route_prefix,
    some_if_any,
};
use crate::artifact::{ALERTMANAGER_CONFIG_KEY, ConfigArtifact, ConfigArtifactBuilder};
use crate::hash::InputHasher;
use crate::merge::merge_containers;
use crate::version::{ALERTMANAGER_LEGACY_REWRITES, Argument, VersionGate, VersionedArgument};
use crate::{Diagnostics, Error, OperatorConfig, Result};

const CONTAINER_NAME: &str = "alertmanager";
const APP_NAME: &str = "alertmanager";
const GOVERNING_SERVICE: &str = "alertmanager-operated";
const WEB_PORT: u16 = 9093;
const MESH_PORT: i32 = 9094;
const DEFAULT_PORT_NAME: &str = "web";
const DEFAULT_RETENTION: &str = "120h";
const DEFAULT_MEMORY_REQUEST: &str = "200Mi";
const TERMINATION_GRACE_PERIOD_SECONDS: i64 = 120;

const CONFIG_VOLUME: &str = "config-volume";
const CONFIG_DIR: &str = "/etc/alertmanager/config";
const CONFIG_OUT_DIR: &str = "/etc/alertmanager/config_out";
const CONFIG_ENVSUBST_FILE: &str = "alertmanager.env.yaml";
const TLS_ASSETS_DIR: &str = "/etc/alertmanager/certs";
const WEB_CONFIG_DIR: &str = "/etc/alertmanager/web_config";
const TEMPLATES_VOLUME: &str = "notification-templates";
const TEMPLATES_DIR: &str = "/etc/alertmanager/templates";
const SECRETS_DIR: &str = "/etc/alertmanager/secrets";
const CONFIG_MAPS_DIR: &str = "/etc/alertmanager/configmaps";
const STORAGE_DIR: &str = "/alertmanager";

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

/// Name of the secret holding the generated configuration
fn config_secret_name(name: &str) -> String {
    format!("alertmanager-{name}-generated")
}

/// Compresses `payload` into the configuration artifact of `alertmanager`.
///
/// # Errors
///
/// Returns [`Error::CompressionError`] when the encoder fails.
pub fn alertmanager_config_artifact(alertmanager: &Alertmanager, payload: &[u8]) -> Result<ConfigArtifact> {
    ConfigArtifactBuilder::new(config_secret_name(&alertmanager.name_any()), ALERTMANAGER_CONFIG_KEY)
        .build(payload)
}

/// Member count; unset means the operator minimum and negative means none
fn replicas(alertmanager: &Alertmanager, config: &OperatorConfig) -> i32 {
    match alertmanager.spec.replicas {
        Some(r) if r < 0 => 0,
        Some(r) => r,
        None => config.min_replicas,
    }
}

/// Host part of the peer addresses
fn peer_domain(namespace: &str, config: &OperatorConfig) -> String {
    match non_empty(config.cluster_domain.as_deref()) {
        Some(domain) => format!(
            "{GOVERNING_SERVICE}.{namespace}.svc.{}.",
            domain.trim_end_matches('.')
        ),
        None => GOVERNING_SERVICE.to_string(),
    }
}

fn candidate_arguments(
    alertmanager: &Alertmanager,
    config: &OperatorConfig,
    web: &WebConfig<'_>,
    prefix: &str,
    replicas: i32,
) -> Vec<VersionedArgument> {
    let spec = &alertmanager.spec;
    let name = alertmanager.name_any();
    let namespace = alertmanager.namespace().unwrap_or_default();
    let v = Version::new;
    let mut args: Vec<VersionedArgument> = vec![
        Argument::new("config.file", format!("{CONFIG_OUT_DIR}/{CONFIG_ENVSUBST_FILE}")).into(),
        Argument::new("storage.path", STORAGE_DIR).into(),
        Argument::new(
            "data.retention",
            non_empty(spec.retention.as_deref()).unwrap_or(DEFAULT_RETENTION),
        )
        .into(),
    ];

    let cluster_listen = if replicas == 1 && !spec.force_enable_cluster_mode {
        String::new()
    } else {
        format!("[$(POD_IP)]:{MESH_PORT}")
    };
    args.push(Argument::new("cluster.listen-address", cluster_listen).into());

    let web_listen = if spec.listen_local { "127.0.0.1" } else { "" };
    args.push(Argument::new("web.listen-address", format!("{web_listen}:{WEB_PORT}")).into());

    if let Some(url) = non_empty(spec.external_url.as_deref()) {
        args.push(Argument::new("web.external-url", url).into());
    }
    args.push(Argument::new("web.route-prefix", prefix).into());

    if let Some(web_spec) = &spec.web {
        if let Some(concurrency) = web_spec.get_concurrency {
            args.push(
                Argument::new("web.get-concurrency", concurrency.to_string()).since(v(0, 17, 0)),
            );
        }
        if let Some(timeout) = web_spec.timeout {
            args.push(Argument::new("web.timeout", timeout.to_string()).since(v(0, 17, 0)));
        }
    }

    if let Some(level) = non_default(spec.log_level.as_deref(), "info") {
        args.push(Argument::new("log.level", level).into());
    }
    if let Some(format) = non_default(spec.log_format.as_deref(), "logfmt") {
        args.push(Argument::new("log.format", format).since(v(0, 16, 0)));
    }

    for (flag, value) in [
        ("cluster.advertise-address", &spec.cluster_advertise_address),
        ("cluster.gossip-interval", &spec.cluster_gossip_interval),
        ("cluster.pushpull-interval", &spec.cluster_pushpull_interval),
        ("cluster.peer-timeout", &spec.cluster_peer_timeout),
    ] {
        if let Some(value) = non_empty(value.as_deref()) {
            args.push(Argument::new(flag, value).into());
        }
    }

    args.push(match non_empty(spec.cluster_label.as_deref()) {
        Some(label) => Argument::new("cluster.label", label).since(v(0, 26, 0)),
        None => Argument::new("cluster.label", format!("{namespace}/{name}")).implied_since(v(0, 26, 0)),
    });

    let domain = peer_domain(&namespace, config);
    for i in 0..replicas {
        args.push(
            Argument::new("cluster.peer", format!("alertmanager-{name}-{i}.{domain}:{MESH_PORT}"))
                .into(),
        );
    }
    for peer in &spec.additional_peers {
        args.push(Argument::new("cluster.peer", peer).into());
    }

    args.push(Argument::new("cluster.reconnect-timeout", "5m").implied_since(v(0, 15, 0)));
    args.push(web.argument().implied_since(v(0, 22, 0)));
    args
}

/// Main container resources; the memory request defaults to 200Mi
fn resources(requirements: Option<&ResourceRequirements>) -> ResourceRequirements {
    let mut resources = requirements.cloned().unwrap_or_default();
    resources
        .requests
        .get_or_insert_with(BTreeMap::new)
        .entry("memory".into())
        .or_insert_with(|| Quantity(DEFAULT_MEMORY_REQUEST.into()));
    resources
}

/// Compiles an Alertmanager into its workload, the governing service and
/// the web configuration secret.
///
/// # Errors
///
/// Input errors ([`Error::is_input_error`]) for an unusable version, image,
/// volume name or container override; serialization errors while hashing.
#[allow(clippy::too_many_lines)]
#[instrument(skip_all, fields(namespace = ?alertmanager.namespace(), name = %alertmanager.name_any()))]
pub fn synthesize_alertmanager(alertmanager: &Alertmanager, inputs: SynthesisInputs<'_>) -> Result<Workloads> {
    let config = inputs.config;
    let spec = &alertmanager.spec;
    let name = alertmanager.name_any();
    let namespace = alertmanager.namespace().unwrap_or_default();
    if name.is_empty() || namespace.is_empty() {
        return Err(Error::InvalidInput(
            "Alertmanager needs a name and a namespace".into(),
        ));
    }

    let version = non_empty(spec.version.as_deref()).unwrap_or(config.alertmanager_default_version.as_str());
    let gate = VersionGate::new("alertmanager", version)?;
    gate.require_major(&[0])?;

    let image = image_path(
        spec.image.as_deref(),
        non_empty(spec.base_image.as_deref()).unwrap_or(config.alertmanager_base_image.as_str()),
        version,
        spec.tag.as_deref(),
        spec.sha.as_deref(),
    )?;

    let web = WebConfig::new(
        WEB_CONFIG_DIR,
        format!("alertmanager-{name}-web-config"),
        spec.web.as_ref().map(|w| &w.web_config_file_fields),
    );
    let web_supported = gate.at_least(0, 22, 0);
    let https = web_supported && web.tls_enabled();
    let prefix = route_prefix(spec.route_prefix.as_deref());
    let reload = reload_strategy(spec.reload_strategy);
    let port_name = non_empty(spec.port_name.as_deref()).unwrap_or(DEFAULT_PORT_NAME);
    let replicas = replicas(alertmanager, config);

    let mut diagnostics = Diagnostics::default();
    let mut args = Vec::new();
    gate.append(
        &mut args,
        candidate_arguments(alertmanager, config, &web, prefix, replicas),
        &mut diagnostics,
    );
    let args = gate.render(args, ALERTMANAGER_LEGACY_REWRITES);

    let mut volumes = vec![
        secret_volume(CONFIG_VOLUME, &inputs.artifact.name),
        tls_assets_volume("tls-assets", inputs.tls_asset_secrets),
        config_out_volume("config-out"),
    ];
    let mut mounts = vec![
        mount(CONFIG_VOLUME, CONFIG_DIR, false),
        mount("config-out", CONFIG_OUT_DIR, true),
        mount("tls-assets", TLS_ASSETS_DIR, true),
    ];

    let storage = data_storage(
        spec.storage.as_ref(),
        &format!("alertmanager-{name}-db"),
        STORAGE_DIR,
        "alertmanager-db",
    );
    mounts.push(storage.mount.clone());
    volumes.extend(storage.volume);
    let claims: Vec<_> = storage.claim.into_iter().collect();

    let mut reloader_mounts = vec![
        mount(CONFIG_VOLUME, CONFIG_DIR, true),
        mount("config-out", CONFIG_OUT_DIR, false),
    ];
    let mut watched_dirs = vec![CONFIG_DIR.to_string()];

    let templates = spec
        .alertmanager_configuration
        .as_ref()
        .map(|c| c.templates.as_slice())
        .unwrap_or_default();
    if let Some(volume) = templates_volume(TEMPLATES_VOLUME, templates, &mut diagnostics) {
        volumes.push(volume);
        mounts.push(mount(TEMPLATES_VOLUME, TEMPLATES_DIR, true));
    }

    let user = user_mounts(&spec.secrets, &spec.config_maps, SECRETS_DIR, CONFIG_MAPS_DIR)?;
    volumes.extend(user.volumes);
    mounts.extend(user.mounts.iter().cloned());
    reloader_mounts.extend(user.mounts);
    watched_dirs.extend(user.directories);
    mounts.extend(spec.volume_mounts.iter().cloned());

    if web_supported {
        let (web_volumes, web_mounts) = web.volumes()?;
        volumes.extend(web_volumes);
        mounts.extend(web_mounts);
    }
    volumes.extend(spec.volumes.iter().cloned());

    let check = |path: &str| {
        probe_check(&route_path(prefix, path), port_name, WEB_PORT, spec.listen_local, https)
    };

    let mut ports = Vec::new();
    if !spec.listen_local {
        ports.push(ContainerPort {
            name: Some(port_name.to_string()),
            container_port: i32::from(WEB_PORT),
            protocol: Some("TCP".into()),
            ..Default::default()
        });
    }
    for (port, protocol) in [("mesh-tcp", "TCP"), ("mesh-udp", "UDP")] {
        ports.push(ContainerPort {
            name: Some(port.into()),
            container_port: MESH_PORT,
            protocol: Some(protocol.into()),
            ..Default::default()
        });
    }

    let main = Container {
        name: CONTAINER_NAME.into(),
        image: Some(image),
        image_pull_policy: spec.image_pull_policy.clone(),
        args: Some(args),
        ports: Some(ports),
        env: Some(vec![EnvVar {
            name: "POD_IP".into(),
            value_from: Some(EnvVarSource {
                field_ref: Some(ObjectFieldSelector {
                    field_path: "status.podIP".into(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }]),
        volume_mounts: Some(mounts),
        liveness_probe: Some(probe(check("/-/healthy"), 10, 10)),
        readiness_probe: Some(Probe {
            initial_delay_seconds: Some(3),
            ..probe(check("/-/ready"), 5, 10)
        }),
        resources: Some(resources(spec.resources.as_ref())),
        security_context: Some(restricted_security_context()),
        termination_message_policy: Some("FallbackToLogsOnError".into()),
        ..Default::default()
    };

    let scheme = if https { "https" } else { "http" };
    let reloader = ReloaderBuilder::new(&config.reloader, &config.local_host)
        .listen_local(spec.listen_local)
        .config_file(format!("{CONFIG_DIR}/{}", inputs.artifact.key))
        .config_envsubst_file(format!("{CONFIG_OUT_DIR}/{CONFIG_ENVSUBST_FILE}"))
        .watched_dirs(watched_dirs)
        .log_level(spec.log_level.as_deref())
        .log_format(spec.log_format.as_deref())
        .image_pull_policy(spec.image_pull_policy.as_deref())
        .mounts(reloader_mounts);
    let reloader = match reload {
        ReloadStrategy::Http => reloader.reload_url(format!(
            "{scheme}://{}:{WEB_PORT}{}",
            config.local_host,
            route_path(prefix, "/-/reload")
        )),
        ReloadStrategy::ProcessSignal => reloader.reload_signal(None),
    };

    let containers = merge_containers(vec![main, reloader.clone().build()], &spec.containers)?;
    let init_containers = merge_containers(vec![reloader.run_once().build()], &spec.init_containers)?;
    diagnostics.extend(containers.diagnostics);
    diagnostics.extend(init_containers.diagnostics);

    let selector_labels = BTreeMap::from([
        (APP_NAME_LABEL.to_string(), APP_NAME.to_string()),
        (APP_MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string()),
        (APP_INSTANCE_LABEL.to_string(), name.clone()),
        ("alertmanager".to_string(), name.clone()),
    ]);
    let pod_metadata = spec.pod_metadata.clone().unwrap_or_default();
    let version_label = BTreeMap::from([(APP_VERSION_LABEL.to_string(), gate.version().to_string())]);

    let pod_spec = PodSpec {
        containers: containers.containers,
        init_containers: some_if_any(init_containers.containers),
        volumes: Some(volumes),
        service_account_name: spec.service_account_name.clone(),
        automount_service_account_token: spec.automount_service_account_token,
        node_selector: spec.node_selector.clone(),
        affinity: spec.affinity.clone(),
        tolerations: some_if_any(spec.tolerations.clone()),
        topology_spread_constraints: some_if_any(spec.topology_spread_constraints.clone()),
        priority_class_name: spec.priority_class_name.clone(),
        host_aliases: some_if_any(spec.host_aliases.clone()),
        security_context: spec.security_context.clone(),
        image_pull_secrets: some_if_any(spec.image_pull_secrets.clone()),
        share_process_namespace: (reload == ReloadStrategy::ProcessSignal).then_some(true),
        termination_grace_period_seconds: Some(TERMINATION_GRACE_PERIOD_SECONDS),
        ..Default::default()
    };

    let hash = inputs
        .hash_into(InputHasher::new().object("target", alertmanager)?)?
        .finish();
    debug!(replicas, hash = %hash, "synthesized workload");

    let statefulset = WorkloadTemplate {
        name: format!("alertmanager-{name}"),
        namespace: namespace.clone(),
        owner: alertmanager.controller_owner_ref(&()),
        target_labels: alertmanager.labels().clone(),
        target_annotations: alertmanager.annotations().clone(),
        selector_labels,
        pod_labels: merged([&pod_metadata.labels.unwrap_or_default(), &version_label]),
        pod_annotations: pod_metadata.annotations.unwrap_or_default(),
        default_container: CONTAINER_NAME,
        replicas,
        service_name: GOVERNING_SERVICE,
        min_ready_seconds: spec.min_ready_seconds,
        pod_spec,
        claims,
    }
    .build(config, &hash);

    let web_config = web_supported
        .then(|| {
            web.secret(ObjectMeta {
                namespace: Some(namespace.clone()),
                labels: Some(config.labels.clone()),
                owner_references: alertmanager.controller_owner_ref(&()).map(|o| vec![o]),
                ..Default::default()
            })
        })
        .transpose()?;

    Ok(Workloads {
        statefulsets: vec![statefulset],
        service: governing_service(alertmanager, &namespace, port_name, config),
        web_config,
        diagnostics,
    })
}

fn governing_service(
    alertmanager: &Alertmanager,
    namespace: &str,
    port_name: &str,
    config: &OperatorConfig,
) -> Service {
    let operated = BTreeMap::from([("operated-alertmanager".to_string(), "true".to_string())]);
    let port = |name: &str, port: i32, target: IntOrString, protocol: &str| ServicePort {
        name: Some(name.into()),
        port,
        target_port: Some(target),
        protocol: Some(protocol.into()),
        ..Default::default()
    };

    Service {
        metadata: ObjectMeta {
            name: Some(GOVERNING_SERVICE.into()),
            namespace: Some(namespace.into()),
            labels: Some(merged([&config.labels, &operated])),
            owner_references: alertmanager.owner_ref(&()).map(|o| vec![o]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".into()),
            ports: Some(vec![
                port(
                    port_name,
                    i32::from(WEB_PORT),
                    IntOrString::String(port_name.into()),
                    "TCP",
                ),
                port("tcp-mesh", MESH_PORT, IntOrString::Int(MESH_PORT), "TCP"),
                port("udp-mesh", MESH_PORT, IntOrString::Int(MESH_PORT), "UDP"),
            ]),
            selector: Some(BTreeMap::from([(
                APP_NAME_LABEL.to_string(),
                APP_NAME.to_string(),
            )])),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::apps::v1::StatefulSet;
    use k8s_openapi::api::core::v1::{ConfigMapKeySelector, HostAlias, SecretKeySelector};
    use serde_json::Value;
    use vigil_crd::common::{EmbeddedPersistentVolumeClaim, SecretOrConfigMap, StorageSpec};
    use vigil_crd::v1::AlertmanagerSpec;
    use vigil_crd::v1::alertmanager::AlertmanagerGlobalConfiguration;

    use super::*;
    use crate::DiagnosticReason;
    use crate::hash::INPUT_HASH_ANNOTATION;

    fn alertmanager(spec: AlertmanagerSpec) -> Alertmanager {
        let mut am = Alertmanager::new("main", spec);
        am.metadata.namespace = Some("monitoring".into());
        am.metadata.uid = Some("4e0c7f52".into());
        am
    }

    fn synthesize_with(am: &Alertmanager, config: &OperatorConfig, payload: &[u8]) -> Result<Workloads> {
        let artifact = alertmanager_config_artifact(am, payload)?;
        let monitors = BTreeMap::new();
        synthesize_alertmanager(
            am,
            SynthesisInputs {
                config,
                artifact: &artifact,
                monitors: &monitors,
                tls_asset_secrets: &["alertmanager-main-tls-assets-0".to_string()],
            },
        )
    }

    fn synthesize(am: &Alertmanager) -> Result<Workloads> {
        synthesize_with(am, &OperatorConfig::default(), b"route: {receiver: null}")
    }

    fn pod_spec(sts: &StatefulSet) -> &PodSpec {
        sts.spec.as_ref().unwrap().template.spec.as_ref().unwrap()
    }

    fn main_container(sts: &StatefulSet) -> &Container {
        &pod_spec(sts).containers[0]
    }

    #[test]
    fn host_aliases_reach_the_pod() {
        let am = alertmanager(AlertmanagerSpec {
            host_aliases: vec![HostAlias {
                ip: "10.0.0.7".into(),
                hostnames: Some(vec!["smtp.internal".into()]),
            }],
            ..Default::default()
        });
        let out = synthesize(&am).unwrap();
        let aliases = pod_spec(&out.statefulsets[0]).host_aliases.as_ref().unwrap();

        assert_eq!(aliases.len(), 1);
        assert_eq!(aliases[0].ip, "10.0.0.7");
        assert_eq!(aliases[0].hostnames.as_deref(), Some(&["smtp.internal".to_string()][..]));

        let plain = synthesize(&alertmanager(AlertmanagerSpec::default())).unwrap();
        assert!(pod_spec(&plain.statefulsets[0]).host_aliases.is_none());
    }

    #[test]
    fn config_artifact_is_named_after_the_target() {
        let am = alertmanager(AlertmanagerSpec::default());
        let artifact = alertmanager_config_artifact(&am, b"route: {}").unwrap();
        assert_eq!(artifact.name, "alertmanager-main-generated");
        assert_eq!(artifact.key, ALERTMANAGER_CONFIG_KEY);
    }

    #[test]
    fn single_replica_disables_clustering() {
        let am = alertmanager(AlertmanagerSpec::default());
        let out = synthesize(&am).unwrap();
        let sts = &out.statefulsets[0];

        assert_eq!(sts.name_any(), "alertmanager-main");
        assert_eq!(
            main_container(sts).args.as_deref().unwrap(),
            [
                "--config.file=/etc/alertmanager/config_out/alertmanager.env.yaml",
                "--storage.path=/alertmanager",
                "--data.retention=120h",
                "--cluster.listen-address=",
                "--web.listen-address=:9093",
                "--web.route-prefix=/",
                "--cluster.label=monitoring/main",
                "--cluster.peer=alertmanager-main-0.alertmanager-operated:9094",
                "--cluster.reconnect-timeout=5m",
                "--web.config.file=/etc/alertmanager/web_config/web-config.yaml",
            ]
        );
        assert_eq!(pod_spec(sts).termination_grace_period_seconds, Some(120));
        assert!(out.diagnostics.is_empty());
    }

    #[test]
    fn replicas_peer_with_each_other() {
        let mut am = alertmanager(AlertmanagerSpec::default());
        am.spec.replicas = Some(3);
        am.spec.additional_peers = vec!["am-remote:9094".into()];
        let config = OperatorConfig {
            cluster_domain: Some("cluster.local".into()),
            ..OperatorConfig::default()
        };
        let out = synthesize_with(&am, &config, b"").unwrap();
        let args = main_container(&out.statefulsets[0]).args.clone().unwrap();

        assert!(args.contains(&"--cluster.listen-address=[$(POD_IP)]:9094".to_string()));
        let peers: Vec<_> = args.iter().filter(|a| a.starts_with("--cluster.peer=")).collect();
        assert_eq!(
            peers,
            [
                "--cluster.peer=alertmanager-main-0.alertmanager-operated.monitoring.svc.cluster.local.:9094",
                "--cluster.peer=alertmanager-main-1.alertmanager-operated.monitoring.svc.cluster.local.:9094",
                "--cluster.peer=alertmanager-main-2.alertmanager-operated.monitoring.svc.cluster.local.:9094",
                "--cluster.peer=am-remote:9094",
            ]
        );
        assert_eq!(out.statefulsets[0].spec.as_ref().unwrap().replicas, Some(3));
    }

    #[test]
    fn forced_cluster_mode_with_one_replica() {
        let mut am = alertmanager(AlertmanagerSpec::default());
        am.spec.force_enable_cluster_mode = true;
        let out = synthesize(&am).unwrap();
        let args = main_container(&out.statefulsets[0]).args.clone().unwrap();
        assert!(args.contains(&"--cluster.listen-address=[$(POD_IP)]:9094".to_string()));
    }

    #[test]
    fn legacy_versions_use_old_dialect() {
        let mut am = alertmanager(AlertmanagerSpec::default());
        am.spec.version = Some("v0.12.0".into());
        let out = synthesize(&am).unwrap();
        let args = main_container(&out.statefulsets[0]).args.clone().unwrap();

        assert!(args.contains(&"-mesh.peer=alertmanager-main-0.alertmanager-operated".to_string()));
        assert!(args.contains(&"-mesh.listen-address=".to_string()));
        assert!(args.iter().all(|a| !a.starts_with("--")));
        assert!(out.web_config.is_none());
        assert!(
            out.diagnostics
                .iter()
                .all(|d| !matches!(d.reason, DiagnosticReason::UnsupportedFlag(_)))
        );
    }

    #[test]
    fn explicit_cluster_label_on_old_version_is_reported() {
        let mut am = alertmanager(AlertmanagerSpec::default());
        am.spec.version = Some("v0.25.0".into());
        am.spec.cluster_label = Some("eu-west".into());
        let out = synthesize(&am).unwrap();
        let args = main_container(&out.statefulsets[0]).args.clone().unwrap();

        assert!(args.iter().all(|a| !a.starts_with("--cluster.label")));
        let reasons: Vec<_> = out.diagnostics.iter().map(|d| d.reason.clone()).collect();
        assert_eq!(reasons, [DiagnosticReason::UnsupportedFlag("cluster.label".into())]);
    }

    #[test]
    fn unsupported_major_is_fatal() {
        let mut am = alertmanager(AlertmanagerSpec::default());
        am.spec.version = Some("1.0.0".into());
        let err = synthesize(&am).unwrap_err();
        assert!(matches!(err, Error::UnsupportedVersion { .. }));
        assert!(err.is_input_error());
    }

    #[test]
    fn negative_replicas_become_zero() {
        let mut am = alertmanager(AlertmanagerSpec::default());
        am.spec.replicas = Some(-2);
        let out = synthesize(&am).unwrap();
        assert_eq!(out.statefulsets[0].spec.as_ref().unwrap().replicas, Some(0));
        let args = main_container(&out.statefulsets[0]).args.clone().unwrap();
        assert!(args.iter().all(|a| !a.starts_with("--cluster.peer")));
    }

    #[test]
    fn ports_probes_and_resources() {
        let am = alertmanager(AlertmanagerSpec::default());
        let out = synthesize(&am).unwrap();
        let main = main_container(&out.statefulsets[0]);

        let ports: Vec<_> = main
            .ports
            .as_ref()
            .unwrap()
            .iter()
            .map(|p| (p.name.clone().unwrap(), p.container_port, p.protocol.clone().unwrap()))
            .collect();
        assert_eq!(
            ports,
            [
                ("web".to_string(), 9093, "TCP".to_string()),
                ("mesh-tcp".to_string(), 9094, "TCP".to_string()),
                ("mesh-udp".to_string(), 9094, "UDP".to_string()),
            ]
        );

        let readiness = main.readiness_probe.as_ref().unwrap();
        assert_eq!(readiness.initial_delay_seconds, Some(3));
        assert_eq!(readiness.failure_threshold, Some(10));
        assert_eq!(
            readiness.http_get.as_ref().unwrap().path.as_deref(),
            Some("/-/ready")
        );
        assert_eq!(
            main.resources.as_ref().unwrap().requests.as_ref().unwrap()["memory"],
            Quantity("200Mi".into())
        );

        let service = out.service.spec.unwrap();
        let service_ports: Vec<_> = service.ports.unwrap().into_iter().filter_map(|p| p.name).collect();
        assert_eq!(service_ports, ["web", "tcp-mesh", "udp-mesh"]);
        assert_eq!(service.cluster_ip.as_deref(), Some("None"));
    }

    #[test]
    fn listen_local_removes_the_web_port() {
        let mut am = alertmanager(AlertmanagerSpec::default());
        am.spec.listen_local = true;
        let out = synthesize(&am).unwrap();
        let main = main_container(&out.statefulsets[0]);

        assert!(main.args.as_ref().unwrap().contains(&"--web.listen-address=127.0.0.1:9093".to_string()));
        assert!(main.ports.as_ref().unwrap().iter().all(|p| p.container_port != 9093));
        assert!(main.liveness_probe.as_ref().unwrap().exec.is_some());
    }

    #[test]
    fn templates_are_projected_first_key_wins() {
        let mut am = alertmanager(AlertmanagerSpec::default());
        am.spec.alertmanager_configuration = Some(AlertmanagerGlobalConfiguration {
            name: None,
            templates: vec![
                SecretOrConfigMap {
                    config_map: Some(ConfigMapKeySelector {
                        name: "base".into(),
                        key: "default.tmpl".into(),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                SecretOrConfigMap {
                    secret: Some(SecretKeySelector {
                        name: "override".into(),
                        key: "default.tmpl".into(),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            ],
        });
        let out = synthesize(&am).unwrap();
        let sts = &out.statefulsets[0];

        let volume = pod_spec(sts)
            .volumes
            .as_ref()
            .unwrap()
            .iter()
            .find(|v| v.name == TEMPLATES_VOLUME)
            .unwrap();
        assert_eq!(volume.projected.as_ref().unwrap().sources.as_ref().unwrap().len(), 1);
        assert!(
            main_container(sts)
                .volume_mounts
                .as_ref()
                .unwrap()
                .iter()
                .any(|m| m.mount_path == TEMPLATES_DIR)
        );
        assert_eq!(out.diagnostics.for_key("secret/override").count(), 1);
    }

    #[test]
    fn claim_template_replaces_the_data_volume() {
        let mut am = alertmanager(AlertmanagerSpec::default());
        am.spec.storage = Some(StorageSpec {
            volume_claim_template: Some(EmbeddedPersistentVolumeClaim::default()),
            ..Default::default()
        });
        let out = synthesize(&am).unwrap();
        let sts = &out.statefulsets[0];

        let claims = sts.spec.as_ref().unwrap().volume_claim_templates.as_ref().unwrap();
        assert_eq!(claims[0].metadata.name.as_deref(), Some("alertmanager-main-db"));
        assert!(
            pod_spec(sts)
                .volumes
                .as_ref()
                .unwrap()
                .iter()
                .all(|v| v.name != "alertmanager-main-db")
        );
    }

    #[test]
    fn hash_tracks_configuration_and_spec() {
        let am = alertmanager(AlertmanagerSpec::default());
        let config = OperatorConfig::default();
        let a = synthesize_with(&am, &config, b"route: {}").unwrap();
        let b = synthesize_with(&am, &config, b"route: {}").unwrap();
        assert_eq!(
            serde_json::to_value(&a).unwrap(),
            serde_json::to_value(&b).unwrap()
        );

        let c = synthesize_with(&am, &config, b"route: {receiver: team}").unwrap();
        assert_ne!(a.input_hashes(), c.input_hashes());

        let mut resized = am.clone();
        resized.spec.replicas = Some(2);
        let d = synthesize_with(&resized, &config, b"route: {}").unwrap();
        assert_ne!(a.input_hashes(), d.input_hashes());

        let hash: &Value = &serde_json::to_value(&a.statefulsets[0]).unwrap()["metadata"]["annotations"]
            [INPUT_HASH_ANNOTATION];
        assert_eq!(hash.as_str().unwrap().len(), 64);
    }

    #[test]
    fn process_signal_reloads_without_http() {
        let mut am = alertmanager(AlertmanagerSpec::default());
        am.spec.reload_strategy = Some(ReloadStrategy::ProcessSignal);
        let out = synthesize(&am).unwrap();
        let sts = &out.statefulsets[0];

        assert_eq!(pod_spec(sts).share_process_namespace, Some(true));
        let reloader = pod_spec(sts).containers.iter().find(|c| c.name == "config-reloader").unwrap();
        let args = reloader.args.as_ref().unwrap();
        assert!(args.contains(&"--reload-method=signal".to_string()));
        assert!(args.iter().all(|a| !a.starts_with("--reload-url")));
    }
}
