//! Prometheus server and agent workloads

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EmptyDirVolumeSource, PodSpec, Service, ServicePort, ServiceSpec,
    TopologySpreadConstraint, Volume,
};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::ObjectMeta;
use semver::Version;
use tracing::{debug, instrument};
use vigil_crd::common::{AdditionalLabelSelectors, ReloadStrategy};
use vigil_crd::v1::CommonPrometheusFields;

use super::reloader::ReloaderBuilder;
use super::volumes::{
    config_out_volume, data_storage, mount, secret_volume, tls_assets_volume, user_mounts,
};
use super::webconfig::WebConfig;
use super::{
    APP_INSTANCE_LABEL, APP_MANAGED_BY_LABEL, APP_NAME_LABEL, APP_VERSION_LABEL, MANAGED_BY,
    MODE_LABEL, Mode, NAME_LABEL, SHARD_LABEL, SynthesisInputs, Target, WorkloadTemplate,
    Workloads, image_path, merged, non_default, probe, probe_check, reload_strategy,
    restricted_security_context, route_path, route_prefix, some_if_any,
};
use crate::hash::InputHasher;
use crate::merge::merge_containers;
use crate::version::{Argument, VersionGate, VersionedArgument};
use crate::{Diagnostics, Error, OperatorConfig, Result};

const CONTAINER_NAME: &str = "prometheus";
const PORT: u16 = 9090;
const DEFAULT_PORT_NAME: &str = "web";
const TERMINATION_GRACE_PERIOD_SECONDS: i64 = 600;

const CONFIG_DIR: &str = "/etc/prometheus/config";
const CONFIG_OUT_DIR: &str = "/etc/prometheus/config_out";
const CONFIG_ENVSUBST_FILE: &str = "prometheus.env.yaml";
const TLS_ASSETS_DIR: &str = "/etc/prometheus/certs";
const WEB_CONFIG_DIR: &str = "/etc/prometheus/web_config";
const SECRETS_DIR: &str = "/etc/prometheus/secrets";
const CONFIG_MAPS_DIR: &str = "/etc/prometheus/configmaps";
const STORAGE_DIR: &str = "/prometheus";
const QUERY_LOG_DIR: &str = "/var/log/prometheus";
const QUERY_LOG_VOLUME: &str = "query-log-file";

const DEFAULT_RETENTION: &str = "24h";

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

/// Startup probe period and failure threshold for a maximum startup duration
fn startup_timing(max_startup_seconds: Option<i32>) -> (i32, i32) {
    match max_startup_seconds {
        Some(d) if d >= 60 => {
            let d = d.unsigned_abs();
            let failures = d.div_ceil(60);
            let period = d.div_ceil(failures);
            (
                i32::try_from(period).unwrap_or(i32::MAX),
                i32::try_from(failures).unwrap_or(i32::MAX),
            )
        }
        _ => (15, 60),
    }
}

/// A query log file without a directory lands in a generated volume
fn query_log_path(file: &str) -> (String, bool) {
    if file.contains('/') {
        (file.to_string(), false)
    } else {
        (format!("{QUERY_LOG_DIR}/{file}"), true)
    }
}

/// Arguments of the main container, before version gating
fn candidate_arguments(
    target: Target<'_>,
    gate: &VersionGate,
    web: &WebConfig<'_>,
    prefix: &str,
    reload: ReloadStrategy,
) -> Vec<VersionedArgument> {
    let spec = target.common_fields();
    let v = Version::new;
    let mut args: Vec<VersionedArgument> = Vec::new();

    if target.mode() == Mode::Server {
        args.push(Argument::new("web.console.templates", "/etc/prometheus/consoles").into());
        args.push(
            Argument::new("web.console.libraries", "/etc/prometheus/console_libraries").into(),
        );
    }
    args.push(
        Argument::new("config.file", format!("{CONFIG_OUT_DIR}/{CONFIG_ENVSUBST_FILE}")).into(),
    );
    if reload == ReloadStrategy::Http {
        args.push(Argument::flag("web.enable-lifecycle").into());
    }

    let web_spec = spec.web.as_ref();
    if let Some(title) = non_empty(web_spec.and_then(|w| w.page_title.as_deref())) {
        args.push(Argument::new("web.page-title", title).since(v(2, 6, 0)));
    }
    if let Some(max) = web_spec.and_then(|w| w.max_connections) {
        args.push(Argument::new("web.max-connections", max.to_string()).into());
    }
    if spec.enable_remote_write_receiver {
        args.push(Argument::flag("web.enable-remote-write-receiver").since(v(2, 33, 0)));
    }

    let mut features = spec.enable_features.clone();
    if target.mode() == Mode::Agent && gate.version().major == 2 {
        features.push("agent".into());
    }
    if !features.is_empty() {
        args.push(Argument::new("enable-feature", features.join(",")).since(v(2, 25, 0)));
    }

    if let Some(url) = non_empty(spec.external_url.as_deref()) {
        args.push(Argument::new("web.external-url", url).into());
    }
    args.push(Argument::new("web.route-prefix", prefix).into());
    if let Some(level) = non_default(spec.log_level.as_deref(), "info") {
        args.push(Argument::new("log.level", level).into());
    }
    if let Some(format) = non_default(spec.log_format.as_deref(), "logfmt") {
        args.push(Argument::new("log.format", format).since(v(2, 6, 0)));
    }
    if spec.listen_local {
        args.push(Argument::new("web.listen-address", format!("127.0.0.1:{PORT}")).into());
    }

    match target {
        Target::Server(prom) => {
            let server = &prom.spec;
            args.push(Argument::new("storage.tsdb.path", STORAGE_DIR).into());

            let size = non_empty(server.retention_size.as_deref());
            let retention = non_empty(server.retention.as_deref())
                .or_else(|| size.is_none().then_some(DEFAULT_RETENTION));
            if let Some(retention) = retention {
                let flag = if gate.at_least(2, 7, 0) {
                    "storage.tsdb.retention.time"
                } else {
                    "storage.tsdb.retention"
                };
                args.push(Argument::new(flag, retention).into());
            }
            if let Some(size) = size {
                args.push(Argument::new("storage.tsdb.retention.size", size).since(v(2, 7, 0)));
            }
            if server.enable_admin_api {
                args.push(Argument::flag("web.enable-admin-api").into());
            }
            if let Some(file) = non_empty(server.query_log_file.as_deref()) {
                let (path, _) = query_log_path(file);
                args.push(Argument::new("query.log-file", path).since(v(2, 16, 0)));
            }
            if server.disable_compaction {
                args.push(Argument::new("storage.tsdb.max-block-duration", "2h").into());
            }
        }
        Target::Agent(_) => {
            if gate.version().major >= 3 {
                args.push(Argument::flag("agent").into());
            }
            args.push(Argument::new("storage.agent.path", STORAGE_DIR).into());
        }
    }

    args.push(web.argument().implied_since(v(2, 24, 0)));
    args
}

/// Adds the generated selector labels to topology spread constraints that ask for them
fn topology_spread_constraints(
    spec: &CommonPrometheusFields,
    selector_labels: &BTreeMap<String, String>,
) -> Vec<TopologySpreadConstraint> {
    spec.topology_spread_constraints
        .iter()
        .map(|constraint| {
            let mut core = constraint.core.clone();
            if let Some(additional) = constraint.additional_label_selectors {
                let mut labels = selector_labels.clone();
                if additional == AdditionalLabelSelectors::OnResource {
                    labels.remove(SHARD_LABEL);
                }
                core.label_selector
                    .get_or_insert_with(Default::default)
                    .match_labels
                    .get_or_insert_with(BTreeMap::new)
                    .extend(labels);
            }
            core
        })
        .collect()
}

/// Compiles a Prometheus server or agent into one workload per shard, the
/// governing service and the web configuration secret.
///
/// # Errors
///
/// Input errors ([`Error::is_input_error`]) for an unusable version, image,
/// volume name or container override; serialization errors while hashing.
#[allow(clippy::too_many_lines)]
#[instrument(skip_all, fields(kind = target.kind(), namespace = target.namespace(), name = target.name()))]
pub fn synthesize_prometheus(target: Target<'_>, inputs: SynthesisInputs<'_>) -> Result<Workloads> {
    let config = inputs.config;
    let spec = target.common_fields();
    let (name, namespace) = (target.name(), target.namespace());
    if name.is_empty() || namespace.is_empty() {
        return Err(Error::InvalidInput(format!(
            "{} needs a name and a namespace",
            target.kind()
        )));
    }

    let version = non_empty(spec.version.as_deref()).unwrap_or(config.prometheus_default_version.as_str());
    let gate = VersionGate::new("prometheus", version)?;
    gate.require_major(&[2, 3])?;
    if target.mode() == Mode::Agent && !gate.at_least(2, 32, 0) {
        return Err(Error::InvalidInput(format!(
            "agent mode needs Prometheus 2.32.0 or later, got {}",
            gate.version()
        )));
    }

    let image = image_path(
        spec.image.as_deref(),
        non_empty(spec.base_image.as_deref()).unwrap_or(config.prometheus_base_image.as_str()),
        version,
        spec.tag.as_deref(),
        spec.sha.as_deref(),
    )?;

    let web = WebConfig::new(
        WEB_CONFIG_DIR,
        target.web_config_secret_name(),
        spec.web.as_ref().map(|w| &w.web_config_file_fields),
    );
    let web_supported = gate.at_least(2, 24, 0);
    let https = web_supported && web.tls_enabled();
    let prefix = route_prefix(spec.route_prefix.as_deref());
    let reload = reload_strategy(spec.reload_strategy);
    let port_name = non_empty(spec.port_name.as_deref()).unwrap_or(DEFAULT_PORT_NAME);

    let mut diagnostics = Diagnostics::default();
    let mut args = Vec::new();
    gate.append(
        &mut args,
        candidate_arguments(target, &gate, &web, prefix, reload),
        &mut diagnostics,
    );
    let args = gate.render(args, &[]);

    let mut volumes = vec![
        secret_volume("config", &inputs.artifact.name),
        tls_assets_volume("tls-assets", inputs.tls_asset_secrets),
        config_out_volume("config-out"),
    ];
    let mut mounts = vec![
        mount("config-out", CONFIG_OUT_DIR, true),
        mount("tls-assets", TLS_ASSETS_DIR, true),
    ];

    let storage = data_storage(
        spec.storage.as_ref(),
        &format!("{}-db", target.prefixed_name()),
        STORAGE_DIR,
        "prometheus-db",
    );
    mounts.push(storage.mount.clone());
    volumes.extend(storage.volume);
    let claims: Vec<_> = storage.claim.into_iter().collect();

    let user = user_mounts(&spec.secrets, &spec.config_maps, SECRETS_DIR, CONFIG_MAPS_DIR)?;
    mounts.extend(spec.volume_mounts.iter().cloned());
    mounts.extend(user.mounts.iter().cloned());

    if web_supported {
        let (web_volumes, web_mounts) = web.volumes()?;
        volumes.extend(web_volumes);
        mounts.extend(web_mounts);
    }

    if let Target::Server(prom) = target
        && let Some(file) = non_empty(prom.spec.query_log_file.as_deref())
        && gate.at_least(2, 16, 0)
        && query_log_path(file).1
    {
        volumes.push(Volume {
            name: QUERY_LOG_VOLUME.into(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        });
        mounts.push(mount(QUERY_LOG_VOLUME, QUERY_LOG_DIR, false));
    }

    volumes.extend(user.volumes);
    volumes.extend(spec.volumes.iter().cloned());

    let mut reloader_mounts = vec![
        mount("config", CONFIG_DIR, false),
        mount("config-out", CONFIG_OUT_DIR, false),
    ];
    reloader_mounts.extend(user.mounts);

    let check = |path: &str| probe_check(&route_path(prefix, path), port_name, PORT, spec.listen_local, https);
    let (startup_period, startup_failures) = startup_timing(spec.maximum_startup_duration_seconds);

    let main = Container {
        name: CONTAINER_NAME.into(),
        image: Some(image),
        image_pull_policy: spec.image_pull_policy.clone(),
        args: Some(args),
        ports: (!spec.listen_local).then(|| {
            vec![ContainerPort {
                name: Some(port_name.to_string()),
                container_port: i32::from(PORT),
                protocol: Some("TCP".into()),
                ..Default::default()
            }]
        }),
        volume_mounts: Some(mounts),
        liveness_probe: Some(probe(check("/-/healthy"), 5, 6)),
        readiness_probe: Some(probe(check("/-/ready"), 5, 3)),
        startup_probe: Some(probe(check("/-/ready"), startup_period, startup_failures)),
        resources: spec.resources.clone(),
        security_context: Some(restricted_security_context()),
        termination_message_policy: Some("FallbackToLogsOnError".into()),
        ..Default::default()
    };

    let scheme = if https { "https" } else { "http" };
    let local = format!("{scheme}://{}:{PORT}", config.local_host);
    let reloader = |shard: i32| {
        let builder = ReloaderBuilder::new(&config.reloader, &config.local_host)
            .listen_local(spec.listen_local)
            .config_file(format!("{CONFIG_DIR}/{}", inputs.artifact.key))
            .config_envsubst_file(format!("{CONFIG_OUT_DIR}/{CONFIG_ENVSUBST_FILE}"))
            .watched_dirs(user.directories.iter().cloned())
            .log_level(spec.log_level.as_deref())
            .log_format(spec.log_format.as_deref())
            .shard(shard)
            .image_pull_policy(spec.image_pull_policy.as_deref())
            .mounts(reloader_mounts.clone());
        match reload {
            ReloadStrategy::Http => {
                builder.reload_url(format!("{local}{}", route_path(prefix, "/-/reload")))
            }
            ReloadStrategy::ProcessSignal => builder.reload_signal(Some(format!(
                "{local}{}",
                route_path(prefix, "/api/v1/status/runtimeinfo")
            ))),
        }
    };

    let meta = target.meta();
    let target_labels = meta.labels.clone().unwrap_or_default();
    let target_annotations = meta.annotations.clone().unwrap_or_default();
    let pod_metadata = spec.pod_metadata.clone().unwrap_or_default();
    let version_label = BTreeMap::from([(APP_VERSION_LABEL.to_string(), gate.version().to_string())]);
    let pod_labels = merged([&pod_metadata.labels.unwrap_or_default(), &version_label]);
    let pod_annotations = pod_metadata.annotations.unwrap_or_default();
    let replicas = target.replicas(config);

    let mut statefulsets = Vec::new();
    for shard in 0..target.shards() {
        let containers = merge_containers(vec![main.clone(), reloader(shard).build()], &spec.containers)?;
        let init_containers = merge_containers(vec![reloader(shard).run_once().build()], &spec.init_containers)?;
        // Shards differ only in the SHARD env value, so every shard merges to the same diagnostics.
        if shard == 0 {
            diagnostics.extend(containers.diagnostics);
            diagnostics.extend(init_containers.diagnostics);
        }

        let mut selector_labels = BTreeMap::from([
            (APP_NAME_LABEL.to_string(), target.app_name().to_string()),
            (APP_MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string()),
            (APP_INSTANCE_LABEL.to_string(), name.to_string()),
            (NAME_LABEL.to_string(), name.to_string()),
            (SHARD_LABEL.to_string(), shard.to_string()),
            (MODE_LABEL.to_string(), target.mode().as_str().to_string()),
        ]);
        if target.mode() == Mode::Server {
            selector_labels.insert("prometheus".into(), name.to_string());
        }

        let pod_spec = PodSpec {
            containers: containers.containers,
            init_containers: some_if_any(init_containers.containers),
            volumes: Some(volumes.clone()),
            service_account_name: spec.service_account_name.clone(),
            automount_service_account_token: spec.automount_service_account_token,
            node_selector: spec.node_selector.clone(),
            affinity: spec.affinity.clone(),
            tolerations: some_if_any(spec.tolerations.clone()),
            topology_spread_constraints: some_if_any(topology_spread_constraints(
                spec,
                &selector_labels,
            )),
            priority_class_name: spec.priority_class_name.clone(),
            security_context: spec.security_context.clone(),
            image_pull_secrets: some_if_any(spec.image_pull_secrets.clone()),
            share_process_namespace: (reload == ReloadStrategy::ProcessSignal).then_some(true),
            termination_grace_period_seconds: Some(TERMINATION_GRACE_PERIOD_SECONDS),
            ..Default::default()
        };

        let hash = inputs
            .hash_into(target.hash_object(InputHasher::new())?)?
            .json("shard", &shard)?
            .finish();
        debug!(shard, replicas, hash = %hash, "synthesized workload");

        statefulsets.push(
            WorkloadTemplate {
                name: target.shard_name(shard),
                namespace: namespace.to_string(),
                owner: target.controller_owner_ref(),
                target_labels: target_labels.clone(),
                target_annotations: target_annotations.clone(),
                selector_labels,
                pod_labels: pod_labels.clone(),
                pod_annotations: pod_annotations.clone(),
                default_container: CONTAINER_NAME,
                replicas,
                service_name: target.governing_service_name(),
                min_ready_seconds: spec.min_ready_seconds,
                pod_spec,
                claims: claims.clone(),
            }
            .build(config, &hash),
        );
    }

    let web_config = web_supported
        .then(|| {
            web.secret(ObjectMeta {
                namespace: Some(namespace.to_string()),
                labels: Some(config.labels.clone()),
                owner_references: target.controller_owner_ref().map(|o| vec![o]),
                ..Default::default()
            })
        })
        .transpose()?;

    Ok(Workloads {
        statefulsets,
        service: governing_service(target, port_name, config),
        web_config,
        diagnostics,
    })
}

fn governing_service(target: Target<'_>, port_name: &str, config: &OperatorConfig) -> Service {
    let operated = BTreeMap::from([("operated-prometheus".to_string(), "true".to_string())]);
    Service {
        metadata: ObjectMeta {
            name: Some(target.governing_service_name().into()),
            namespace: Some(target.namespace().into()),
            labels: Some(merged([&config.labels, &operated])),
            owner_references: target.owner_ref().map(|o| vec![o]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".into()),
            ports: Some(vec![ServicePort {
                name: Some(port_name.to_string()),
                port: i32::from(PORT),
                target_port: Some(IntOrString::String(port_name.to_string())),
                protocol: Some("TCP".into()),
                ..Default::default()
            }]),
            selector: Some(BTreeMap::from([(
                APP_NAME_LABEL.to_string(),
                target.app_name().to_string(),
            )])),
            ..Default::default()
        }),
        ..Default::default()
    }
}
