//! Prints the desired state of every monitoring target in the cluster.
//!
//! Nothing is written to the cluster. Each target yields one JSON line on
//! stdout.

use std::collections::BTreeMap;
use std::fmt::Debug;

use anyhow::Context;
use k8s_openapi::api::core::v1::{Namespace, Secret};
use kube::api::{Api, ListParams};
use kube::runtime::reflector::{self, Store};
use kube::runtime::watcher;
use kube::{Client, Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{info, instrument, warn};
use vigil::artifact::{ALERTMANAGER_CONFIG_KEY, ConfigArtifact, PROMETHEUS_CONFIG_KEY};
use vigil::selector::{KubeAuthorizer, ResourceSelector, SelectionResult, StoreCache};
use vigil::synth::{
    SynthesisInputs, Target, Workloads, alertmanager_config_artifact, synthesize_alertmanager,
    synthesize_prometheus,
};
use vigil::{Diagnostics, OperatorConfig, telemetry};
use vigil_crd::{Alertmanager, PodMonitor, Probe, Prometheus, PrometheusAgent, ServiceMonitor};

/// Everything listed once at startup
struct Snapshot {
    service_monitors: StoreCache<ServiceMonitor>,
    pod_monitors: StoreCache<PodMonitor>,
    probes: StoreCache<Probe>,
}

/// Lists every `K` in the cluster into a reflector store
async fn list_into_store<K>(client: &Client) -> anyhow::Result<Store<K>>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    let (store, mut writer) = reflector::store();
    let objects = Api::<K>::all(client.clone())
        .list(&ListParams::default())
        .await
        .with_context(|| format!("listing {}", K::plural(&())))?;
    for object in objects {
        writer.apply_watcher_event(&watcher::Event::Apply(object));
    }
    Ok(store)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WorkloadReport {
    name: String,
    input_hash: String,
}

#[derive(Serialize, Default)]
#[serde(rename_all = "camelCase")]
struct Report {
    kind: String,
    namespace: String,
    name: String,
    selected: Vec<String>,
    diagnostics: Diagnostics,
    workloads: Vec<WorkloadReport>,
    service: Option<String>,
    web_config_secret: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    trace_id: Option<String>,
}

impl Report {
    fn new(kind: &str, namespace: &str, name: &str) -> Self {
        Self {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
            trace_id: telemetry::current_trace_id(),
            ..Default::default()
        }
    }

    /// Keeps the diagnostics of a selection and returns its fingerprint
    fn absorb<K: Serialize>(&mut self, selection: SelectionResult<K>) -> vigil::Result<BTreeMap<String, Value>> {
        let fingerprint = selection.fingerprint()?;
        self.diagnostics.extend(selection.diagnostics);
        Ok(fingerprint)
    }

    fn record(&mut self, result: vigil::Result<Workloads>) {
        match result {
            Ok(workloads) => {
                self.workloads = workloads
                    .input_hashes()
                    .into_iter()
                    .map(|(name, input_hash)| WorkloadReport { name, input_hash })
                    .collect();
                self.service = workloads.service.metadata.name;
                self.web_config_secret = workloads.web_config.and_then(|s| s.metadata.name);
                self.diagnostics.extend(workloads.diagnostics);
            }
            Err(e) => {
                warn!(kind = %self.kind, namespace = %self.namespace, name = %self.name, error = %e, input_error = e.is_input_error(), "synthesis failed");
                self.error = Some(e.to_string());
            }
        }
    }
}

/// Reads the stored configuration payload; a missing secret or key is empty
async fn stored_payload(client: &Client, namespace: &str, name: &str, key: &str) -> anyhow::Result<Vec<u8>> {
    let secret = Api::<Secret>::namespaced(client.clone(), namespace)
        .get_opt(name)
        .await
        .with_context(|| format!("reading secret {namespace}/{name}"))?;
    let payload = match secret {
        Some(secret) => ConfigArtifact::payload_from_secret(&secret, key)?,
        None => None,
    };
    Ok(payload.unwrap_or_else(|| {
        warn!(namespace, secret = name, key, "no stored configuration, using an empty payload");
        Vec::new()
    }))
}

#[instrument(skip_all, fields(kind = target.kind(), namespace = target.namespace(), name = target.name()))]
async fn report_prometheus(
    client: &Client,
    config: &OperatorConfig,
    snapshot: &Snapshot,
    target: Target<'_>,
) -> anyhow::Result<Report> {
    let namespace = target.namespace();
    let mut report = Report::new(target.kind(), namespace, target.name());
    let authorizer = KubeAuthorizer::new(client.clone());
    let selector = ResourceSelector::new(namespace, &authorizer, config.authz_timeout);
    let [service_monitors, pod_monitors, probes] = target.monitor_selectors(config);

    let selections = [
        selector.select(&service_monitors, &snapshot.service_monitors).await.and_then(|r| report.absorb(r)),
        selector.select(&pod_monitors, &snapshot.pod_monitors).await.and_then(|r| report.absorb(r)),
        selector.select(&probes, &snapshot.probes).await.and_then(|r| report.absorb(r)),
    ];

    let mut monitors = BTreeMap::new();
    for selection in selections {
        match selection {
            Ok(selected) => monitors.extend(selected),
            Err(e) => {
                report.record(Err(e));
                return Ok(report);
            }
        }
    }
    report.selected = monitors.keys().cloned().collect();

    let payload = stored_payload(client, namespace, &target.config_secret_name(), PROMETHEUS_CONFIG_KEY).await?;
    let artifact = target.config_artifact(&payload)?;
    let tls_asset_secrets = [target.tls_assets_secret_name(0)];

    report.record(synthesize_prometheus(
        target,
        SynthesisInputs {
            config,
            artifact: &artifact,
            monitors: &monitors,
            tls_asset_secrets: &tls_asset_secrets,
        },
    ));
    Ok(report)
}

#[instrument(skip_all, fields(namespace = ?alertmanager.namespace(), name = %alertmanager.name_any()))]
async fn report_alertmanager(
    client: &Client,
    config: &OperatorConfig,
    alertmanager: &Alertmanager,
) -> anyhow::Result<Report> {
    let namespace = alertmanager.namespace().unwrap_or_default();
    let name = alertmanager.name_any();
    let mut report = Report::new("Alertmanager", &namespace, &name);

    let secret_name = format!("alertmanager-{name}-generated");
    let payload = stored_payload(client, &namespace, &secret_name, ALERTMANAGER_CONFIG_KEY).await?;
    let artifact = alertmanager_config_artifact(alertmanager, &payload)?;
    let tls_asset_secrets = [format!("alertmanager-{name}-tls-assets-0")];
    let monitors = BTreeMap::<String, Value>::new();

    report.record(synthesize_alertmanager(
        alertmanager,
        SynthesisInputs {
            config,
            artifact: &artifact,
            monitors: &monitors,
            tls_asset_secrets: &tls_asset_secrets,
        },
    ));
    Ok(report)
}

fn print(report: &Report) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string(report)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let telemetry = telemetry::init()?;
    let config = OperatorConfig::from_env()?;
    let client = Client::try_default().await.context("connecting to the cluster")?;

    let namespaces = list_into_store::<Namespace>(&client).await?;
    let snapshot = Snapshot {
        service_monitors: StoreCache::new(namespaces.clone(), list_into_store(&client).await?),
        pod_monitors: StoreCache::new(namespaces.clone(), list_into_store(&client).await?),
        probes: StoreCache::new(namespaces, list_into_store(&client).await?),
    };

    let lp = ListParams::default();
    let server_api = Api::<Prometheus>::all(client.clone());
    let agent_api = Api::<PrometheusAgent>::all(client.clone());
    let alertmanager_api = Api::<Alertmanager>::all(client.clone());
    let (servers, agents, alertmanagers) = futures::try_join!(
        server_api.list(&lp),
        agent_api.list(&lp),
        alertmanager_api.list(&lp),
    )
    .context("listing targets")?;
    info!(
        prometheuses = servers.items.len(),
        agents = agents.items.len(),
        alertmanagers = alertmanagers.items.len(),
        "listed targets"
    );

    let targets = servers
        .items
        .iter()
        .map(Target::from)
        .chain(agents.items.iter().map(Target::from));
    for target in targets {
        print(&report_prometheus(&client, &config, &snapshot, target).await?)?;
    }
    for alertmanager in &alertmanagers.items {
        print(&report_alertmanager(&client, &config, alertmanager).await?)?;
    }

    telemetry.shutdown()
}
