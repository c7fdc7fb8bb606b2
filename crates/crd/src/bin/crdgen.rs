//! Generates yaml CRD resources from rust code.
//! Every definition is written to its own file in `CRDS_DIR`, which defaults to
//! the current directory.
use std::{fs, path::PathBuf};

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::CustomResourceExt;
use vigil_crd::{Alertmanager, PodMonitor, Probe, Prometheus, PrometheusAgent, ServiceMonitor};

fn write_crd(dir: &PathBuf, file: &str, crd: &CustomResourceDefinition) -> std::io::Result<()> {
    let yaml = serde_yaml::to_string(crd).map_err(std::io::Error::other)?;
    fs::write(dir.join(file), yaml)
}

fn main() -> std::io::Result<()> {
    let dir = std::env::var_os("CRDS_DIR").map_or_else(|| PathBuf::from("."), PathBuf::from);

    write_crd(&dir, "prometheus-crd.yaml", &Prometheus::crd())?;
    write_crd(&dir, "prometheusagent-crd.yaml", &PrometheusAgent::crd())?;
    write_crd(&dir, "alertmanager-crd.yaml", &Alertmanager::crd())?;
    write_crd(&dir, "servicemonitor-crd.yaml", &ServiceMonitor::crd())?;
    write_crd(&dir, "podmonitor-crd.yaml", &PodMonitor::crd())?;
    write_crd(&dir, "probe-crd.yaml", &Probe::crd())?;

    Ok(())
}
