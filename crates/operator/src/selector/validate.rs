use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use vigil_crd::v1::monitors::RelabelConfig;
use vigil_crd::{PodMonitor, Probe, ServiceMonitor};

const RELABEL_ACTIONS: &[&str] = &[
    "replace",
    "keep",
    "drop",
    "hashmod",
    "labelmap",
    "labeldrop",
    "labelkeep",
    "lowercase",
    "uppercase",
    "keepequal",
    "dropequal",
];

/// Actions that write to `targetLabel`
const WRITING_ACTIONS: &[&str] = &["replace", "hashmod", "lowercase", "uppercase", "keepequal", "dropequal"];

/// Structural checks run on every selected monitor
pub trait Validate {
    /// Returns a human readable reason when the object cannot be used.
    ///
    /// # Errors
    ///
    /// The reason the object was rejected.
    fn validate(&self) -> Result<(), String>;
}

impl Validate for ServiceMonitor {
    fn validate(&self) -> Result<(), String> {
        if self.spec.endpoints.is_empty() {
            return Err("no endpoints".into());
        }
        for (i, endpoint) in self.spec.endpoints.iter().enumerate() {
            if endpoint.bearer_token_file.is_some() {
                return Err(format!(
                    "endpoints[{i}]: bearerTokenFile reads files from the Prometheus pod and is not allowed"
                ));
            }
            check_port(
                &format!("endpoints[{i}]"),
                endpoint.port.as_deref(),
                endpoint.target_port.as_ref(),
            )?;
            check_relabelings(&format!("endpoints[{i}].relabelings"), &endpoint.relabelings)?;
            check_relabelings(
                &format!("endpoints[{i}].metricRelabelings"),
                &endpoint.metric_relabelings,
            )?;
        }
        Ok(())
    }
}

impl Validate for PodMonitor {
    fn validate(&self) -> Result<(), String> {
        if self.spec.pod_metrics_endpoints.is_empty() {
            return Err("no podMetricsEndpoints".into());
        }
        for (i, endpoint) in self.spec.pod_metrics_endpoints.iter().enumerate() {
            check_port(
                &format!("podMetricsEndpoints[{i}]"),
                endpoint.port.as_deref(),
                endpoint.target_port.as_ref(),
            )?;
            check_relabelings(
                &format!("podMetricsEndpoints[{i}].relabelings"),
                &endpoint.relabelings,
            )?;
            check_relabelings(
                &format!("podMetricsEndpoints[{i}].metricRelabelings"),
                &endpoint.metric_relabelings,
            )?;
        }
        Ok(())
    }
}

impl Validate for Probe {
    fn validate(&self) -> Result<(), String> {
        let prober = self.spec.prober.as_ref().ok_or("prober is required")?;
        if prober.url.trim().is_empty() {
            return Err("prober.url is required".into());
        }

        let targets = &self.spec.targets;
        match (&targets.static_config, &targets.ingress) {
            (Some(_), Some(_)) => {
                return Err("targets: staticConfig and ingress are mutually exclusive".into());
            }
            (None, None) => return Err("targets: one of staticConfig or ingress is required".into()),
            (Some(config), None) => {
                if config.targets.is_empty() {
                    return Err("targets.staticConfig.static is empty".into());
                }
                check_relabelings("targets.staticConfig.relabelingConfigs", &config.relabeling_configs)?;
            }
            (None, Some(ingress)) => {
                check_relabelings("targets.ingress.relabelingConfigs", &ingress.relabeling_configs)?;
            }
        }

        check_relabelings("metricRelabelings", &self.spec.metric_relabelings)
    }
}

fn check_port(path: &str, port: Option<&str>, target_port: Option<&IntOrString>) -> Result<(), String> {
    match (port, target_port) {
        (Some(_), Some(_)) => Err(format!("{path}: port and targetPort are mutually exclusive")),
        (None, None) => Err(format!("{path}: one of port or targetPort is required")),
        _ => Ok(()),
    }
}

fn check_relabelings(path: &str, configs: &[RelabelConfig]) -> Result<(), String> {
    for (i, config) in configs.iter().enumerate() {
        let action = config.action.as_deref().unwrap_or("replace").to_lowercase();
        if !RELABEL_ACTIONS.contains(&action.as_str()) {
            return Err(format!("{path}[{i}]: unknown action {action:?}"));
        }
        if WRITING_ACTIONS.contains(&action.as_str())
            && config.target_label.as_deref().is_none_or(str::is_empty)
        {
            return Err(format!("{path}[{i}]: action {action:?} requires targetLabel"));
        }
        if action == "hashmod" && config.modulus.is_none_or(|m| m == 0) {
            return Err(format!("{path}[{i}]: hashmod requires a non-zero modulus"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use kube::api::ObjectMeta;
    use vigil_crd::v1::monitors::{
        Endpoint, PodMetricsEndpoint, PodMonitorSpec, ProbeSpec, ProbeTargetIngress,
        ProbeTargetStaticConfig, ProbeTargets, ProberSpec, ServiceMonitorSpec,
    };

    use super::*;

    fn service_monitor(endpoint: Endpoint) -> ServiceMonitor {
        ServiceMonitor {
            metadata: ObjectMeta::default(),
            spec: ServiceMonitorSpec {
                endpoints: vec![endpoint],
                ..Default::default()
            },
        }
    }

    fn relabel(action: &str, target: Option<&str>) -> RelabelConfig {
        RelabelConfig {
            action: Some(action.into()),
            target_label: target.map(String::from),
            ..Default::default()
        }
    }

    #[test]
    fn accepts_plain_service_monitor() {
        let smon = service_monitor(Endpoint {
            port: Some("web".into()),
            relabelings: vec![relabel("labeldrop", None), relabel("Replace", Some("job"))],
            ..Default::default()
        });
        assert_eq!(smon.validate(), Ok(()));
    }

    #[test]
    fn rejects_port_and_target_port_together() {
        let smon = service_monitor(Endpoint {
            port: Some("web".into()),
            target_port: Some(IntOrString::Int(8080)),
            ..Default::default()
        });
        assert!(smon.validate().unwrap_err().contains("mutually exclusive"));
    }

    #[test]
    fn rejects_bad_relabelings() {
        let unknown = service_monitor(Endpoint {
            port: Some("web".into()),
            metric_relabelings: vec![relabel("explode", None)],
            ..Default::default()
        });
        assert!(unknown.validate().unwrap_err().contains("unknown action"));

        let missing_target = service_monitor(Endpoint {
            port: Some("web".into()),
            relabelings: vec![relabel("replace", None)],
            ..Default::default()
        });
        assert!(missing_target.validate().unwrap_err().contains("requires targetLabel"));

        let no_modulus = service_monitor(Endpoint {
            port: Some("web".into()),
            relabelings: vec![relabel("hashmod", Some("__tmp_hash"))],
            ..Default::default()
        });
        assert!(no_modulus.validate().unwrap_err().contains("modulus"));
    }

    #[test]
    fn pod_monitor_needs_a_port() {
        let pmon = PodMonitor {
            metadata: ObjectMeta::default(),
            spec: PodMonitorSpec {
                pod_metrics_endpoints: vec![PodMetricsEndpoint::default()],
                ..Default::default()
            },
        };
        assert!(pmon.validate().unwrap_err().contains("required"));
    }

    #[test]
    fn probe_needs_prober_and_one_target_source() {
        let mut probe = Probe {
            metadata: ObjectMeta::default(),
            spec: ProbeSpec {
                prober: Some(ProberSpec {
                    url: "blackbox:9115".into(),
                    ..Default::default()
                }),
                targets: ProbeTargets {
                    static_config: Some(ProbeTargetStaticConfig {
                        targets: vec!["https://example.com".into()],
                        ..Default::default()
                    }),
                    ingress: None,
                },
                ..Default::default()
            },
        };
        assert_eq!(probe.validate(), Ok(()));

        probe.spec.targets.ingress = Some(ProbeTargetIngress::default());
        assert!(probe.validate().unwrap_err().contains("mutually exclusive"));

        probe.spec.targets = ProbeTargets::default();
        assert!(probe.validate().is_err());

        probe.spec.prober = None;
        assert_eq!(probe.validate(), Err("prober is required".to_string()));
    }
}
