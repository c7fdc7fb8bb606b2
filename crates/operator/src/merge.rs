//! Strategic merge of user supplied container overrides into generated containers.
//!
//! Rules, applied per container matched by name:
//!
//! - scalar fields set in the override replace the generated value;
//! - nested objects (`resources`, `securityContext`, probes, `lifecycle`, ...)
//!   merge recursively, lists inside them are replaced;
//! - `args`, `command`, `envFrom` and every list without a merge key are
//!   replaced wholesale;
//! - keyed lists merge entry by entry: `env` by `name`, `ports` by
//!   `containerPort` + `protocol` (default `TCP`), `volumeMounts` by
//!   `mountPath`, `volumeDevices` by `devicePath`, `resizePolicy` by
//!   `resourceName`. Matching entries merge, new entries are appended.
//!
//! A volume mount whose path matches a generated mount of a different name is
//! appended and reported as a diagnostic. Overrides without a name, duplicate
//! override names and duplicate merge keys inside one override list are
//! conflicts.

use std::collections::BTreeSet;

use k8s_openapi::api::core::v1::Container;
use serde_json::{Map, Value};

use crate::{DiagnosticReason, Diagnostics, Error, Result};

/// Merge keys of the container lists that merge entry by entry
const MERGE_KEYS: &[(&str, &[(&str, Option<&str>)])] = &[
    ("env", &[("name", None)]),
    ("ports", &[("containerPort", None), ("protocol", Some("TCP"))]),
    ("volumeMounts", &[("mountPath", None)]),
    ("volumeDevices", &[("devicePath", None)]),
    ("resizePolicy", &[("resourceName", None)]),
];

/// Result of merging overrides into generated containers
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MergedContainers {
    /// Generated containers in order, followed by override-only containers
    pub containers: Vec<Container>,
    /// Non-fatal merge findings
    pub diagnostics: Diagnostics,
}

/// Merges `overrides` into `defaults`.
///
/// # Errors
///
/// Returns [`Error::MergeConflict`] when an override cannot be reconciled.
pub fn merge_containers(defaults: Vec<Container>, overrides: &[Container]) -> Result<MergedContainers> {
    let mut seen = BTreeSet::new();
    for o in overrides {
        if o.name.is_empty() {
            return Err(conflict("", "override container has no name"));
        }
        if !seen.insert(o.name.as_str()) {
            return Err(conflict(&o.name, "container is overridden more than once"));
        }
    }

    let mut merged = MergedContainers::default();
    let default_names: BTreeSet<String> = defaults.iter().map(|c| c.name.clone()).collect();

    for container in defaults {
        match overrides.iter().find(|o| o.name == container.name) {
            Some(patch) => {
                let name = container.name.clone();
                let result = merge_container(&name, container, patch, &mut merged.diagnostics)?;
                merged.containers.push(result);
            }
            None => merged.containers.push(container),
        }
    }

    merged.containers.extend(
        overrides
            .iter()
            .filter(|o| !default_names.contains(&o.name))
            .cloned(),
    );

    Ok(merged)
}

fn conflict(container: &str, reason: impl Into<String>) -> Error {
    Error::MergeConflict {
        container: container.to_string(),
        reason: reason.into(),
    }
}

fn merge_container(
    name: &str,
    base: Container,
    patch: &Container,
    diagnostics: &mut Diagnostics,
) -> Result<Container> {
    let to_object = |c: &Container| -> Result<Map<String, Value>> {
        match serde_json::to_value(c).map_err(|e| conflict(name, e.to_string()))? {
            Value::Object(map) => Ok(map),
            _ => Err(conflict(name, "container is not an object")),
        }
    };

    let mut base = to_object(&base)?;
    let patch = to_object(patch)?;

    for (field, patch_value) in patch {
        let keys = MERGE_KEYS
            .iter()
            .find(|(f, _)| *f == field)
            .map(|(_, keys)| *keys);
        let merged = match (base.remove(&field), patch_value, keys) {
            (Some(Value::Array(b)), Value::Array(p), Some(keys)) => {
                Value::Array(merge_keyed_list(name, &field, keys, b, p, diagnostics)?)
            }
            (Some(Value::Object(b)), Value::Object(p), _) => Value::Object(merge_object(b, p)),
            (_, patch_value, _) => patch_value,
        };
        base.insert(field, merged);
    }

    serde_json::from_value(Value::Object(base)).map_err(|e| conflict(name, e.to_string()))
}

/// Recursive object merge; non-object values in `patch` replace those in `base`
fn merge_object(mut base: Map<String, Value>, patch: Map<String, Value>) -> Map<String, Value> {
    for (key, value) in patch {
        let merged = match (base.remove(&key), value) {
            (Some(Value::Object(b)), Value::Object(p)) => Value::Object(merge_object(b, p)),
            (_, value) => value,
        };
        base.insert(key, merged);
    }
    base
}

fn merge_key(entry: &Value, keys: &[(&str, Option<&str>)]) -> Option<Vec<String>> {
    keys.iter()
        .map(|(key, default)| match entry.get(*key) {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => default.map(String::from),
        })
        .collect()
}

fn merge_keyed_list(
    container: &str,
    field: &str,
    keys: &[(&str, Option<&str>)],
    mut base: Vec<Value>,
    patch: Vec<Value>,
    diagnostics: &mut Diagnostics,
) -> Result<Vec<Value>> {
    let mut patch_keys = BTreeSet::new();

    for entry in patch {
        let key = merge_key(&entry, keys).ok_or_else(|| {
            conflict(container, format!("{field} entry is missing its merge key"))
        })?;
        if !patch_keys.insert(key.clone()) {
            return Err(conflict(
                container,
                format!("{field} lists {} more than once", key.join("/")),
            ));
        }

        let position = base
            .iter()
            .position(|b| merge_key(b, keys).as_ref() == Some(&key));

        match position {
            Some(i) if field == "volumeMounts" && base[i].get("name") != entry.get("name") => {
                diagnostics.push(
                    container,
                    DiagnosticReason::OverlappingMount(key.join("/")),
                );
                base.push(entry);
            }
            Some(i) => {
                base[i] = match (base[i].take(), entry) {
                    (Value::Object(b), Value::Object(p)) => Value::Object(merge_object(b, p)),
                    (_, p) => p,
                };
            }
            None => base.push(entry),
        }
    }

    Ok(base)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::api::core::v1::{
        ContainerPort, EnvVar, ResourceRequirements, SecurityContext, VolumeMount,
    };
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

    use super::*;

    fn generated() -> Vec<Container> {
        vec![
            Container {
                name: "prometheus".into(),
                image: Some("quay.io/prometheus/prometheus:v2.54.1".into()),
                args: Some(vec!["--config.file=/etc/prometheus/config_out/prometheus.env.yaml".into()]),
                env: Some(vec![EnvVar {
                    name: "POD_IP".into(),
                    value: Some("placeholder".into()),
                    ..Default::default()
                }]),
                ports: Some(vec![ContainerPort {
                    name: Some("web".into()),
                    container_port: 9090,
                    protocol: Some("TCP".into()),
                    ..Default::default()
                }]),
                volume_mounts: Some(vec![VolumeMount {
                    name: "config-out".into(),
                    mount_path: "/etc/prometheus/config_out".into(),
                    read_only: Some(true),
                    ..Default::default()
                }]),
                resources: Some(ResourceRequirements {
                    requests: Some(BTreeMap::from([("memory".into(), Quantity("400Mi".into()))])),
                    ..Default::default()
                }),
                security_context: Some(SecurityContext {
                    read_only_root_filesystem: Some(true),
                    allow_privilege_escalation: Some(false),
                    ..Default::default()
                }),
                ..Default::default()
            },
            Container {
                name: "config-reloader".into(),
                image: Some("reloader:v1".into()),
                ..Default::default()
            },
        ]
    }

    #[test]
    fn untouched_containers_are_kept_in_order() {
        let merged = merge_containers(generated(), &[]).unwrap();
        assert_eq!(merged.containers, generated());
        assert!(merged.diagnostics.is_empty());
    }

    #[test]
    fn scalars_replace_and_nested_objects_merge() {
        let patch = Container {
            name: "prometheus".into(),
            image: Some("custom/prometheus:dev".into()),
            resources: Some(ResourceRequirements {
                limits: Some(BTreeMap::from([("memory".into(), Quantity("1Gi".into()))])),
                ..Default::default()
            }),
            security_context: Some(SecurityContext {
                read_only_root_filesystem: Some(false),
                ..Default::default()
            }),
            ..Default::default()
        };

        let merged = merge_containers(generated(), &[patch]).unwrap();
        let prom = &merged.containers[0];

        assert_eq!(prom.image.as_deref(), Some("custom/prometheus:dev"));
        let resources = prom.resources.as_ref().unwrap();
        assert!(resources.requests.as_ref().unwrap().contains_key("memory"));
        assert!(resources.limits.as_ref().unwrap().contains_key("memory"));
        let sc = prom.security_context.as_ref().unwrap();
        assert_eq!(sc.read_only_root_filesystem, Some(false));
        assert_eq!(sc.allow_privilege_escalation, Some(false));
        assert_eq!(prom.args, generated()[0].args);
    }

    #[test]
    fn args_are_replaced_wholesale() {
        let patch = Container {
            name: "prometheus".into(),
            args: Some(vec!["--log.level=debug".into()]),
            ..Default::default()
        };
        let merged = merge_containers(generated(), &[patch]).unwrap();
        assert_eq!(merged.containers[0].args, Some(vec!["--log.level=debug".to_string()]));
    }

    #[test]
    fn env_merges_by_name() {
        let patch = Container {
            name: "prometheus".into(),
            env: Some(vec![
                EnvVar {
                    name: "POD_IP".into(),
                    value: Some("10.0.0.1".into()),
                    ..Default::default()
                },
                EnvVar {
                    name: "GOMAXPROCS".into(),
                    value: Some("2".into()),
                    ..Default::default()
                },
            ]),
            ..Default::default()
        };

        let merged = merge_containers(generated(), &[patch]).unwrap();
        let env = merged.containers[0].env.as_ref().unwrap();
        assert_eq!(env.len(), 2);
        assert_eq!(env[0].value.as_deref(), Some("10.0.0.1"));
        assert_eq!(env[1].name, "GOMAXPROCS");
    }

    #[test]
    fn ports_merge_with_default_protocol() {
        let patch = Container {
            name: "prometheus".into(),
            ports: Some(vec![ContainerPort {
                container_port: 9090,
                host_port: Some(19090),
                ..Default::default()
            }]),
            ..Default::default()
        };

        let merged = merge_containers(generated(), &[patch]).unwrap();
        let ports = merged.containers[0].ports.as_ref().unwrap();
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].host_port, Some(19090));
        assert_eq!(ports[0].name.as_deref(), Some("web"));
    }

    #[test]
    fn overlapping_mount_path_with_other_name_is_appended_with_diagnostic() {
        let patch = Container {
            name: "prometheus".into(),
            volume_mounts: Some(vec![VolumeMount {
                name: "my-config".into(),
                mount_path: "/etc/prometheus/config_out".into(),
                ..Default::default()
            }]),
            ..Default::default()
        };

        let merged = merge_containers(generated(), &[patch]).unwrap();
        let mounts = merged.containers[0].volume_mounts.as_ref().unwrap();
        assert_eq!(mounts.len(), 2);
        assert_eq!(merged.diagnostics.len(), 1);
        assert_eq!(
            merged.diagnostics.iter().next().unwrap().reason,
            DiagnosticReason::OverlappingMount("/etc/prometheus/config_out".into())
        );
    }

    #[test]
    fn same_mount_merges_in_place() {
        let patch = Container {
            name: "prometheus".into(),
            volume_mounts: Some(vec![VolumeMount {
                name: "config-out".into(),
                mount_path: "/etc/prometheus/config_out".into(),
                read_only: Some(false),
                ..Default::default()
            }]),
            ..Default::default()
        };

        let merged = merge_containers(generated(), &[patch]).unwrap();
        let mounts = merged.containers[0].volume_mounts.as_ref().unwrap();
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].read_only, Some(false));
    }

    #[test]
    fn new_containers_are_appended() {
        let sidecar = Container {
            name: "oauth-proxy".into(),
            image: Some("oauth2-proxy:v7".into()),
            ..Default::default()
        };
        let merged = merge_containers(generated(), &[sidecar.clone()]).unwrap();
        assert_eq!(merged.containers.len(), 3);
        assert_eq!(merged.containers[2], sidecar);
    }

    #[test]
    fn conflicting_overrides_fail() {
        let unnamed = Container::default();
        assert!(matches!(
            merge_containers(generated(), &[unnamed]),
            Err(Error::MergeConflict { .. })
        ));

        let twice = Container {
            name: "config-reloader".into(),
            ..Default::default()
        };
        assert!(merge_containers(generated(), &[twice.clone(), twice]).is_err());

        let duplicate_env = Container {
            name: "prometheus".into(),
            env: Some(vec![
                EnvVar {
                    name: "A".into(),
                    ..Default::default()
                },
                EnvVar {
                    name: "A".into(),
                    ..Default::default()
                },
            ]),
            ..Default::default()
        };
        let err = merge_containers(generated(), &[duplicate_env]).unwrap_err();
        assert!(err.to_string().contains("env lists A more than once"));
    }
}
