//! Volumes and mounts shared by the Prometheus and Alertmanager workloads

use std::collections::BTreeSet;

use k8s_openapi::api::core::v1::{
    ConfigMapProjection, ConfigMapVolumeSource, EmptyDirVolumeSource, KeyToPath,
    PersistentVolumeClaim, PersistentVolumeClaimSpec, ProjectedVolumeSource, SecretProjection,
    SecretVolumeSource, Volume, VolumeMount, VolumeProjection,
};
use kube::api::ObjectMeta;
use tracing::debug;
use vigil_crd::common::{SecretOrConfigMap, StorageSpec};

use crate::hash::short_hash;
use crate::{DiagnosticReason, Diagnostics, Error, Result};

const DNS1123_LABEL_MAX: usize = 63;

/// `<prefix>-<name>` as a DNS-1123 label.
///
/// Characters outside `[a-z0-9-]` become `-`; labels over 63 characters are
/// cut and suffixed with a hash of the full label so they stay unique.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] for an empty name.
pub fn dns1123_label(prefix: &str, name: &str) -> Result<String> {
    if name.trim().is_empty() {
        return Err(Error::InvalidInput(format!(
            "empty name for a {prefix} volume"
        )));
    }

    let sanitized: String = format!("{prefix}-{name}")
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let label = sanitized.trim_matches('-');

    if label.len() <= DNS1123_LABEL_MAX {
        return Ok(label.to_string());
    }

    let hash = short_hash(label);
    let keep = DNS1123_LABEL_MAX - hash.len() - 1;
    Ok(format!("{}-{hash}", label[..keep].trim_end_matches('-')))
}

pub(crate) fn secret_volume(name: &str, secret_name: &str) -> Volume {
    Volume {
        name: name.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret_name.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn config_map_volume(name: &str, config_map: &str) -> Volume {
    Volume {
        name: name.to_string(),
        config_map: Some(ConfigMapVolumeSource {
            name: config_map.to_string(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub(crate) fn mount(name: &str, path: &str, read_only: bool) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        read_only: read_only.then_some(true),
        ..Default::default()
    }
}

/// Memory-backed scratch volume for the post-processed configuration
pub(crate) fn config_out_volume(name: &str) -> Volume {
    Volume {
        name: name.to_string(),
        empty_dir: Some(EmptyDirVolumeSource {
            medium: Some("Memory".into()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// One projected source per TLS asset secret, in order
pub(crate) fn tls_assets_volume(name: &str, secrets: &[String]) -> Volume {
    Volume {
        name: name.to_string(),
        projected: Some(ProjectedVolumeSource {
            sources: Some(
                secrets
                    .iter()
                    .map(|secret| VolumeProjection {
                        secret: Some(SecretProjection {
                            name: secret.clone(),
                            ..Default::default()
                        }),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// The data volume, as exactly one of a pod volume or a claim template
#[derive(Debug)]
pub(crate) struct DataStorage {
    pub volume: Option<Volume>,
    pub claim: Option<PersistentVolumeClaim>,
    pub mount: VolumeMount,
}

/// Resolves the storage spec.
///
/// No spec, or a spec naming no source, yields an `emptyDir`. Otherwise the
/// first of `emptyDir`, `ephemeral` and `volumeClaimTemplate` that is set wins.
pub(crate) fn data_storage(
    storage: Option<&StorageSpec>,
    default_name: &str,
    mount_path: &str,
    sub_path: &str,
) -> DataStorage {
    let template = storage.and_then(|s| s.volume_claim_template.as_ref());
    let name = template
        .and_then(|t| t.metadata.name.clone())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| default_name.to_string());

    let mount = VolumeMount {
        name: name.clone(),
        mount_path: mount_path.to_string(),
        sub_path: storage
            .filter(|s| !s.disable_mount_sub_path)
            .map(|_| sub_path.to_string()),
        ..Default::default()
    };

    let pod_volume = |volume: Volume| DataStorage {
        volume: Some(volume),
        claim: None,
        mount: mount.clone(),
    };

    match storage {
        Some(StorageSpec {
            empty_dir: Some(empty_dir),
            ..
        }) => pod_volume(Volume {
            name,
            empty_dir: Some(empty_dir.clone()),
            ..Default::default()
        }),
        Some(StorageSpec {
            ephemeral: Some(ephemeral),
            ..
        }) => pod_volume(Volume {
            name,
            ephemeral: Some(ephemeral.clone()),
            ..Default::default()
        }),
        Some(StorageSpec {
            volume_claim_template: Some(template),
            ..
        }) => {
            let mut spec: PersistentVolumeClaimSpec = template.spec.clone();
            if spec.access_modes.as_ref().is_none_or(Vec::is_empty) {
                spec.access_modes = Some(vec!["ReadWriteOnce".into()]);
            }
            DataStorage {
                volume: None,
                claim: Some(PersistentVolumeClaim {
                    metadata: ObjectMeta {
                        name: Some(name),
                        labels: template.metadata.labels.clone(),
                        annotations: template.metadata.annotations.clone(),
                        ..Default::default()
                    },
                    spec: Some(spec),
                    ..Default::default()
                }),
                mount: mount.clone(),
            }
        }
        _ => pod_volume(Volume {
            name,
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        }),
    }
}

/// Volumes, mounts and mount directories of user-referenced secrets and
/// config maps
#[derive(Debug, Default)]
pub(crate) struct UserMounts {
    pub volumes: Vec<Volume>,
    pub mounts: Vec<VolumeMount>,
    pub directories: Vec<String>,
}

pub(crate) fn user_mounts(
    secrets: &[String],
    config_maps: &[String],
    secrets_dir: &str,
    config_maps_dir: &str,
) -> Result<UserMounts> {
    let mut out = UserMounts::default();

    for secret in secrets {
        let name = dns1123_label("secret", secret)?;
        let path = format!("{secrets_dir}/{secret}");
        out.volumes.push(secret_volume(&name, secret));
        out.mounts.push(mount(&name, &path, true));
        out.directories.push(path);
    }

    for config_map in config_maps {
        let name = dns1123_label("configmap", config_map)?;
        let path = format!("{config_maps_dir}/{config_map}");
        out.volumes.push(config_map_volume(&name, config_map));
        out.mounts.push(mount(&name, &path, true));
        out.directories.push(path);
    }

    Ok(out)
}

/// Projects template keys from several objects into one volume.
///
/// Keys share one directory, so the first source of a key wins and later ones
/// are skipped with a diagnostic.
pub(crate) fn templates_volume(
    name: &str,
    templates: &[SecretOrConfigMap],
    diagnostics: &mut Diagnostics,
) -> Option<Volume> {
    if templates.is_empty() {
        return None;
    }

    let mut keys = BTreeSet::new();
    let mut sources = Vec::new();
    let skip = |key: &str, object: &str, diagnostics: &mut Diagnostics| {
        debug!(key, object, "skipping duplicate template key");
        diagnostics.push(object, DiagnosticReason::DuplicateTemplateKey(key.to_string()));
    };

    for template in templates {
        if let Some(cm) = &template.config_map {
            if keys.insert(cm.key.clone()) {
                sources.push(VolumeProjection {
                    config_map: Some(ConfigMapProjection {
                        name: cm.name.clone(),
                        items: Some(vec![key_to_path(&cm.key)]),
                        ..Default::default()
                    }),
                    ..Default::default()
                });
            } else {
                skip(&cm.key, &format!("configmap/{}", cm.name), diagnostics);
            }
        }
        if let Some(secret) = &template.secret {
            if keys.insert(secret.key.clone()) {
                sources.push(VolumeProjection {
                    secret: Some(SecretProjection {
                        name: secret.name.clone(),
                        items: Some(vec![key_to_path(&secret.key)]),
                        ..Default::default()
                    }),
                    ..Default::default()
                });
            } else {
                skip(&secret.key, &format!("secret/{}", secret.name), diagnostics);
            }
        }
    }

    Some(Volume {
        name: name.to_string(),
        projected: Some(ProjectedVolumeSource {
            sources: Some(sources),
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn key_to_path(key: &str) -> KeyToPath {
    KeyToPath {
        key: key.to_string(),
        path: key.to_string(),
        ..Default::default()
    }
}
