//! Web server configuration file and the credentials it references

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::{ConfigMapVolumeSource, Secret, Volume, VolumeMount};
use kube::api::ObjectMeta;
use serde_json::{Map, Value, json};
use vigil_crd::common::{SecretOrConfigMap, WebConfigFileFields};

use super::volumes::{dns1123_label, mount, secret_volume};
use crate::Result;
use crate::version::Argument;

const WEB_CONFIG_FILE: &str = "web-config.yaml";
const WEB_CONFIG_VOLUME: &str = "web-config";

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Source {
    Secret,
    ConfigMap,
}

impl Source {
    fn as_str(self) -> &'static str {
        match self {
            Source::Secret => "secret",
            Source::ConfigMap => "configmap",
        }
    }
}

/// The rendered web configuration of one target
#[derive(Clone, Debug)]
pub(crate) struct WebConfig<'a> {
    dir: &'static str,
    secret_name: String,
    fields: Option<&'a WebConfigFileFields>,
}

impl<'a> WebConfig<'a> {
    pub fn new(dir: &'static str, secret_name: String, fields: Option<&'a WebConfigFileFields>) -> Self {
        Self {
            dir,
            secret_name,
            fields,
        }
    }

    /// Whether the server terminates TLS
    pub fn tls_enabled(&self) -> bool {
        self.fields.is_some_and(|f| f.tls_config.is_some())
    }

    /// `--web.config.file=<dir>/web-config.yaml`
    pub fn argument(&self) -> Argument {
        Argument::new("web.config.file", format!("{}/{WEB_CONFIG_FILE}", self.dir))
    }

    /// Objects referenced by the TLS settings, each mounted once
    fn credential_sources(&self) -> BTreeSet<(Source, String)> {
        let mut sources = BTreeSet::new();
        let Some(tls) = self.fields.and_then(|f| f.tls_config.as_ref()) else {
            return sources;
        };

        let mut add = |s: &SecretOrConfigMap| {
            if let Some(secret) = &s.secret {
                sources.insert((Source::Secret, secret.name.clone()));
            }
            if let Some(cm) = &s.config_map {
                sources.insert((Source::ConfigMap, cm.name.clone()));
            }
        };
        add(&tls.cert);
        if let Some(ca) = &tls.client_ca {
            add(ca);
        }
        sources.insert((Source::Secret, tls.key_secret.name.clone()));
        sources
    }

    fn credential_path(&self, source: Source, name: &str, key: &str) -> String {
        format!("{}/{}/{name}/{key}", self.dir, source.as_str())
    }

    fn file_of(&self, s: &SecretOrConfigMap) -> Option<String> {
        s.secret
            .as_ref()
            .map(|secret| self.credential_path(Source::Secret, &secret.name, &secret.key))
            .or_else(|| {
                s.config_map
                    .as_ref()
                    .map(|cm| self.credential_path(Source::ConfigMap, &cm.name, &cm.key))
            })
    }

    /// The web config volume plus one volume per referenced credential object
    pub fn volumes(&self) -> Result<(Vec<Volume>, Vec<VolumeMount>)> {
        let mut volumes = vec![secret_volume(WEB_CONFIG_VOLUME, &self.secret_name)];
        let mut mounts = vec![VolumeMount {
            sub_path: Some(WEB_CONFIG_FILE.into()),
            ..mount(
                WEB_CONFIG_VOLUME,
                &format!("{}/{WEB_CONFIG_FILE}", self.dir),
                true,
            )
        }];

        for (source, name) in self.credential_sources() {
            let volume_name = dns1123_label(&format!("web-config-tls-{}", source.as_str()), &name)?;
            volumes.push(match source {
                Source::Secret => secret_volume(&volume_name, &name),
                Source::ConfigMap => Volume {
                    name: volume_name.clone(),
                    config_map: Some(ConfigMapVolumeSource {
                        name: name.clone(),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            });
            mounts.push(mount(
                &volume_name,
                &format!("{}/{}/{name}", self.dir, source.as_str()),
                true,
            ));
        }

        Ok((volumes, mounts))
    }

    /// Renders the configuration file
    pub fn render(&self) -> Value {
        let mut file = Map::new();
        let Some(fields) = self.fields else {
            return Value::Object(file);
        };

        if let Some(tls) = &fields.tls_config {
            let mut server = Map::new();
            if let Some(cert) = self.file_of(&tls.cert) {
                server.insert("cert_file".into(), cert.into());
            }
            server.insert(
                "key_file".into(),
                self.credential_path(Source::Secret, &tls.key_secret.name, &tls.key_secret.key)
                    .into(),
            );
            if let Some(ca) = tls.client_ca.as_ref().and_then(|ca| self.file_of(ca)) {
                server.insert("client_ca_file".into(), ca.into());
            }
            for (key, value) in [
                ("client_auth_type", &tls.client_auth_type),
                ("min_version", &tls.min_version),
                ("max_version", &tls.max_version),
            ] {
                if let Some(value) = value {
                    server.insert(key.into(), value.clone().into());
                }
            }
            file.insert("tls_server_config".into(), Value::Object(server));
        }

        if let Some(http) = &fields.http_config {
            file.insert(
                "http_server_config".into(),
                json!({ "http2": http.http2.unwrap_or(true), "headers": http.headers }),
            );
        }

        Value::Object(file)
    }

    /// The secret holding the rendered file; JSON is valid YAML.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SerializationError`](crate::Error::SerializationError)
    /// when the file cannot be encoded.
    pub fn secret(&self, mut metadata: ObjectMeta) -> Result<Secret> {
        metadata.name = Some(self.secret_name.clone());
        let encoded = serde_json::to_vec(&self.render())?;
        Ok(Secret {
            metadata,
            data: Some(BTreeMap::from([(
                WEB_CONFIG_FILE.to_string(),
                ByteString(encoded),
            )])),
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::SecretKeySelector;
    use vigil_crd::common::{WebHttpConfig, WebTlsConfig};

    use super::*;

    fn tls_fields() -> WebConfigFileFields {
        WebConfigFileFields {
            tls_config: Some(WebTlsConfig {
                cert: SecretOrConfigMap {
                    secret: Some(SecretKeySelector {
                        name: "web-tls".into(),
                        key: "tls.crt".into(),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                key_secret: SecretKeySelector {
                    name: "web-tls".into(),
                    key: "tls.key".into(),
                    ..Default::default()
                },
                min_version: Some("TLS12".into()),
                ..Default::default()
            }),
            http_config: Some(WebHttpConfig {
                http2: Some(false),
                headers: None,
            }),
        }
    }

    #[test]
    fn plain_web_config_mounts_only_the_file() {
        let web = WebConfig::new("/etc/prometheus/web_config", "prometheus-main-web-config".into(), None);
        assert!(!web.tls_enabled());
        assert_eq!(
            web.argument().to_string(),
            "--web.config.file=/etc/prometheus/web_config/web-config.yaml"
        );
        let (volumes, mounts) = web.volumes().unwrap();
        assert_eq!(volumes.len(), 1);
        assert_eq!(mounts[0].sub_path.as_deref(), Some("web-config.yaml"));
        assert_eq!(web.render(), json!({}));
    }

    #[test]
    fn tls_credentials_are_mounted_once_per_object() {
        let fields = tls_fields();
        let web = WebConfig::new("/etc/alertmanager/web_config", "am-web-config".into(), Some(&fields));

        assert!(web.tls_enabled());
        let (volumes, mounts) = web.volumes().unwrap();
        let names: Vec<_> = volumes.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, ["web-config", "web-config-tls-secret-web-tls"]);
        assert_eq!(mounts[1].mount_path, "/etc/alertmanager/web_config/secret/web-tls");

        assert_eq!(
            web.render(),
            json!({
                "tls_server_config": {
                    "cert_file": "/etc/alertmanager/web_config/secret/web-tls/tls.crt",
                    "key_file": "/etc/alertmanager/web_config/secret/web-tls/tls.key",
                    "min_version": "TLS12",
                },
                "http_server_config": { "http2": false, "headers": null },
            })
        );
    }

    #[test]
    fn secret_carries_rendered_file() {
        let fields = tls_fields();
        let web = WebConfig::new("/etc/prometheus/web_config", "prometheus-main-web-config".into(), Some(&fields));
        let secret = web.secret(ObjectMeta::default()).unwrap();

        assert_eq!(secret.metadata.name.as_deref(), Some("prometheus-main-web-config"));
        let ByteString(bytes) = &secret.data.unwrap()["web-config.yaml"];
        let parsed: Value = serde_json::from_slice(bytes).unwrap();
        assert_eq!(parsed, web.render());
    }
}
