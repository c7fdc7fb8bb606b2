//! Config reloader sidecar

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, EnvVarSource, ObjectFieldSelector, ResourceRequirements,
    VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use super::{non_default, restricted_security_context, some_if_any};
use crate::config::ReloaderConfig;
use crate::version::Argument;

const RELOADER_PORT: i32 = 8080;
const RELOADER_PORT_NAME: &str = "reloader-web";
const RELOADER_BINARY: &str = "/bin/prometheus-config-reloader";

/// How the sidecar tells the main process to reload
#[derive(Clone, Debug, PartialEq, Eq)]
enum ReloadMethod {
    Http { url: String },
    Signal { runtime_info_url: Option<String> },
}

/// Builds the `config-reloader` sidecar and its run-once init variant
#[derive(Clone, Debug)]
pub struct ReloaderBuilder<'a> {
    config: &'a ReloaderConfig,
    local_host: String,
    run_once: bool,
    listen_local: bool,
    method: Option<ReloadMethod>,
    config_file: Option<String>,
    config_envsubst_file: Option<String>,
    watched_dirs: Vec<String>,
    log_level: Option<String>,
    log_format: Option<String>,
    shard: Option<i32>,
    image_pull_policy: Option<String>,
    mounts: Vec<VolumeMount>,
}

impl<'a> ReloaderBuilder<'a> {
    /// A long-running sidecar with image and resources from `config`
    #[must_use]
    pub fn new(config: &'a ReloaderConfig, local_host: &str) -> Self {
        Self {
            config,
            local_host: local_host.to_string(),
            run_once: false,
            listen_local: false,
            method: None,
            config_file: None,
            config_envsubst_file: None,
            watched_dirs: Vec::new(),
            log_level: None,
            log_format: None,
            shard: None,
            image_pull_policy: None,
            mounts: Vec::new(),
        }
    }

    /// Init container that renders the configuration once and exits
    #[must_use]
    pub fn run_once(mut self) -> Self {
        self.run_once = true;
        self
    }

    /// Bind the sidecar's own listener to the loopback only
    #[must_use]
    pub fn listen_local(mut self, listen_local: bool) -> Self {
        self.listen_local = listen_local;
        self
    }

    /// Trigger reloads with a POST to `url`
    #[must_use]
    pub fn reload_url(mut self, url: impl Into<String>) -> Self {
        self.method = Some(ReloadMethod::Http { url: url.into() });
        self
    }

    /// Trigger reloads with `SIGHUP`; when given, readiness after a reload is
    /// read from `runtime_info_url`
    #[must_use]
    pub fn reload_signal(mut self, runtime_info_url: Option<String>) -> Self {
        self.method = Some(ReloadMethod::Signal { runtime_info_url });
        self
    }

    /// Compressed or plain configuration to watch
    #[must_use]
    pub fn config_file(mut self, path: impl Into<String>) -> Self {
        self.config_file = Some(path.into());
        self
    }

    /// Where the expanded configuration is written
    #[must_use]
    pub fn config_envsubst_file(mut self, path: impl Into<String>) -> Self {
        self.config_envsubst_file = Some(path.into());
        self
    }

    /// Extra directories whose changes trigger a reload
    #[must_use]
    pub fn watched_dirs(mut self, dirs: impl IntoIterator<Item = String>) -> Self {
        self.watched_dirs.extend(dirs);
        self
    }

    /// Log level; `info` emits no flag
    #[must_use]
    pub fn log_level(mut self, level: Option<&str>) -> Self {
        self.log_level = non_default(level, "info").map(String::from);
        self
    }

    /// Log format; `logfmt` emits no flag
    #[must_use]
    pub fn log_format(mut self, format: Option<&str>) -> Self {
        self.log_format = non_default(format, "logfmt").map(String::from);
        self
    }

    /// Shard index exposed as `SHARD` for configuration expansion
    #[must_use]
    pub fn shard(mut self, shard: i32) -> Self {
        self.shard = Some(shard);
        self
    }

    /// Pull policy of the target's containers
    #[must_use]
    pub fn image_pull_policy(mut self, policy: Option<&str>) -> Self {
        self.image_pull_policy = policy.map(String::from);
        self
    }

    /// Volume mounts of the sidecar
    #[must_use]
    pub fn mounts(mut self, mounts: Vec<VolumeMount>) -> Self {
        self.mounts = mounts;
        self
    }

    /// Listen-local only applies to HTTP reloads
    fn listens_locally(&self) -> bool {
        self.listen_local && !matches!(self.method, Some(ReloadMethod::Signal { .. }))
    }

    fn arguments(&self) -> Vec<Argument> {
        let mut args = Vec::new();

        if self.run_once {
            args.push(Argument::new("watch-interval", "0"));
        } else {
            let host = if self.listens_locally() {
                self.local_host.as_str()
            } else {
                ""
            };
            args.push(Argument::new("listen-address", format!("{host}:{RELOADER_PORT}")));
        }

        match &self.method {
            Some(ReloadMethod::Http { url }) => args.push(Argument::new("reload-url", url)),
            Some(ReloadMethod::Signal { runtime_info_url }) => {
                args.push(Argument::new("reload-method", "signal"));
                if let Some(url) = runtime_info_url {
                    args.push(Argument::new("runtimeinfo-url", url));
                }
            }
            None => {}
        }

        if let Some(file) = &self.config_file {
            args.push(Argument::new("config-file", file));
        }
        if let Some(file) = &self.config_envsubst_file {
            args.push(Argument::new("config-envsubst-file", file));
        }
        for dir in &self.watched_dirs {
            args.push(Argument::new("watched-dir", dir));
        }
        if let Some(level) = &self.log_level {
            args.push(Argument::new("log-level", level));
        }
        if let Some(format) = &self.log_format {
            args.push(Argument::new("log-format", format));
        }
        args
    }

    fn env(&self) -> Vec<EnvVar> {
        let mut env = vec![EnvVar {
            name: "POD_NAME".into(),
            value_from: Some(EnvVarSource {
                field_ref: Some(ObjectFieldSelector {
                    field_path: "metadata.name".into(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }];
        if let Some(shard) = self.shard {
            env.push(EnvVar {
                name: "SHARD".into(),
                value: Some(shard.to_string()),
                ..Default::default()
            });
        }
        env
    }

    fn resources(&self) -> ResourceRequirements {
        let quantities = |pairs: [(&str, &str); 2]| {
            let map: BTreeMap<String, Quantity> = pairs
                .into_iter()
                .filter(|(_, v)| !v.is_empty())
                .map(|(k, v)| (k.to_string(), Quantity(v.to_string())))
                .collect();
            (!map.is_empty()).then_some(map)
        };
        ResourceRequirements {
            requests: quantities([
                ("cpu", self.config.cpu_request.as_str()),
                ("memory", self.config.memory_request.as_str()),
            ]),
            limits: quantities([
                ("cpu", self.config.cpu_limit.as_str()),
                ("memory", self.config.memory_limit.as_str()),
            ]),
            ..Default::default()
        }
    }

    /// Renders the container
    #[must_use]
    pub fn build(self) -> Container {
        let name = if self.run_once {
            "init-config-reloader"
        } else {
            "config-reloader"
        };
        let ports = (!self.run_once && !self.listens_locally()).then(|| {
            vec![ContainerPort {
                name: Some(RELOADER_PORT_NAME.into()),
                container_port: RELOADER_PORT,
                protocol: Some("TCP".into()),
                ..Default::default()
            }]
        });

        Container {
            name: name.into(),
            image: Some(self.config.image.clone()),
            image_pull_policy: self.image_pull_policy.clone(),
            command: Some(vec![RELOADER_BINARY.into()]),
            args: Some(self.arguments().iter().map(ToString::to_string).collect()),
            env: Some(self.env()),
            ports,
            resources: Some(self.resources()),
            security_context: Some(restricted_security_context()),
            termination_message_policy: Some("FallbackToLogsOnError".into()),
            volume_mounts: some_if_any(self.mounts),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sidecar(config: &ReloaderConfig) -> ReloaderBuilder<'_> {
        ReloaderBuilder::new(config, "localhost")
            .reload_url("http://localhost:9090/-/reload")
            .config_file("/etc/prometheus/config/prometheus.yaml.gz")
            .config_envsubst_file("/etc/prometheus/config_out/prometheus.env.yaml")
    }

    #[test]
    fn sidecar_arguments_in_order() {
        let config = ReloaderConfig::default();
        let container = sidecar(&config)
            .watched_dirs(["/etc/prometheus/rules".to_string()])
            .log_level(Some("info"))
            .log_format(Some("json"))
            .shard(2)
            .build();

        assert_eq!(container.name, "config-reloader");
        assert_eq!(
            container.args.unwrap(),
            [
                "--listen-address=:8080",
                "--reload-url=http://localhost:9090/-/reload",
                "--config-file=/etc/prometheus/config/prometheus.yaml.gz",
                "--config-envsubst-file=/etc/prometheus/config_out/prometheus.env.yaml",
                "--watched-dir=/etc/prometheus/rules",
                "--log-format=json",
            ]
        );
        let env = container.env.unwrap();
        assert_eq!(env[0].name, "POD_NAME");
        assert_eq!(env[1].value.as_deref(), Some("2"));
        assert_eq!(container.ports.unwrap()[0].container_port, 8080);
    }

    #[test]
    fn run_once_variant_has_no_listener() {
        let config = ReloaderConfig::default();
        let container = sidecar(&config).run_once().build();

        assert_eq!(container.name, "init-config-reloader");
        let args = container.args.unwrap();
        assert_eq!(args[0], "--watch-interval=0");
        assert!(args.iter().all(|a| !a.starts_with("--listen-address")));
        assert!(container.ports.is_none());
    }

    #[test]
    fn listen_local_binds_loopback_for_http_reload() {
        let config = ReloaderConfig::default();
        let container = ReloaderBuilder::new(&config, "127.0.0.1")
            .listen_local(true)
            .reload_url("http://127.0.0.1:9090/-/reload")
            .build();

        let args = container.args.unwrap();
        assert_eq!(args[0], "--listen-address=127.0.0.1:8080");
        assert_eq!(args[1], "--reload-url=http://127.0.0.1:9090/-/reload");
        assert!(container.ports.is_none());
    }

    #[test]
    fn signal_reload_ignores_listen_local() {
        let config = ReloaderConfig::default();
        let container = ReloaderBuilder::new(&config, "127.0.0.1")
            .listen_local(true)
            .reload_signal(Some("http://127.0.0.1:9090/api/v1/status/runtimeinfo".into()))
            .build();

        assert_eq!(
            container.args.unwrap(),
            [
                "--listen-address=:8080",
                "--reload-method=signal",
                "--runtimeinfo-url=http://127.0.0.1:9090/api/v1/status/runtimeinfo",
            ]
        );
        assert_eq!(container.ports.unwrap()[0].container_port, 8080);
    }

    #[test]
    fn empty_resources_are_left_out() {
        let config = ReloaderConfig {
            cpu_limit: String::new(),
            memory_limit: String::new(),
            ..ReloaderConfig::default()
        };
        let container = sidecar(&config).build();
        let resources = container.resources.unwrap();

        assert!(resources.limits.is_none());
        let requests = resources.requests.unwrap();
        assert_eq!(requests["cpu"], Quantity("10m".into()));
        assert_eq!(requests["memory"], Quantity("50Mi".into()));

        let security = container.security_context.unwrap();
        assert_eq!(security.read_only_root_filesystem, Some(true));
        assert_eq!(security.allow_privilege_escalation, Some(false));
    }
}
