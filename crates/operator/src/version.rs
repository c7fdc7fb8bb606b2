//! Version gating of command-line arguments.
//!
//! The CLI surface of the managed software changes between releases. Arguments
//! are collected as [`VersionedArgument`]s, filtered by [`VersionGate::append`]
//! and then passed through a static table of [`Rewrite`]s that adapts them to
//! the dialect of older releases.

use std::fmt;

use semver::Version;
use tracing::{debug, warn};

use crate::{DiagnosticReason, Diagnostics, Error, Result};

/// Parses a version leniently: a leading `v`, surrounding whitespace, missing
/// minor/patch components and leading zeros are accepted.
///
/// # Errors
///
/// Returns [`Error::InvalidVersion`] when the normalized string is still not a
/// semantic version.
pub fn parse_tolerant(raw: &str) -> Result<Version> {
    let trimmed = raw.trim();
    let trimmed = trimmed
        .strip_prefix('v')
        .or_else(|| trimmed.strip_prefix('V'))
        .unwrap_or(trimmed);

    let split = trimmed.find(['-', '+']).unwrap_or(trimmed.len());
    let (core, suffix) = trimmed.split_at(split);

    let mut parts: Vec<String> = core
        .split('.')
        .map(|p| {
            let stripped = p.trim_start_matches('0');
            if stripped.is_empty() && !p.is_empty() {
                "0".to_string()
            } else {
                stripped.to_string()
            }
        })
        .collect();
    while parts.len() < 3 {
        parts.push("0".to_string());
    }

    let normalized = format!("{}{suffix}", parts.join("."));
    Version::parse(&normalized).map_err(|source| Error::InvalidVersion {
        version: raw.to_string(),
        source,
    })
}

/// A command-line flag, rendered as `--name=value` or `--name`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Argument {
    /// Flag name without dashes
    pub name: String,
    /// Flag value; `None` renders a boolean flag
    pub value: Option<String>,
    single_dash: bool,
}

impl Argument {
    /// A flag with a value
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Some(value.into()),
            single_dash: false,
        }
    }

    /// A flag without a value
    pub fn flag(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: None,
            single_dash: false,
        }
    }

    /// Requires at least `version` to be emitted
    #[must_use]
    pub fn since(self, version: Version) -> VersionedArgument {
        VersionedArgument {
            argument: self,
            min_version: Some(version),
            implied: false,
        }
    }

    /// Like [`Self::since`] for a flag the operator adds on its own; older
    /// releases drop it without a diagnostic
    #[must_use]
    pub fn implied_since(self, version: Version) -> VersionedArgument {
        VersionedArgument {
            implied: true,
            ..self.since(version)
        }
    }
}

impl fmt::Display for Argument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dashes = if self.single_dash { "-" } else { "--" };
        match &self.value {
            Some(value) => write!(f, "{dashes}{}={value}", self.name),
            None => write!(f, "{dashes}{}", self.name),
        }
    }
}

/// An argument tagged with the first release that understands it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionedArgument {
    /// The argument
    pub argument: Argument,
    /// Minimum version; `None` means every release
    pub min_version: Option<Version>,
    /// Not requested by the user
    pub implied: bool,
}

impl From<Argument> for VersionedArgument {
    fn from(argument: Argument) -> Self {
        Self {
            argument,
            min_version: None,
            implied: false,
        }
    }
}

/// A legacy-dialect transformation applied when `applies` holds for the version
pub struct Rewrite {
    /// Human readable summary
    pub description: &'static str,
    /// Version predicate
    pub applies: fn(&Version) -> bool,
    /// Transformation of the whole argument list
    pub transform: fn(Vec<Argument>) -> Vec<Argument>,
}

/// Rewrites for Alertmanager releases before 0.15.0, in application order
pub static ALERTMANAGER_LEGACY_REWRITES: &[Rewrite] = &[
    Rewrite {
        description: "below 0.15.0 peers carry no port and HA flags use the mesh prefix",
        applies: |v| v.major == 0 && v.minor < 15,
        transform: |args| {
            args.into_iter()
                .map(|mut arg| {
                    if arg.name == "cluster.peer" {
                        arg.value = arg
                            .value
                            .map(|v| v.strip_suffix(":9094").map_or(v.clone(), String::from));
                    }
                    if let Some(rest) = arg.name.strip_prefix("cluster.") {
                        arg.name = format!("mesh.{rest}");
                    }
                    arg
                })
                .collect()
        },
    },
    Rewrite {
        description: "below 0.13.0 every flag uses a single dash",
        applies: |v| v.major == 0 && v.minor < 13,
        transform: |args| {
            args.into_iter()
                .map(|mut arg| {
                    arg.single_dash = true;
                    arg
                })
                .collect()
        },
    },
    Rewrite {
        description: "below 0.7.0 there is no route prefix flag",
        applies: |v| v.major == 0 && v.minor < 7,
        transform: |args| {
            args.into_iter()
                .filter(|arg| arg.name != "web.route-prefix")
                .collect()
        },
    },
];

/// Evaluates argument availability against the managed software's version
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionGate {
    component: &'static str,
    version: Version,
}

impl VersionGate {
    /// Parses `raw` for `component` (used in error messages and logs).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidVersion`] when `raw` cannot be parsed.
    pub fn new(component: &'static str, raw: &str) -> Result<Self> {
        Ok(Self {
            component,
            version: parse_tolerant(raw)?,
        })
    }

    /// The parsed version
    #[must_use]
    pub fn version(&self) -> &Version {
        &self.version
    }

    /// True when the version is at least `major.minor.patch`
    #[must_use]
    pub fn at_least(&self, major: u64, minor: u64, patch: u64) -> bool {
        self.version >= Version::new(major, minor, patch)
    }

    /// Fails unless the major version is one of `supported`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedVersion`] for any other major version.
    pub fn require_major(&self, supported: &[u64]) -> Result<()> {
        if supported.contains(&self.version.major) {
            Ok(())
        } else {
            Err(Error::UnsupportedVersion {
                component: self.component,
                version: self.version.clone(),
            })
        }
    }

    /// Appends the candidates whose minimum version is satisfied, in input
    /// order. Dropped candidates are recorded in `diagnostics` unless they
    /// are implied.
    pub fn append<I>(&self, args: &mut Vec<Argument>, candidates: I, diagnostics: &mut Diagnostics)
    where
        I: IntoIterator,
        I::Item: Into<VersionedArgument>,
    {
        for candidate in candidates {
            let VersionedArgument {
                argument,
                min_version,
                implied,
            } = candidate.into();
            match min_version {
                Some(min) if self.version < min && implied => {
                    debug!(
                        component = self.component,
                        flag = %argument.name,
                        version = %self.version,
                        "omitting flag not supported by this version"
                    );
                }
                Some(min) if self.version < min => {
                    warn!(
                        component = self.component,
                        flag = %argument.name,
                        version = %self.version,
                        minimum_version = %min,
                        "ignoring flag not supported by this version"
                    );
                    diagnostics.push(
                        self.component,
                        DiagnosticReason::UnsupportedFlag(argument.name),
                    );
                }
                _ => args.push(argument),
            }
        }
    }

    /// Applies every rewrite whose predicate holds, in table order, and renders
    /// the arguments.
    #[must_use]
    pub fn render(&self, args: Vec<Argument>, rewrites: &[Rewrite]) -> Vec<String> {
        rewrites
            .iter()
            .filter(|r| (r.applies)(&self.version))
            .fold(args, |args, r| (r.transform)(args))
            .iter()
            .map(ToString::to_string)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate(v: &str) -> VersionGate {
        VersionGate::new("alertmanager", v).unwrap()
    }

    #[test]
    fn parses_tolerant_versions() {
        assert_eq!(parse_tolerant("v0.27.0").unwrap(), Version::new(0, 27, 0));
        assert_eq!(parse_tolerant(" 2.45 ").unwrap(), Version::new(2, 45, 0));
        assert_eq!(parse_tolerant("v3").unwrap(), Version::new(3, 0, 0));
        assert_eq!(parse_tolerant("2.07.01").unwrap(), Version::new(2, 7, 1));
        assert_eq!(
            parse_tolerant("v2.45.0-rc.1").unwrap().pre.as_str(),
            "rc.1"
        );
    }

    #[test]
    fn rejects_garbage_versions() {
        assert!(matches!(
            parse_tolerant("latest"),
            Err(Error::InvalidVersion { .. })
        ));
        assert!(parse_tolerant("").is_err());
    }

    #[test]
    fn release_candidates_sort_before_release() {
        let rc = VersionGate::new("prometheus", "v2.33.0-rc.0").unwrap();
        assert!(!rc.at_least(2, 33, 0));
        assert!(rc.at_least(2, 32, 99));
    }

    #[test]
    fn unsupported_major_is_fatal() {
        assert!(gate("0.27.0").require_major(&[0]).is_ok());
        assert!(matches!(
            gate("1.0.0").require_major(&[0]),
            Err(Error::UnsupportedVersion { .. })
        ));
    }

    #[test]
    fn append_keeps_order_and_drops_newer_flags() {
        let g = gate("0.16.0");
        let mut args = vec![Argument::new("config.file", "/etc/am.yaml")];
        let mut diagnostics = Diagnostics::default();

        g.append(
            &mut args,
            [
                Argument::new("log.format", "json").since(Version::new(0, 16, 0)),
                Argument::new("web.timeout", "5").since(Version::new(0, 17, 0)),
                Argument::new("log.level", "debug").into(),
            ],
            &mut diagnostics,
        );

        let names: Vec<_> = args.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, ["config.file", "log.format", "log.level"]);
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(
            diagnostics.iter().next().unwrap().reason,
            DiagnosticReason::UnsupportedFlag("web.timeout".into())
        );
    }

    #[test]
    fn implied_flags_are_dropped_silently() {
        let g = gate("0.14.0");
        let mut args = Vec::new();
        let mut diagnostics = Diagnostics::default();

        g.append(
            &mut args,
            [
                Argument::new("cluster.reconnect-timeout", "5m").implied_since(Version::new(0, 15, 0)),
                Argument::new("log.format", "json").since(Version::new(0, 16, 0)),
            ],
            &mut diagnostics,
        );

        assert!(args.is_empty());
        let reasons: Vec<_> = diagnostics.iter().map(|d| d.reason.clone()).collect();
        assert_eq!(reasons, [DiagnosticReason::UnsupportedFlag("log.format".into())]);
    }

    #[test]
    fn renders_boolean_and_valued_flags() {
        assert_eq!(Argument::flag("web.enable-lifecycle").to_string(), "--web.enable-lifecycle");
        assert_eq!(
            Argument::new("cluster.listen-address", "").to_string(),
            "--cluster.listen-address="
        );
    }

    fn legacy_args() -> Vec<Argument> {
        vec![
            Argument::new("cluster.listen-address", "[$(POD_IP)]:9094"),
            Argument::new("web.route-prefix", "/"),
            Argument::new("cluster.peer", "alertmanager-main-0.alertmanager-operated:9094"),
        ]
    }

    #[test]
    fn below_0_15_uses_mesh_prefix_without_peer_port() {
        let rendered = gate("0.14.0").render(legacy_args(), ALERTMANAGER_LEGACY_REWRITES);
        assert_eq!(
            rendered,
            [
                "--mesh.listen-address=[$(POD_IP)]:9094",
                "--web.route-prefix=/",
                "--mesh.peer=alertmanager-main-0.alertmanager-operated",
            ]
        );
    }

    #[test]
    fn below_0_13_uses_single_dash() {
        let rendered = gate("0.12.0").render(legacy_args(), ALERTMANAGER_LEGACY_REWRITES);
        assert_eq!(rendered[2], "-mesh.peer=alertmanager-main-0.alertmanager-operated");
        assert!(rendered.iter().all(|a| a.starts_with('-') && !a.starts_with("--")));
    }

    #[test]
    fn below_0_7_drops_route_prefix() {
        let rendered = gate("0.6.2").render(legacy_args(), ALERTMANAGER_LEGACY_REWRITES);
        assert!(rendered.iter().all(|a| !a.contains("route-prefix")));
        assert_eq!(rendered.len(), 2);
    }

    #[test]
    fn current_versions_render_unchanged() {
        let rendered = gate("0.27.0").render(legacy_args(), ALERTMANAGER_LEGACY_REWRITES);
        assert_eq!(
            rendered[2],
            "--cluster.peer=alertmanager-main-0.alertmanager-operated:9094"
        );
    }
}
