use std::fmt;

use serde::Serialize;

/// Why an object or namespace was left out of a synthesis result
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "camelCase")]
pub enum DiagnosticReason {
    /// The operator may not list the kind in the namespace
    Forbidden,
    /// The authorization query failed
    AuthorizationFailed(String),
    /// The authorization query did not answer in time
    AuthorizationTimedOut,
    /// The object failed validation
    Invalid(String),
    /// A listing returned the same object more than once
    Duplicate,
    /// A template key was already projected by an earlier source
    DuplicateTemplateKey(String),
    /// An override mount shares a path with a generated mount of another name
    OverlappingMount(String),
    /// A flag was dropped because the software version is too old
    UnsupportedFlag(String),
}

impl fmt::Display for DiagnosticReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Forbidden => write!(f, "forbidden"),
            Self::AuthorizationFailed(e) => write!(f, "authorization check failed: {e}"),
            Self::AuthorizationTimedOut => write!(f, "authorization check timed out"),
            Self::Invalid(e) => write!(f, "invalid: {e}"),
            Self::Duplicate => write!(f, "duplicate object"),
            Self::DuplicateTemplateKey(k) => write!(f, "duplicate template key {k:?}"),
            Self::OverlappingMount(p) => write!(f, "mount path {p:?} already in use"),
            Self::UnsupportedFlag(flag) => write!(f, "flag {flag:?} not supported"),
        }
    }
}

/// A soft failure scoped to one object, namespace or field
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    /// What the diagnostic is about (selection key, namespace, container, ...)
    pub key: String,
    /// What went wrong
    pub reason: DiagnosticReason,
}

/// Diagnostics in the order they were recorded
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Diagnostics(Vec<Diagnostic>);

impl Diagnostics {
    /// Records a diagnostic
    pub fn push(&mut self, key: impl Into<String>, reason: DiagnosticReason) {
        self.0.push(Diagnostic {
            key: key.into(),
            reason,
        });
    }

    /// Appends every diagnostic of `other`
    pub fn extend(&mut self, other: Diagnostics) {
        self.0.extend(other.0);
    }

    /// Iterates in recording order
    pub fn iter(&self) -> std::slice::Iter<'_, Diagnostic> {
        self.0.iter()
    }

    /// Number of recorded diagnostics
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when nothing was recorded
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Diagnostics recorded for `key`
    pub fn for_key<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a Diagnostic> + 'a {
        self.0.iter().filter(move |d| d.key == key)
    }
}

impl<'a> IntoIterator for &'a Diagnostics {
    type Item = &'a Diagnostic;
    type IntoIter = std::slice::Iter<'a, Diagnostic>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
