//! Selection of the monitor resources that apply to a target.
//!
//! [`ResourceSelector::select`] resolves the namespaces in scope, checks that
//! the operator may list the monitor kind in every namespace other than the
//! target's own, filters the cached candidates by label selector and validates
//! them. Problems scoped to one namespace or object become [`Diagnostic`]s;
//! only a malformed selector aborts the call.
//!
//! [`Diagnostic`]: crate::Diagnostic

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::core::{ApiResource, Selector, SelectorExt};
use kube::{Resource, ResourceExt};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::{DiagnosticReason, Diagnostics, Error, Result};

mod kube_adapters;
mod validate;

pub use kube_adapters::{KubeAuthorizer, StoreCache};
pub use validate::Validate;

/// Stable identity of a selected object
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ResourceKey {
    /// Kind, e.g. `ServiceMonitor`
    pub kind: String,
    /// Namespace of the object
    pub namespace: String,
    /// Name of the object
    pub name: String,
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// Which candidates of one kind are eligible for a target
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SelectorSpec {
    /// Field name of the selector on the target, used in errors
    pub field: String,
    /// Object label selector; `None` matches everything in scope
    pub selector: Option<LabelSelector>,
    /// Namespace label selector; `None` means the target's own namespace
    pub namespace_selector: Option<LabelSelector>,
    /// Explicit namespace allow-list; restricts the scope when set
    pub allow_list: Option<BTreeSet<String>>,
}

/// Accepted objects by key, plus diagnostics for everything rejected
#[derive(Clone, Debug)]
pub struct SelectionResult<K> {
    /// Objects that passed authorization and validation
    pub selected: BTreeMap<ResourceKey, Arc<K>>,
    /// Rejections in the order they were found
    pub diagnostics: Diagnostics,
}

impl<K> Default for SelectionResult<K> {
    fn default() -> Self {
        Self {
            selected: BTreeMap::new(),
            diagnostics: Diagnostics::default(),
        }
    }
}

impl<K> SelectionResult<K> {
    /// Number of accepted objects
    #[must_use]
    pub fn len(&self) -> usize {
        self.selected.len()
    }

    /// True when nothing was accepted
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.selected.is_empty()
    }
}

impl<K: Serialize> SelectionResult<K> {
    /// Key and spec of every accepted object, in key order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SerializationError`] when an object cannot be serialized.
    pub fn fingerprint(&self) -> Result<BTreeMap<String, Value>> {
        self.selected
            .iter()
            .map(|(key, object)| {
                let mut value = serde_json::to_value(object.as_ref())?;
                let spec = value.get_mut("spec").map(Value::take).unwrap_or(Value::Null);
                Ok((key.to_string(), spec))
            })
            .collect()
    }
}

/// Self-subject access check for listing a kind in a namespace
pub trait Authorizer: Send + Sync {
    /// Whether the operator may list `resource` objects in `namespace`
    fn can_list(
        &self,
        resource: &ApiResource,
        namespace: &str,
    ) -> impl Future<Output = Result<bool>> + Send;
}

/// A namespace known to the cache, with its labels
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NamespaceInfo {
    /// Namespace name
    pub name: String,
    /// Namespace labels
    pub labels: BTreeMap<String, String>,
}

/// Read-only, eventually consistent view of candidate objects
pub trait MonitorCache<K> {
    /// All namespaces currently known
    fn namespaces(&self) -> Vec<NamespaceInfo>;
    /// Candidates stored in `namespace`; may contain stale or repeated entries
    fn list(&self, namespace: &str) -> Vec<Arc<K>>;
}

/// Selects monitors of one kind for a target
pub struct ResourceSelector<'a, A> {
    target_namespace: &'a str,
    authorizer: &'a A,
    authz_timeout: Duration,
}

impl<'a, A: Authorizer> ResourceSelector<'a, A> {
    /// Creates a selector for a target living in `target_namespace`
    pub fn new(target_namespace: &'a str, authorizer: &'a A, authz_timeout: Duration) -> Self {
        Self {
            target_namespace,
            authorizer,
            authz_timeout,
        }
    }

    /// Runs selection of `K` objects.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSelector`] when either selector of `spec` is
    /// malformed. Every other failure is recorded as a diagnostic.
    #[instrument(skip(self, spec, cache), fields(
        kind = %K::kind(&()),
        target_namespace = self.target_namespace,
        selector_field = %spec.field,
    ))]
    pub async fn select<K, C>(&self, spec: &SelectorSpec, cache: &C) -> Result<SelectionResult<K>>
    where
        K: Resource<DynamicType = ()> + Validate,
        C: MonitorCache<K>,
    {
        let resource = ApiResource::erase::<K>(&());
        let kind = resource.kind.clone();
        let selector = parse_selector(&spec.field, spec.selector.as_ref())?;
        let namespaces = self.namespaces_in_scope(spec, cache)?;

        let mut result = SelectionResult::default();

        for namespace in namespaces {
            if namespace != self.target_namespace
                && let Err(reason) = self.authorize(&resource, &namespace).await
            {
                warn!(namespace = %namespace, %reason, "skipping namespace");
                result.diagnostics.push(namespace.clone(), reason);
                continue;
            }

            for candidate in cache.list(&namespace) {
                if !selector.as_ref().is_none_or(|s| s.matches(candidate.labels())) {
                    continue;
                }

                let key = ResourceKey {
                    kind: kind.clone(),
                    namespace: namespace.clone(),
                    name: candidate.name_any(),
                };

                if let Err(reason) = candidate.validate() {
                    warn!(key = %key, %reason, "skipping invalid monitor");
                    result
                        .diagnostics
                        .push(key.to_string(), DiagnosticReason::Invalid(reason));
                    continue;
                }

                if result.selected.contains_key(&key) {
                    debug!(key = %key, "duplicate candidate in listing");
                    result
                        .diagnostics
                        .push(key.to_string(), DiagnosticReason::Duplicate);
                    continue;
                }

                result.selected.insert(key, candidate);
            }
        }

        debug!(
            selected = result.selected.len(),
            rejected = result.diagnostics.len(),
            "selection finished"
        );

        Ok(result)
    }

    /// Namespaces to look in, sorted
    fn namespaces_in_scope<K, C: MonitorCache<K>>(
        &self,
        spec: &SelectorSpec,
        cache: &C,
    ) -> Result<BTreeSet<String>> {
        let Some(ns_selector) = spec.namespace_selector.as_ref() else {
            let own = BTreeSet::from([self.target_namespace.to_string()]);
            return Ok(match &spec.allow_list {
                Some(allowed) => own.intersection(allowed).cloned().collect(),
                None => own,
            });
        };

        let field = format!("{}NamespaceSelector", spec.field.trim_end_matches("Selector"));
        let ns_selector = parse_selector(&field, Some(ns_selector))?;

        Ok(cache
            .namespaces()
            .into_iter()
            .filter(|ns| ns_selector.as_ref().is_none_or(|s| s.matches(&ns.labels)))
            .filter(|ns| spec.allow_list.as_ref().is_none_or(|a| a.contains(&ns.name)))
            .map(|ns| ns.name)
            .collect())
    }

    async fn authorize(&self, resource: &ApiResource, namespace: &str) -> Result<(), DiagnosticReason> {
        match tokio::time::timeout(self.authz_timeout, self.authorizer.can_list(resource, namespace))
            .await
        {
            Ok(Ok(true)) => Ok(()),
            Ok(Ok(false)) => Err(DiagnosticReason::Forbidden),
            Ok(Err(e)) => Err(DiagnosticReason::AuthorizationFailed(e.to_string())),
            Err(_) => Err(DiagnosticReason::AuthorizationTimedOut),
        }
    }
}

/// Converts a label selector; `None` and the empty selector both match everything.
fn parse_selector(field: &str, selector: Option<&LabelSelector>) -> Result<Option<Selector>> {
    let Some(selector) = selector else {
        return Ok(None);
    };
    let parsed = Selector::try_from(selector.clone()).map_err(|source| Error::InvalidSelector {
        field: field.to_string(),
        source,
    })?;
    Ok(Some(parsed))
}
