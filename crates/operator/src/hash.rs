//! Change-detection hash over every input that reaches a rendered workload.
//!
//! Inputs are fed as named, length-prefixed canonical JSON segments into a
//! SHA-256 digest. Maps serialize in key order, so equal inputs always produce
//! equal hashes.

use std::collections::BTreeMap;

use kube::{Resource, ResourceExt};
use serde::Serialize;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

use crate::Result;

/// Annotation carrying the hash on the workload and its pod template
pub const INPUT_HASH_ANNOTATION: &str = "prometheus-operator-input-hash";

/// Annotation prefix reserved for client tooling; never hashed or propagated
pub const KUBECTL_ANNOTATION_PREFIX: &str = "kubectl.kubernetes.io/";

/// Incremental SHA-256 over named input segments
#[derive(Clone, Debug, Default)]
pub struct InputHasher {
    digest: Sha256,
}

impl InputHasher {
    /// Starts an empty hash
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `value` as canonical JSON under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SerializationError`](crate::Error::SerializationError)
    /// when `value` cannot be serialized.
    pub fn json<T: Serialize + ?Sized>(self, name: &str, value: &T) -> Result<Self> {
        let encoded = serde_json::to_vec(value)?;
        Ok(self.bytes(name, &encoded))
    }

    /// Adds raw bytes under `name`
    #[must_use]
    pub fn bytes(mut self, name: &str, value: &[u8]) -> Self {
        for part in [name.as_bytes(), value] {
            self.digest.update((part.len() as u64).to_be_bytes());
            self.digest.update(part);
        }
        self
    }

    /// Adds the hash-relevant identity and spec of a custom resource.
    ///
    /// Generation, resource version, uid, managed fields and status are left
    /// out; so are client annotations and a previously written hash.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SerializationError`](crate::Error::SerializationError)
    /// when the object cannot be serialized.
    pub fn object<K>(self, name: &str, object: &K) -> Result<Self>
    where
        K: Resource<DynamicType = ()> + Serialize,
    {
        let mut serialized = serde_json::to_value(object)?;
        let spec = serialized
            .get_mut("spec")
            .map(Value::take)
            .unwrap_or(Value::Null);

        self.json(
            name,
            &json!({
                "kind": K::kind(&()),
                "namespace": object.namespace(),
                "name": object.name_any(),
                "labels": object.labels(),
                "annotations": propagated_annotations(object.annotations()),
                "spec": spec,
            }),
        )
    }

    /// Hex encoded digest
    #[must_use]
    pub fn finish(self) -> String {
        hex::encode(self.digest.finalize())
    }
}

/// Annotations that may be copied from a target onto generated objects
#[must_use]
pub fn propagated_annotations(annotations: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    annotations
        .iter()
        .filter(|(k, _)| !k.starts_with(KUBECTL_ANNOTATION_PREFIX) && *k != INPUT_HASH_ANNOTATION)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// First 8 bytes of the SHA-256 of `input`, hex encoded.
/// Used to keep truncated names unique.
#[must_use]
pub fn short_hash(input: &str) -> String {
    hex::encode(&Sha256::digest(input.as_bytes())[..8])
}

#[cfg(test)]
mod tests {
    use kube::api::ObjectMeta;
    use vigil_crd::Prometheus;
    use vigil_crd::v1::PrometheusSpec;

    use super::*;

    fn prometheus() -> Prometheus {
        let mut prom = Prometheus::new("main", PrometheusSpec::default());
        prom.metadata = ObjectMeta {
            name: Some("main".into()),
            namespace: Some("monitoring".into()),
            labels: Some(BTreeMap::from([("team".into(), "obs".into())])),
            annotations: Some(BTreeMap::from([
                ("owner".into(), "obs".into()),
                (
                    "kubectl.kubernetes.io/last-applied-configuration".into(),
                    "{}".into(),
                ),
            ])),
            generation: Some(1),
            resource_version: Some("100".into()),
            ..Default::default()
        };
        prom
    }

    fn hash(prom: &Prometheus) -> String {
        InputHasher::new()
            .object("target", prom)
            .unwrap()
            .bytes("config", b"scrape_configs: []")
            .finish()
    }

    #[test]
    fn equal_inputs_hash_equal() {
        assert_eq!(hash(&prometheus()), hash(&prometheus()));
        assert_eq!(hash(&prometheus()).len(), 64);
    }

    #[test]
    fn spec_labels_and_annotations_change_the_hash() {
        let base = hash(&prometheus());

        let mut changed = prometheus();
        changed.spec.common.replicas = Some(3);
        assert_ne!(hash(&changed), base);

        let mut changed = prometheus();
        changed.labels_mut().insert("tier".into(), "infra".into());
        assert_ne!(hash(&changed), base);

        let mut changed = prometheus();
        changed.annotations_mut().insert("owner".into(), "web".into());
        assert_ne!(hash(&changed), base);
    }

    #[test]
    fn bookkeeping_fields_do_not_change_the_hash() {
        let base = hash(&prometheus());

        let mut changed = prometheus();
        changed.metadata.generation = Some(7);
        changed.metadata.resource_version = Some("999".into());
        changed
            .annotations_mut()
            .insert("kubectl.kubernetes.io/restartedAt".into(), "now".into());
        changed
            .annotations_mut()
            .insert(INPUT_HASH_ANNOTATION.into(), "stale".into());
        changed.status = Some(vigil_crd::common::WorkloadStatus {
            paused: true,
            ..Default::default()
        });

        assert_eq!(hash(&changed), base);
    }

    #[test]
    fn segments_are_not_ambiguous() {
        let a = InputHasher::new().bytes("a", b"bc").finish();
        let b = InputHasher::new().bytes("ab", b"c").finish();
        assert_ne!(a, b);
    }

    #[test]
    fn short_hash_is_stable() {
        assert_eq!(short_hash("secret-x"), short_hash("secret-x"));
        assert_eq!(short_hash("secret-x").len(), 16);
        assert_ne!(short_hash("secret-x"), short_hash("secret-y"));
    }
}
