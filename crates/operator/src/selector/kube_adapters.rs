use std::sync::Arc;

use k8s_openapi::api::authorization::v1::{
    ResourceAttributes, SelfSubjectAccessReview, SelfSubjectAccessReviewSpec,
};
use k8s_openapi::api::core::v1::Namespace;
use kube::api::PostParams;
use kube::core::ApiResource;
use kube::runtime::reflector::Store;
use kube::{Api, Client, Resource, ResourceExt};
use tracing::debug;

use super::{Authorizer, MonitorCache, NamespaceInfo};
use crate::Result;

/// Answers authorization queries with a `SelfSubjectAccessReview` per call.
///
/// Answers are never memoized: RBAC can change between reconciliations.
#[derive(Clone)]
pub struct KubeAuthorizer {
    client: Client,
}

impl KubeAuthorizer {
    /// Creates an authorizer acting as the client's identity
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl Authorizer for KubeAuthorizer {
    async fn can_list(&self, resource: &ApiResource, namespace: &str) -> Result<bool> {
        let api: Api<SelfSubjectAccessReview> = Api::all(self.client.clone());
        let review = SelfSubjectAccessReview {
            spec: SelfSubjectAccessReviewSpec {
                resource_attributes: Some(ResourceAttributes {
                    group: Some(resource.group.clone()),
                    resource: Some(resource.plural.clone()),
                    verb: Some("list".into()),
                    namespace: Some(namespace.into()),
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        };

        let created = api.create(&PostParams::default(), &review).await?;
        let allowed = created.status.is_some_and(|s| s.allowed);
        debug!(kind = %resource.kind, namespace, allowed, "access review");
        Ok(allowed)
    }
}

/// Monitor cache backed by reflector stores
#[derive(Clone)]
pub struct StoreCache<K: Resource<DynamicType = ()> + Clone + 'static> {
    namespaces: Store<Namespace>,
    objects: Store<K>,
}

impl<K: Resource<DynamicType = ()> + Clone + 'static> StoreCache<K> {
    /// Wraps the reader halves of a namespace and a monitor reflector
    #[must_use]
    pub fn new(namespaces: Store<Namespace>, objects: Store<K>) -> Self {
        Self {
            namespaces,
            objects,
        }
    }
}

impl<K: Resource<DynamicType = ()> + Clone + 'static> MonitorCache<K> for StoreCache<K> {
    fn namespaces(&self) -> Vec<NamespaceInfo> {
        self.namespaces
            .state()
            .iter()
            .map(|ns| NamespaceInfo {
                name: ns.name_any(),
                labels: ns.labels().clone(),
            })
            .collect()
    }

    fn list(&self, namespace: &str) -> Vec<Arc<K>> {
        self.objects
            .state()
            .into_iter()
            .filter(|o| o.namespace().as_deref() == Some(namespace))
            .collect()
    }
}
