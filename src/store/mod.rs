//! Read and write access to cluster resources
//!
//! Reconcilers never talk to the API server directly. They read through a
//! [`Lister`] (an eventually consistent cache) and write through a
//! [`ResourceClient`]. Both are injected at construction time so the same
//! reconciler runs against `kube` in production and against
//! an in-memory store in tests (`memory`, built with the `testing` feature).

pub mod cluster;
#[cfg(any(test, feature = "testing"))]
pub mod memory;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod, Service};

use crate::crd::{BackendGroup, BackendRecord, Bind, LoadBalancer, LoadBalancerDriver};
use crate::error::{Error, Result};

/// Read-only view over cached objects of one kind
pub trait Lister<K>: Send + Sync {
    /// Object by namespace and name, an empty namespace addresses cluster scoped objects
    fn get(&self, namespace: &str, name: &str) -> Option<K>;

    /// Objects in `namespace` (all namespaces when `None`) carrying every label of `selector`
    fn list(&self, namespace: Option<&str>, selector: &BTreeMap<String, String>) -> Vec<K>;
}

/// Writes against the backing store
///
/// Writes are optimistic: an object whose resource version is stale is
/// rejected with [`Error::Conflict`].
#[async_trait]
pub trait ResourceClient<K>: Send + Sync {
    async fn create(&self, obj: &K) -> Result<K>;

    /// Replace metadata and spec, status is ignored
    async fn update(&self, obj: &K) -> Result<K>;

    /// Replace the status subresource, everything else is ignored
    async fn update_status(&self, obj: &K) -> Result<K>;

    /// Request deletion, missing objects are not an error
    async fn delete(&self, namespace: &str, name: &str) -> Result<()>;
}

/// Objects with a status subresource
#[cfg(any(test, feature = "testing"))]
pub trait StatusSubresource {
    fn copy_status_from(&mut self, other: &Self);
}

#[cfg(any(test, feature = "testing"))]
macro_rules! impl_status_subresource {
    ($($kind:ty),*) => {
        $(impl StatusSubresource for $kind {
            fn copy_status_from(&mut self, other: &Self) {
                self.status = other.status.clone();
            }
        })*
    };
}

#[cfg(any(test, feature = "testing"))]
impl_status_subresource!(LoadBalancer, BackendGroup, BackendRecord, Bind);

/// Every lister the reconcilers read from
#[derive(Clone)]
pub struct Listers {
    pub pods: Arc<dyn Lister<Pod>>,
    pub services: Arc<dyn Lister<Service>>,
    pub nodes: Arc<dyn Lister<Node>>,
    pub drivers: Arc<dyn Lister<LoadBalancerDriver>>,
    pub load_balancers: Arc<dyn Lister<LoadBalancer>>,
    pub backend_groups: Arc<dyn Lister<BackendGroup>>,
    pub backend_records: Arc<dyn Lister<BackendRecord>>,
    pub binds: Arc<dyn Lister<Bind>>,
}

/// Every client the reconcilers write through
#[derive(Clone)]
pub struct Clients {
    pub load_balancers: Arc<dyn ResourceClient<LoadBalancer>>,
    pub backend_groups: Arc<dyn ResourceClient<BackendGroup>>,
    pub backend_records: Arc<dyn ResourceClient<BackendRecord>>,
    pub binds: Arc<dyn ResourceClient<Bind>>,
}

/// Reconciliation key of an object, `namespace/name` or `name`
pub fn namespaced_key(namespace: &str, name: &str) -> String {
    if namespace.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", namespace, name)
    }
}

/// Split a reconciliation key into namespace and name
pub fn split_key(key: &str) -> Result<(&str, &str)> {
    let parts: Vec<&str> = key.split('/').collect();
    match parts.as_slice() {
        [name] if !name.is_empty() => Ok(("", *name)),
        [namespace, name] if !name.is_empty() => Ok((*namespace, *name)),
        _ => Err(Error::InvalidKey(key.to_string())),
    }
}

/// Whether the finalizer list contains `finalizer`
pub fn has_finalizer(finalizers: Option<&Vec<String>>, finalizer: &str) -> bool {
    finalizers.is_some_and(|f| f.iter().any(|x| x == finalizer))
}

/// Finalizer list without `finalizer`
pub fn remove_finalizer(finalizers: &[String], finalizer: &str) -> Vec<String> {
    finalizers
        .iter()
        .filter(|f| *f != finalizer)
        .cloned()
        .collect()
}
