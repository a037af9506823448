//! Store implementations backed by the Kubernetes API
//!
//! Reads come from `kube` reflector caches, writes go straight to the API
//! server through `Api<K>`.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::marker::PhantomData;

use async_trait::async_trait;
use kube::{
    api::{DeleteParams, PostParams},
    core::NamespaceResourceScope,
    runtime::reflector::{ObjectRef, Store},
    Api, Client, Resource, ResourceExt,
};
use serde::{de::DeserializeOwned, Serialize};

use super::{Lister, ResourceClient};
use crate::crd::selector_matches;
use crate::error::{Error, Result};

/// [`Lister`] over a reflector store
pub struct KubeLister<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + Hash + Clone,
{
    store: Store<K>,
}

impl<K> KubeLister<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + Hash + Clone,
{
    pub fn new(store: Store<K>) -> Self {
        Self { store }
    }
}

impl<K> Lister<K> for KubeLister<K>
where
    K: Resource + Clone + Send + Sync + 'static,
    K::DynamicType: Eq + Hash + Clone + Default + Send + Sync,
{
    fn get(&self, namespace: &str, name: &str) -> Option<K> {
        let mut obj_ref = ObjectRef::<K>::new(name);
        if !namespace.is_empty() {
            obj_ref = obj_ref.within(namespace);
        }
        self.store.get(&obj_ref).map(|obj| obj.as_ref().clone())
    }

    fn list(&self, namespace: Option<&str>, selector: &BTreeMap<String, String>) -> Vec<K> {
        self.store
            .state()
            .into_iter()
            .filter(|obj| namespace.map_or(true, |ns| obj.meta().namespace.as_deref() == Some(ns)))
            .filter(|obj| selector_matches(selector, obj.meta().labels.as_ref()))
            .map(|obj| obj.as_ref().clone())
            .collect()
    }
}

/// [`ResourceClient`] over `kube::Api`
pub struct KubeClient<K> {
    client: Client,
    _kind: PhantomData<fn() -> K>,
}

impl<K> KubeClient<K> {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            _kind: PhantomData,
        }
    }
}

impl<K> KubeClient<K>
where
    K: Resource<Scope = NamespaceResourceScope>,
    K::DynamicType: Default,
{
    fn api(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn describe<K: Resource>(obj: &K) -> String {
    format!(
        "{}/{}",
        obj.meta().namespace.as_deref().unwrap_or_default(),
        obj.meta().name.as_deref().unwrap_or_default()
    )
}

#[async_trait]
impl<K> ResourceClient<K> for KubeClient<K>
where
    K: Resource<Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
    K::DynamicType: Default,
{
    async fn create(&self, obj: &K) -> Result<K> {
        let namespace = obj.namespace().unwrap_or_default();
        self.api(&namespace)
            .create(&PostParams::default(), obj)
            .await
            .map_err(|e| Error::from_kube(e, &describe(obj)))
    }

    async fn update(&self, obj: &K) -> Result<K> {
        let namespace = obj.namespace().unwrap_or_default();
        self.api(&namespace)
            .replace(&obj.name_any(), &PostParams::default(), obj)
            .await
            .map_err(|e| Error::from_kube(e, &describe(obj)))
    }

    async fn update_status(&self, obj: &K) -> Result<K> {
        let namespace = obj.namespace().unwrap_or_default();
        let data = serde_json::to_vec(obj)?;
        self.api(&namespace)
            .replace_status(&obj.name_any(), &PostParams::default(), data)
            .await
            .map_err(|e| Error::from_kube(e, &describe(obj)))
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        match self.api(namespace).delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) => match Error::from_kube(e, &format!("{}/{}", namespace, name)) {
                Error::NotFound(_) => Ok(()),
                other => Err(other),
            },
        }
    }
}
