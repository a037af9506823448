//! In-memory store
//!
//! Behaves like the API server as far as the reconcilers can tell:
//! resource versions are checked on every write, deletion of an object with
//! finalizers only marks it, and status is a separate subresource. Every
//! write is appended to a log so tests can assert on ordering.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::Resource;

use super::{Lister, ResourceClient, StatusSubresource};
use crate::crd::selector_matches;
use crate::error::{Error, Result};

/// One write observed by a [`MemoryStore`]
#[derive(Clone, Debug)]
pub enum StoreWrite<K> {
    Create(K),
    Update(K),
    UpdateStatus(K),
    Delete { namespace: String, name: String },
}

impl<K> StoreWrite<K> {
    /// The stored object for create and update writes
    pub fn object(&self) -> Option<&K> {
        match self {
            StoreWrite::Create(obj) | StoreWrite::Update(obj) | StoreWrite::UpdateStatus(obj) => {
                Some(obj)
            }
            StoreWrite::Delete { .. } => None,
        }
    }
}

struct Inner<K> {
    objects: BTreeMap<(String, String), K>,
    writes: Vec<StoreWrite<K>>,
    version: u64,
}

/// Thread-safe in-memory object store implementing [`Lister`] and [`ResourceClient`]
pub struct MemoryStore<K> {
    inner: Mutex<Inner<K>>,
}

impl<K> Default for MemoryStore<K> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                objects: BTreeMap::new(),
                writes: Vec::new(),
                version: 0,
            }),
        }
    }
}

fn object_key<K: Resource>(obj: &K) -> (String, String) {
    let meta = obj.meta();
    (
        meta.namespace.clone().unwrap_or_default(),
        meta.name.clone().unwrap_or_default(),
    )
}

impl<K> MemoryStore<K>
where
    K: Resource + Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner<K>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seed an object without logging a write
    pub fn insert(&self, mut obj: K) -> K {
        let mut inner = self.lock();
        stamp(&mut inner, &mut obj);
        inner.objects.insert(object_key(&obj), obj.clone());
        obj
    }

    /// Drop an object without logging a write
    pub fn remove(&self, namespace: &str, name: &str) -> Option<K> {
        self.lock()
            .objects
            .remove(&(namespace.to_string(), name.to_string()))
    }

    /// Current copy of an object
    pub fn object(&self, namespace: &str, name: &str) -> Option<K> {
        self.lock()
            .objects
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every write so far, oldest first
    pub fn writes(&self) -> Vec<StoreWrite<K>> {
        self.lock().writes.clone()
    }

    pub fn clear_writes(&self) {
        self.lock().writes.clear();
    }
}

fn stamp<K: Resource>(inner: &mut Inner<K>, obj: &mut K) {
    inner.version += 1;
    let meta = obj.meta_mut();
    if meta.uid.is_none() {
        meta.uid = Some(uuid::Uuid::new_v4().to_string());
    }
    if meta.creation_timestamp.is_none() {
        meta.creation_timestamp = Some(Time(chrono::Utc::now()));
    }
    meta.resource_version = Some(inner.version.to_string());
}

fn check_version<K: Resource>(stored: &K, incoming: &K, what: &str) -> Result<()> {
    match &incoming.meta().resource_version {
        Some(version) if Some(version) != stored.meta().resource_version.as_ref() => {
            Err(Error::Conflict(what.to_string()))
        }
        _ => Ok(()),
    }
}

impl<K> Lister<K> for MemoryStore<K>
where
    K: Resource + Clone + Send + Sync,
{
    fn get(&self, namespace: &str, name: &str) -> Option<K> {
        self.object(namespace, name)
    }

    fn list(&self, namespace: Option<&str>, selector: &BTreeMap<String, String>) -> Vec<K> {
        self.lock()
            .objects
            .iter()
            .filter(|((ns, _), _)| namespace.map_or(true, |want| ns == want))
            .filter(|(_, obj)| selector_matches(selector, obj.meta().labels.as_ref()))
            .map(|(_, obj)| obj.clone())
            .collect()
    }
}

#[async_trait]
impl<K> ResourceClient<K> for MemoryStore<K>
where
    K: Resource + StatusSubresource + Clone + Send + Sync,
{
    async fn create(&self, obj: &K) -> Result<K> {
        let key = object_key(obj);
        let mut inner = self.lock();
        if inner.objects.contains_key(&key) {
            return Err(Error::AlreadyExists(format!("{}/{}", key.0, key.1)));
        }
        let mut created = obj.clone();
        created.meta_mut().deletion_timestamp = None;
        stamp(&mut inner, &mut created);
        inner.objects.insert(key, created.clone());
        inner.writes.push(StoreWrite::Create(created.clone()));
        Ok(created)
    }

    async fn update(&self, obj: &K) -> Result<K> {
        let key = object_key(obj);
        let what = format!("{}/{}", key.0, key.1);
        let mut inner = self.lock();
        let stored = inner
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::NotFound(what.clone()))?;
        check_version(&stored, obj, &what)?;

        let mut updated = obj.clone();
        updated.copy_status_from(&stored);
        updated.meta_mut().uid = stored.meta().uid.clone();
        updated.meta_mut().creation_timestamp = stored.meta().creation_timestamp.clone();
        updated.meta_mut().deletion_timestamp = stored.meta().deletion_timestamp.clone();
        stamp(&mut inner, &mut updated);
        inner.writes.push(StoreWrite::Update(updated.clone()));

        let released = updated.meta().deletion_timestamp.is_some()
            && updated.meta().finalizers.as_ref().map_or(true, Vec::is_empty);
        if released {
            inner.objects.remove(&key);
        } else {
            inner.objects.insert(key, updated.clone());
        }
        Ok(updated)
    }

    async fn update_status(&self, obj: &K) -> Result<K> {
        let key = object_key(obj);
        let what = format!("{}/{}", key.0, key.1);
        let mut inner = self.lock();
        let mut updated = inner
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::NotFound(what.clone()))?;
        check_version(&updated, obj, &what)?;

        updated.copy_status_from(obj);
        stamp(&mut inner, &mut updated);
        inner.objects.insert(key, updated.clone());
        inner.writes.push(StoreWrite::UpdateStatus(updated.clone()));
        Ok(updated)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        let key = (namespace.to_string(), name.to_string());
        let mut inner = self.lock();
        let Some(mut stored) = inner.objects.get(&key).cloned() else {
            return Ok(());
        };
        inner.writes.push(StoreWrite::Delete {
            namespace: namespace.to_string(),
            name: name.to_string(),
        });

        let has_finalizers = stored
            .meta()
            .finalizers
            .as_ref()
            .is_some_and(|f| !f.is_empty());
        if !has_finalizers {
            inner.objects.remove(&key);
            return Ok(());
        }
        if stored.meta().deletion_timestamp.is_none() {
            stored.meta_mut().deletion_timestamp = Some(Time(chrono::Utc::now()));
            stamp(&mut inner, &mut stored);
            inner.objects.insert(key, stored);
        }
        Ok(())
    }
}
