//! In-memory resource store
//!
//! Behaves like the API server for the calls the reconcilers make:
//! resource versions are bumped on every write, replaces with a stale
//! version fail with `Conflict`, and creates of an existing identity fail
//! with `AlreadyExists`. Writes are counted so tests can assert that a pass
//! issued none.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use kube::Resource;

use super::{ObjectKey, ObjectStore, StatusStore, StoreResult};
use crate::crd::WebApp;
use crate::error::StoreError;

/// Store call kinds, used for fault injection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Get,
    Create,
    Replace,
    ReplaceStatus,
}

/// Writes accepted by a [`MemoryStore`]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WriteCounts {
    pub creates: usize,
    pub replaces: usize,
    pub status_replaces: usize,
}

impl WriteCounts {
    pub fn total(&self) -> usize {
        self.creates + self.replaces + self.status_replaces
    }
}

struct Inner<K> {
    objects: BTreeMap<ObjectKey, K>,
    version: u64,
    writes: WriteCounts,
    faults: VecDeque<(Operation, StoreError)>,
}

/// [`ObjectStore`] kept in process memory
pub struct MemoryStore<K> {
    inner: Mutex<Inner<K>>,
}

impl<K> Default for MemoryStore<K> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                objects: BTreeMap::new(),
                version: 0,
                writes: WriteCounts::default(),
                faults: VecDeque::new(),
            }),
        }
    }
}

impl<K> MemoryStore<K>
where
    K: Resource<DynamicType = ()> + Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner<K>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn kind() -> String {
        K::kind(&()).to_string()
    }

    /// Store `obj` as if another client had written it; not counted as a write
    pub fn insert(&self, mut obj: K) -> K {
        let mut inner = self.lock();
        inner.stamp(&mut obj);
        inner
            .objects
            .insert(ObjectKey::from_resource(&obj), obj.clone());
        obj
    }

    /// Edit a stored object out of band, bumping its resource version
    pub fn modify(&self, key: &ObjectKey, edit: impl FnOnce(&mut K)) -> Option<K> {
        let mut inner = self.lock();
        let mut obj = inner.objects.get(key)?.clone();
        edit(&mut obj);
        inner.stamp(&mut obj);
        inner.objects.insert(key.clone(), obj.clone());
        Some(obj)
    }

    pub fn remove(&self, key: &ObjectKey) -> Option<K> {
        self.lock().objects.remove(key)
    }

    pub fn object(&self, key: &ObjectKey) -> Option<K> {
        self.lock().objects.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn writes(&self) -> WriteCounts {
        self.lock().writes
    }

    /// Make the next call of `operation` fail with `error`
    pub fn fail_next(&self, operation: Operation, error: StoreError) {
        self.lock().faults.push_back((operation, error));
    }

    fn check_fault(&self, operation: Operation) -> StoreResult<()> {
        let mut inner = self.lock();
        match inner.faults.iter().position(|(op, _)| *op == operation) {
            Some(index) => match inner.faults.remove(index) {
                Some((_, error)) => Err(error),
                None => Ok(()),
            },
            None => Ok(()),
        }
    }
}

impl<K> Inner<K>
where
    K: Resource<DynamicType = ()>,
{
    /// Assign a fresh resource version, and a uid on first write
    fn stamp(&mut self, obj: &mut K) {
        self.version += 1;
        let version = self.version;
        let meta = obj.meta_mut();
        meta.resource_version = Some(version.to_string());
        if meta.uid.is_none() {
            meta.uid = Some(format!("uid-{}", version));
        }
    }

    /// Check `obj` carries the stored version; returns the key on success
    fn check_token(&self, kind: &str, obj: &K) -> StoreResult<ObjectKey> {
        let key = ObjectKey::from_resource(obj);
        let stored = self
            .objects
            .get(&key)
            .ok_or_else(|| StoreError::not_found(kind, &key))?;
        if stored.meta().resource_version != obj.meta().resource_version {
            return Err(StoreError::conflict(
                kind,
                &key,
                "the object has been modified; please apply your changes to the latest version",
            ));
        }
        Ok(key)
    }
}

#[async_trait]
impl<K> ObjectStore<K> for MemoryStore<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &ObjectKey) -> StoreResult<K> {
        self.check_fault(Operation::Get)?;
        self.lock()
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::not_found(Self::kind(), key))
    }

    async fn create(&self, obj: &K) -> StoreResult<K> {
        self.check_fault(Operation::Create)?;
        let key = ObjectKey::from_resource(obj);
        let mut inner = self.lock();
        if inner.objects.contains_key(&key) {
            return Err(StoreError::already_exists(Self::kind(), &key));
        }
        let mut created = obj.clone();
        created.meta_mut().uid = None;
        inner.stamp(&mut created);
        inner.objects.insert(key, created.clone());
        inner.writes.creates += 1;
        Ok(created)
    }

    async fn replace(&self, obj: &K) -> StoreResult<K> {
        self.check_fault(Operation::Replace)?;
        let mut inner = self.lock();
        let key = inner.check_token(&Self::kind(), obj)?;
        let mut replaced = obj.clone();
        inner.stamp(&mut replaced);
        inner.objects.insert(key, replaced.clone());
        inner.writes.replaces += 1;
        Ok(replaced)
    }
}

#[async_trait]
impl StatusStore<WebApp> for MemoryStore<WebApp> {
    async fn replace_status(&self, obj: &WebApp) -> StoreResult<WebApp> {
        self.check_fault(Operation::ReplaceStatus)?;
        let mut inner = self.lock();
        let key = inner.check_token(&Self::kind(), obj)?;
        let Some(mut stored) = inner.objects.get(&key).cloned() else {
            return Err(StoreError::not_found(Self::kind(), &key));
        };
        // Only the status subresource is written
        stored.status = obj.status.clone();
        inner.stamp(&mut stored);
        inner.objects.insert(key, stored.clone());
        inner.writes.status_replaces += 1;
        Ok(stored)
    }
}
