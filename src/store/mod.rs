//! Resource store capability
//!
//! The reconcilers never talk to the API server directly. They go through
//! [`ObjectStore`] and [`StatusStore`], which the operator backs with
//! [`KubeStore`] and tests back with [`MemoryStore`].

mod cluster;
mod memory;

pub use cluster::KubeStore;
pub use memory::{MemoryStore, Operation, WriteCounts};

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use kube::{Client, Resource, ResourceExt};

use crate::crd::WebApp;
use crate::error::StoreError;

/// Result of a single store call
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Namespaced identity of an object
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of an existing object; cluster-scoped or unnamespaced objects map to "default"
    pub fn from_resource<K: Resource>(obj: &K) -> Self {
        Self::new(
            obj.namespace().unwrap_or_else(|| "default".to_string()),
            obj.name_any(),
        )
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Read and write access to objects of one kind
#[async_trait]
pub trait ObjectStore<K>: Send + Sync
where
    K: Send + Sync + 'static,
{
    /// Read the object at `key`
    async fn get(&self, key: &ObjectKey) -> StoreResult<K>;

    /// Create `obj`; fails with `AlreadyExists` if the identity is taken
    async fn create(&self, obj: &K) -> StoreResult<K>;

    /// Replace `obj`, using its `metadata.resourceVersion` as the concurrency token
    async fn replace(&self, obj: &K) -> StoreResult<K>;
}

/// Write access to the status subresource
#[async_trait]
pub trait StatusStore<K>: ObjectStore<K>
where
    K: Send + Sync + 'static,
{
    /// Write the status of `obj`, using its `metadata.resourceVersion` as the concurrency token
    async fn replace_status(&self, obj: &K) -> StoreResult<K>;
}

/// The stores one reconcile pass needs
#[derive(Clone)]
pub struct Stores {
    pub webapps: Arc<dyn StatusStore<WebApp>>,
    pub deployments: Arc<dyn ObjectStore<Deployment>>,
    pub services: Arc<dyn ObjectStore<Service>>,
}

impl Stores {
    /// Stores backed by the Kubernetes API
    pub fn kube(client: Client) -> Self {
        Self {
            webapps: Arc::new(KubeStore::<WebApp>::new(client.clone())),
            deployments: Arc::new(KubeStore::<Deployment>::new(client.clone())),
            services: Arc::new(KubeStore::<Service>::new(client)),
        }
    }

    /// Stores backed by in-memory fakes; the caller keeps handles for inspection
    pub fn memory(
        webapps: Arc<MemoryStore<WebApp>>,
        deployments: Arc<MemoryStore<Deployment>>,
        services: Arc<MemoryStore<Service>>,
    ) -> Self {
        Self {
            webapps,
            deployments,
            services,
        }
    }
}
