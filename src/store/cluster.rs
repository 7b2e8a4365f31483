//! Resource store backed by the Kubernetes API

use std::fmt::Debug;
use std::marker::PhantomData;

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::{
    api::{Patch, PatchParams, PostParams},
    Api, Client, Resource, ResourceExt,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::json;

use super::{ObjectKey, ObjectStore, StatusStore, StoreResult};
use crate::crd::WebApp;
use crate::error::StoreError;

/// Field manager recorded on every write
const FIELD_MANAGER: &str = "webapp-operator";

/// [`ObjectStore`] for one namespaced kind, talking to the API server
pub struct KubeStore<K> {
    client: Client,
    _kind: PhantomData<fn() -> K>,
}

impl<K> KubeStore<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
{
    pub fn new(client: Client) -> Self {
        Self {
            client,
            _kind: PhantomData,
        }
    }

    fn api(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn classify(key: &ObjectKey, err: kube::Error) -> StoreError {
        StoreError::from_kube(&K::kind(&()), key, err)
    }
}

fn post_params() -> PostParams {
    PostParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    }
}

#[async_trait]
impl<K> ObjectStore<K> for KubeStore<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + Debug
        + DeserializeOwned
        + Serialize
        + Send
        + Sync
        + 'static,
{
    async fn get(&self, key: &ObjectKey) -> StoreResult<K> {
        self.api(&key.namespace)
            .get(&key.name)
            .await
            .map_err(|e| Self::classify(key, e))
    }

    async fn create(&self, obj: &K) -> StoreResult<K> {
        let key = ObjectKey::from_resource(obj);
        self.api(&key.namespace)
            .create(&post_params(), obj)
            .await
            .map_err(|e| Self::classify(&key, e))
    }

    async fn replace(&self, obj: &K) -> StoreResult<K> {
        let key = ObjectKey::from_resource(obj);
        self.api(&key.namespace)
            .replace(&key.name, &post_params(), obj)
            .await
            .map_err(|e| Self::classify(&key, e))
    }
}

#[async_trait]
impl StatusStore<WebApp> for KubeStore<WebApp> {
    async fn replace_status(&self, obj: &WebApp) -> StoreResult<WebApp> {
        let key = ObjectKey::from_resource(obj);

        // resourceVersion in a merge patch acts as a precondition
        let patch = json!({
            "metadata": {
                "resourceVersion": obj.resource_version(),
            },
            "status": obj.status,
        });

        self.api(&key.namespace)
            .patch_status(&key.name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await
            .map_err(|e| Self::classify(&key, e))
    }
}
