//! Child object reconciler
//!
//! Ensures one child exists and matches its desired definition:
//! - absent: create it, treating `AlreadyExists` as success when the
//!   object found matches
//! - drifted: copy the owned fields onto the live object and replace it
//! - matching: leave it alone
//!
//! Only the fields the operator sets are compared. Fields the API server
//! defaults (protocol, clusterIP, nodePort, ...) never count as drift.

use std::collections::BTreeMap;
use std::fmt::Debug;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Container, Service, ServicePort};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::NamespaceResourceScope;
use kube::Resource;
use tracing::{debug, info};

use super::desired::{APP_LABEL, CONTAINER_NAME};
use crate::error::StoreError;
use crate::metrics;
use crate::store::{ObjectKey, ObjectStore};

/// A kind of child object the operator manages
pub trait ChildObject:
    Resource<Scope = NamespaceResourceScope, DynamicType = ()> + Clone + Debug + Send + Sync + 'static
{
    /// Whether any operator-owned field differs from `desired`
    fn drifted_from(&self, desired: &Self) -> bool;

    /// Copy the operator-owned fields of `desired` onto this object
    fn converge_to(&mut self, desired: &Self);
}

/// What [`ensure`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureAction {
    Created,
    /// Another writer created the child between our read and our create
    AlreadyExists,
    Updated,
    Unchanged,
}

impl EnsureAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnsureAction::Created => "create",
            EnsureAction::AlreadyExists => "already_exists",
            EnsureAction::Updated => "update",
            EnsureAction::Unchanged => "unchanged",
        }
    }
}

/// Outcome of [`ensure`], with the child as last observed
#[derive(Debug, Clone)]
pub struct Ensured<K> {
    pub action: EnsureAction,
    pub object: K,
}

/// Make the child at `desired`'s identity exist and match `desired`
///
/// `Conflict` is returned as an error; the caller decides to retry the pass.
pub async fn ensure<K: ChildObject>(
    store: &dyn ObjectStore<K>,
    desired: &K,
) -> Result<Ensured<K>, StoreError> {
    let key = ObjectKey::from_resource(desired);
    let kind = K::kind(&());

    let ensured = match store.get(&key).await {
        Ok(existing) if existing.drifted_from(desired) => {
            let mut updated = existing;
            updated.converge_to(desired);
            let object = store.replace(&updated).await?;
            info!(kind = %kind, key = %key, "Updated drifted child");
            Ensured {
                action: EnsureAction::Updated,
                object,
            }
        }
        Ok(existing) => {
            debug!(kind = %kind, key = %key, "Child up to date");
            Ensured {
                action: EnsureAction::Unchanged,
                object: existing,
            }
        }
        Err(StoreError::NotFound { .. }) => match store.create(desired).await {
            Ok(object) => {
                info!(kind = %kind, key = %key, "Created child");
                Ensured {
                    action: EnsureAction::Created,
                    object,
                }
            }
            Err(StoreError::AlreadyExists { .. }) => {
                debug!(kind = %kind, key = %key, "Child created concurrently");
                let object = store.get(&key).await?;
                if object.drifted_from(desired) {
                    // The other writer's version is repaired by an immediate retry
                    return Err(StoreError::conflict(
                        kind,
                        &key,
                        "created concurrently with different fields",
                    ));
                }
                Ensured {
                    action: EnsureAction::AlreadyExists,
                    object,
                }
            }
            Err(e) => return Err(e),
        },
        Err(e) => return Err(e),
    };

    if matches!(ensured.action, EnsureAction::Created | EnsureAction::Updated) {
        metrics::CHILD_WRITES
            .with_label_values(&[&*kind, ensured.action.as_str()])
            .inc();
    }

    Ok(ensured)
}

fn app_label(meta: &ObjectMeta) -> Option<&str> {
    meta.labels
        .as_ref()
        .and_then(|labels| labels.get(APP_LABEL))
        .map(String::as_str)
}

fn set_app_label(meta: &mut ObjectMeta, desired: &ObjectMeta) {
    if let Some(value) = app_label(desired) {
        meta.labels
            .get_or_insert_with(BTreeMap::new)
            .insert(APP_LABEL.to_string(), value.to_string());
    }
}

fn owners(meta: &ObjectMeta) -> &[OwnerReference] {
    meta.owner_references.as_deref().unwrap_or_default()
}

/// Owner references in `desired` that `meta` lacks, matched by uid
fn missing_owners<'a>(meta: &ObjectMeta, desired: &'a ObjectMeta) -> Vec<&'a OwnerReference> {
    owners(desired)
        .iter()
        .filter(|want| !owners(meta).iter().any(|have| have.uid == want.uid))
        .collect()
}

fn metadata_drifted(meta: &ObjectMeta, desired: &ObjectMeta) -> bool {
    app_label(meta) != app_label(desired) || !missing_owners(meta, desired).is_empty()
}

fn converge_metadata(meta: &mut ObjectMeta, desired: &ObjectMeta) {
    set_app_label(meta, desired);
    let missing: Vec<OwnerReference> = missing_owners(meta, desired).into_iter().cloned().collect();
    if !missing.is_empty() {
        meta.owner_references
            .get_or_insert_with(Vec::new)
            .extend(missing);
    }
}

/// Operator-owned fields of a Deployment
#[derive(Debug, PartialEq)]
struct DeploymentFields<'a> {
    replicas: Option<i32>,
    template_app_label: Option<&'a str>,
    image: Option<&'a str>,
    container_ports: Vec<i32>,
}

impl<'a> DeploymentFields<'a> {
    fn of(deployment: &'a Deployment) -> Self {
        let spec = deployment.spec.as_ref();
        let template = spec.map(|s| &s.template);
        let container = webapp_container(deployment);

        Self {
            replicas: spec.and_then(|s| s.replicas),
            template_app_label: template
                .and_then(|t| t.metadata.as_ref())
                .and_then(app_label),
            image: container.and_then(|c| c.image.as_deref()),
            container_ports: container
                .and_then(|c| c.ports.as_ref())
                .map(|ports| ports.iter().map(|p| p.container_port).collect())
                .unwrap_or_default(),
        }
    }
}

fn webapp_container(deployment: &Deployment) -> Option<&Container> {
    deployment
        .spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
        .and_then(|pod| pod.containers.iter().find(|c| c.name == CONTAINER_NAME))
}

impl ChildObject for Deployment {
    fn drifted_from(&self, desired: &Self) -> bool {
        metadata_drifted(&self.metadata, &desired.metadata)
            || DeploymentFields::of(self) != DeploymentFields::of(desired)
    }

    fn converge_to(&mut self, desired: &Self) {
        converge_metadata(&mut self.metadata, &desired.metadata);

        let Some(want) = desired.spec.as_ref() else {
            return;
        };
        if self.spec.is_none() {
            self.spec = Some(want.clone());
            return;
        }
        let Some(spec) = self.spec.as_mut() else {
            return;
        };

        // The selector is immutable; it is derived from the name and never changes
        spec.replicas = want.replicas;

        if let Some(want_meta) = want.template.metadata.as_ref() {
            set_app_label(spec.template.metadata.get_or_insert_with(Default::default), want_meta);
        }

        let Some(want_container) = webapp_container(desired) else {
            return;
        };
        let pod = spec.template.spec.get_or_insert_with(Default::default);
        match pod.containers.iter_mut().find(|c| c.name == CONTAINER_NAME) {
            Some(container) => {
                container.image = want_container.image.clone();
                container.ports = want_container.ports.clone();
            }
            None => pod.containers.push(want_container.clone()),
        }
    }
}

/// Operator-owned fields of one Service port
#[derive(Debug, PartialEq)]
struct PortFields<'a> {
    port: i32,
    target_port: Option<&'a IntOrString>,
}

impl<'a> PortFields<'a> {
    fn of(port: &'a ServicePort) -> Self {
        Self {
            port: port.port,
            target_port: port.target_port.as_ref(),
        }
    }
}

fn service_ports(service: &Service) -> Vec<PortFields<'_>> {
    service
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_ref())
        .map(|ports| ports.iter().map(PortFields::of).collect())
        .unwrap_or_default()
}

fn service_selector(service: &Service) -> Option<&BTreeMap<String, String>> {
    service.spec.as_ref().and_then(|s| s.selector.as_ref())
}

impl ChildObject for Service {
    fn drifted_from(&self, desired: &Self) -> bool {
        metadata_drifted(&self.metadata, &desired.metadata)
            || service_selector(self) != service_selector(desired)
            || service_ports(self) != service_ports(desired)
    }

    fn converge_to(&mut self, desired: &Self) {
        converge_metadata(&mut self.metadata, &desired.metadata);

        let Some(want) = desired.spec.as_ref() else {
            return;
        };
        let spec = self.spec.get_or_insert_with(Default::default);
        spec.selector = want.selector.clone();

        let want_ports = want.ports.as_deref().unwrap_or_default();
        match (spec.ports.as_mut(), want_ports) {
            // Keep server-assigned fields such as nodePort on the existing port
            (Some(ports), [want_port]) if ports.len() == 1 => {
                ports[0].port = want_port.port;
                ports[0].target_port = want_port.target_port.clone();
            }
            _ => spec.ports = want.ports.clone(),
        }
    }
}
