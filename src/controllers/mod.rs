//! Kubernetes controller for the WebApp CRD
//!
//! This module wires the kube-runtime controller to the reconcile engine.

mod webapp_controller;

pub use webapp_controller::{requeue_action, run as run_webapp_controller};

use std::sync::Arc;

use k8s_openapi::NamespaceResourceScope;
use kube::{Api, Client, Resource};

use crate::config::OperatorConfig;
use crate::reconcilers::ReconcileEngine;
use crate::store::Stores;

/// Shared context for the controller
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Operator settings
    pub config: OperatorConfig,
    /// Reconcile engine shared by all reconciles
    pub engine: Arc<ReconcileEngine>,
}

impl Context {
    /// Create a new context backed by the Kubernetes API
    pub fn new(client: Client, config: OperatorConfig) -> Self {
        let engine = ReconcileEngine::new(Stores::kube(client.clone()), &config);
        Self {
            client,
            config,
            engine: Arc::new(engine),
        }
    }

    /// Api for `K` in the watched namespace, or across all namespaces
    pub fn api<K>(&self) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        match &self.config.watch_namespace {
            Some(namespace) => Api::namespaced(self.client.clone(), namespace),
            None => Api::all(self.client.clone()),
        }
    }
}
