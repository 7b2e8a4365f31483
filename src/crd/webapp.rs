//! WebApp Custom Resource Definition

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// WebApp resource specification
///
/// The operator derives a Deployment named after the WebApp and a Service
/// named `<name>-service` from this spec.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[kube(
    group = "webapp.example.com",
    version = "v1alpha1",
    kind = "WebApp",
    plural = "webapps",
    singular = "webapp",
    shortname = "wa",
    namespaced,
    status = "WebAppStatus",
    printcolumn = r#"{"name": "Replicas", "type": "integer", "jsonPath": ".spec.replicas"}"#,
    printcolumn = r#"{"name": "Available", "type": "integer", "jsonPath": ".status.availableReplicas"}"#,
    printcolumn = r#"{"name": "Image", "type": "string", "jsonPath": ".spec.image"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct WebAppSpec {
    /// Number of pod replicas
    #[schemars(range(min = 0))]
    pub replicas: i32,

    /// Container image to run
    #[schemars(length(min = 1))]
    pub image: String,

    /// Port the container listens on
    #[schemars(range(min = 1, max = 65535))]
    pub port: i32,
}

/// WebApp status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WebAppStatus {
    /// Ready replicas reported by the child Deployment
    #[serde(default)]
    pub available_replicas: i32,
}
