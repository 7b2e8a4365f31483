//! Custom Resource Definitions for the WebApp Operator

mod webapp;

pub use webapp::*;

use kube::CustomResourceExt;

/// Generate all CRD YAML manifests
pub fn generate_crds() -> Result<Vec<String>, serde_yaml::Error> {
    Ok(vec![serde_yaml::to_string(&WebApp::crd())?])
}
