//! Desired state of the children derived from a WebApp
//!
//! Pure functions only. Given the same WebApp, [`build`] always returns the
//! same Deployment and Service definitions.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, PodSpec, PodTemplateSpec, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{Resource, ResourceExt};

use crate::crd::WebApp;
use crate::error::{Error, Result};

/// Label binding the pods, the Deployment and the Service to their WebApp
pub const APP_LABEL: &str = "app";

/// Name of the single container in the pod template
pub const CONTAINER_NAME: &str = "webapp";

/// Suffix appended to the WebApp name to form the Service name
pub const SERVICE_SUFFIX: &str = "-service";

/// Port the Service exposes
pub const SERVICE_PORT: i32 = 80;

const SERVICE_PORT_NAME: &str = "http";
const PROTOCOL: &str = "TCP";

/// The two children of one WebApp
#[derive(Clone, Debug, PartialEq)]
pub struct DesiredChildren {
    pub deployment: Deployment,
    pub service: Service,
}

/// Validate that the WebApp can be turned into children
///
/// The API server schema rejects most of these already; the check keeps the
/// builder from producing children the API server would refuse.
pub fn validate(webapp: &WebApp) -> Result<()> {
    if webapp.metadata.name.as_deref().unwrap_or_default().is_empty() {
        return Err(Error::validation("WebApp has no name"));
    }

    if webapp.namespace().is_none() {
        return Err(Error::validation("WebApp has no namespace"));
    }

    if webapp.spec.replicas < 0 {
        return Err(Error::validation(format!(
            "Invalid replicas {}: must not be negative",
            webapp.spec.replicas
        )));
    }

    if webapp.spec.image.trim().is_empty() {
        return Err(Error::validation("Image must not be empty"));
    }

    if !(1..=65535).contains(&webapp.spec.port) {
        return Err(Error::validation(format!(
            "Invalid port {}: must be between 1 and 65535",
            webapp.spec.port
        )));
    }

    Ok(())
}

/// Label set shared by the pod template, both children and the Service selector
pub fn selector_labels(webapp_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(APP_LABEL.to_string(), webapp_name.to_string())])
}

/// Name of the Deployment owned by `webapp_name`
pub fn deployment_name(webapp_name: &str) -> String {
    webapp_name.to_string()
}

/// Name of the Service owned by `webapp_name`
pub fn service_name(webapp_name: &str) -> String {
    format!("{}{}", webapp_name, SERVICE_SUFFIX)
}

/// Build the children of `webapp`
pub fn build(webapp: &WebApp) -> DesiredChildren {
    let name = webapp.name_any();
    let labels = selector_labels(&name);

    // None until the API server has assigned a uid
    let owner = webapp.controller_owner_ref(&());

    let metadata = |child_name: String| ObjectMeta {
        name: Some(child_name),
        namespace: webapp.namespace(),
        labels: Some(labels.clone()),
        owner_references: owner.clone().map(|o| vec![o]),
        ..Default::default()
    };

    let deployment = Deployment {
        metadata: metadata(deployment_name(&name)),
        spec: Some(DeploymentSpec {
            replicas: Some(webapp.spec.replicas),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels.clone()),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: CONTAINER_NAME.to_string(),
                        image: Some(webapp.spec.image.clone()),
                        ports: Some(vec![ContainerPort {
                            container_port: webapp.spec.port,
                            protocol: Some(PROTOCOL.to_string()),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    };

    let service = Service {
        metadata: metadata(service_name(&name)),
        spec: Some(ServiceSpec {
            selector: Some(labels.clone()),
            ports: Some(vec![ServicePort {
                name: Some(SERVICE_PORT_NAME.to_string()),
                port: SERVICE_PORT,
                target_port: Some(IntOrString::Int(webapp.spec.port)),
                protocol: Some(PROTOCOL.to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    };

    DesiredChildren {
        deployment,
        service,
    }
}
