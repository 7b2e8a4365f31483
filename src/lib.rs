//! WebApp Kubernetes Operator
//!
//! This operator keeps a Deployment and a Service in step with each WebApp
//! custom resource, and re-verifies them periodically so drift introduced
//! outside the operator is repaired.

pub mod config;
pub mod controllers;
pub mod crd;
pub mod error;
pub mod metrics;
pub mod reconcilers;
pub mod store;

pub use error::{Error, Result};
