//! Reconcilers for the WebApp CRD
//!
//! This module contains the business logic for converging a WebApp:
//! - Building the desired Deployment and Service
//! - Creating or updating each child
//! - Updating the WebApp status
//! - Deciding when the WebApp is reconciled again

pub mod backoff;
pub mod children;
pub mod desired;
pub mod engine;
pub mod status;

pub use engine::{Outcome, ReconcileEngine, REVERIFY_INTERVAL};
