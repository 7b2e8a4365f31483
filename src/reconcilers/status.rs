//! WebApp status updates

use k8s_openapi::api::apps::v1::Deployment;
use tracing::{debug, info};

use crate::crd::{WebApp, WebAppStatus};
use crate::error::StoreError;
use crate::metrics;
use crate::store::{ObjectKey, StatusStore};

/// What [`update`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusOutcome {
    Updated,
    Unchanged,
    /// The parent changed since it was read; the next pass writes the status
    Conflict,
}

impl StatusOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusOutcome::Updated => "updated",
            StatusOutcome::Unchanged => "unchanged",
            StatusOutcome::Conflict => "conflict",
        }
    }
}

/// Ready replicas as reported by the Deployment itself
pub fn available_replicas(deployment: &Deployment) -> i32 {
    deployment
        .status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0)
}

/// Write `availableReplicas` to the parent status if it changed
///
/// Skipping unchanged writes keeps a status write from triggering a watch
/// event that triggers another reconcile that writes the status again.
pub async fn update(
    store: &dyn StatusStore<WebApp>,
    parent: &WebApp,
    deployment: &Deployment,
) -> Result<StatusOutcome, StoreError> {
    let available = available_replicas(deployment);
    let key = ObjectKey::from_resource(parent);

    let outcome = if parent.status.as_ref().map(|s| s.available_replicas) == Some(available) {
        debug!(key = %key, available, "Status unchanged");
        StatusOutcome::Unchanged
    } else {
        let mut updated = parent.clone();
        updated.status = Some(WebAppStatus {
            available_replicas: available,
        });

        match store.replace_status(&updated).await {
            Ok(_) => {
                info!(key = %key, available, "Updated WebApp status");
                StatusOutcome::Updated
            }
            Err(StoreError::Conflict { .. }) => {
                debug!(key = %key, "WebApp changed while writing status");
                StatusOutcome::Conflict
            }
            Err(e) => return Err(e),
        }
    };

    metrics::STATUS_UPDATES
        .with_label_values(&[outcome.as_str()])
        .inc();

    Ok(outcome)
}
