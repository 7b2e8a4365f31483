//! WebApp controller
//!
//! Watches WebApps and the Deployments and Services they own, and runs the
//! reconcile engine for the owning WebApp. Delivery can be late, duplicated
//! or lost; the periodic requeue covers whatever the watches miss.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use kube::{
    api::ListParams,
    runtime::{
        controller::{self, Action, Controller},
        watcher,
    },
    Api, ResourceExt,
};
use tracing::{debug, error, info, instrument, warn};

use super::Context;
use crate::crd::WebApp;
use crate::error::{Error, Result};
use crate::metrics;
use crate::reconcilers::desired::APP_LABEL;
use crate::reconcilers::Outcome;
use crate::store::ObjectKey;

/// Run the WebApp controller until SIGTERM or SIGINT
pub async fn run(ctx: Arc<Context>) -> Result<()> {
    let webapps: Api<WebApp> = ctx.api();

    // Verify CRD is installed
    if let Err(e) = webapps.list(&ListParams::default().limit(1)).await {
        error!("WebApp CRD not installed: {}", e);
        return Err(Error::Kube(e));
    }

    info!(
        namespace = ctx.config.watch_namespace.as_deref().unwrap_or("*"),
        workers = ctx.config.workers,
        "Starting WebApp controller"
    );

    // Children are labelled, so only labelled objects need watching
    let child_config = watcher::Config::default().labels(APP_LABEL);
    let concurrency = u16::try_from(ctx.config.workers).unwrap_or(u16::MAX);

    metrics::set_ready(true);

    Controller::new(webapps, watcher::Config::default())
        .owns(ctx.api::<Deployment>(), child_config.clone())
        .owns(ctx.api::<Service>(), child_config)
        .with_config(controller::Config::default().concurrency(concurrency))
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx.clone())
        .for_each(|result| async move {
            match result {
                Ok((obj, action)) => {
                    debug!(
                        name = %obj.name,
                        namespace = obj.namespace.as_deref().unwrap_or("default"),
                        action = ?action,
                        "Reconciled WebApp"
                    );
                }
                Err(controller::Error::ReconcilerFailed(e, obj)) => {
                    warn!(name = %obj.name, error = %e, "WebApp waits for a change");
                }
                Err(e) => {
                    warn!(error = %e, "WebApp controller error");
                }
            }
        })
        .await;

    metrics::set_ready(false);
    info!("WebApp controller stopped");
    Ok(())
}

/// Run one engine pass for the WebApp behind `obj`
///
/// Fatal failures are returned as errors so the controller reports them;
/// everything else becomes a requeue decision.
#[instrument(skip(obj, ctx), fields(name = %obj.name_any(), namespace = obj.namespace()))]
async fn reconcile(obj: Arc<WebApp>, ctx: Arc<Context>) -> Result<Action> {
    let key = ObjectKey::from_resource(obj.as_ref());
    let outcome = ctx.engine.reconcile(&key).await;
    let action = requeue_action(&outcome);

    match outcome {
        Outcome::Failed(error) => Err(error),
        _ => Ok(action),
    }
}

/// Only fatal failures reach here; they wait for the WebApp to change
fn error_policy(obj: Arc<WebApp>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        name = %obj.name_any(),
        error = %error,
        "Reconciliation failed, waiting for a change"
    );
    Action::await_change()
}

/// Translate a pass outcome into a controller action
pub fn requeue_action(outcome: &Outcome) -> Action {
    match outcome {
        Outcome::Converged(after) => Action::requeue(*after),
        Outcome::RetryNow => Action::requeue(Duration::ZERO),
        Outcome::Backoff { delay, .. } => Action::requeue(*delay),
        Outcome::Deleted | Outcome::Failed(_) => Action::await_change(),
    }
}
