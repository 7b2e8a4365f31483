//! WebApp reconcile engine
//!
//! One pass per key: fetch the parent, build the desired children, ensure the
//! Deployment then the Service, write the status, and decide when the key
//! should be looked at again. Passes keep no state between runs, so duplicate
//! or out-of-order triggers for a key are harmless.

use std::time::Duration;

use tracing::{debug, error, info, instrument, warn};

use super::backoff::Backoff;
use super::children;
use super::desired;
use super::status::{self, StatusOutcome};
use crate::config::OperatorConfig;
use crate::error::{Error, ErrorClass, Result};
use crate::metrics;
use crate::store::{ObjectKey, ObjectStore, Stores};

/// Interval after which a converged WebApp is verified again
pub const REVERIFY_INTERVAL: Duration = Duration::from_secs(300);

const KIND: &str = "WebApp";

/// What the controller should do with a key after a pass
#[derive(Debug)]
pub enum Outcome {
    /// Children exist and match; verify again after the delay
    Converged(Duration),
    /// The parent is gone; children are left to the garbage collector
    Deleted,
    /// Something changed under the pass; run it again right away
    RetryNow,
    /// Transient failure; retry after `delay`
    Backoff { delay: Duration, error: Error },
    /// Fatal failure; wait for the resource to change
    Failed(Error),
}

/// Result of a pass that did not fail
enum Pass {
    Deleted,
    Converged,
    StatusConflict,
}

/// Drives WebApps toward their desired children
pub struct ReconcileEngine {
    stores: Stores,
    timeout: Duration,
    backoff: Backoff,
}

impl ReconcileEngine {
    pub fn new(stores: Stores, config: &OperatorConfig) -> Self {
        Self {
            stores,
            timeout: config.reconcile_timeout,
            backoff: Backoff::new(config.backoff_base, config.backoff_max),
        }
    }

    /// Consecutive transient failures recorded for `key`
    pub fn failures(&self, key: &ObjectKey) -> u32 {
        self.backoff.failures(key)
    }

    /// Run one pass for `key` under the configured deadline
    #[instrument(skip_all, fields(namespace = %key.namespace, name = %key.name))]
    pub async fn reconcile(&self, key: &ObjectKey) -> Outcome {
        let _timer = metrics::RECONCILE_DURATION
            .with_label_values(&[KIND])
            .start_timer();
        metrics::RECONCILIATIONS.with_label_values(&[KIND]).inc();

        let result = match tokio::time::timeout(self.timeout, self.run_pass(key)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout {
                key: key.to_string(),
                timeout: self.timeout,
            }),
        };

        self.decide(key, result)
    }

    async fn run_pass(&self, key: &ObjectKey) -> Result<Pass> {
        let parent = match self.stores.webapps.get(key).await {
            Ok(parent) => parent,
            Err(e) if e.is_not_found() => return Ok(Pass::Deleted),
            Err(e) => return Err(e.into()),
        };

        debug!(
            replicas = parent.spec.replicas,
            image = %parent.spec.image,
            port = parent.spec.port,
            "Reconciling WebApp"
        );

        desired::validate(&parent)?;
        let desired = desired::build(&parent);

        // Status is only written once both children are known to exist
        let deployment =
            children::ensure(self.stores.deployments.as_ref(), &desired.deployment).await?;
        children::ensure(self.stores.services.as_ref(), &desired.service).await?;

        match status::update(self.stores.webapps.as_ref(), &parent, &deployment.object).await? {
            StatusOutcome::Conflict => Ok(Pass::StatusConflict),
            StatusOutcome::Updated | StatusOutcome::Unchanged => Ok(Pass::Converged),
        }
    }

    fn decide(&self, key: &ObjectKey, result: Result<Pass>) -> Outcome {
        let error = match result {
            Ok(Pass::Deleted) => {
                info!("WebApp no longer exists, nothing to reconcile");
                self.backoff.reset(key);
                return Outcome::Deleted;
            }
            Ok(Pass::Converged) => {
                self.backoff.reset(key);
                return Outcome::Converged(REVERIFY_INTERVAL);
            }
            Ok(Pass::StatusConflict) => return Outcome::RetryNow,
            Err(error) => error,
        };

        let class = error.class();
        metrics::RECONCILIATION_ERRORS
            .with_label_values(&[KIND, class.as_str()])
            .inc();

        match class {
            // A child vanished or appeared between two calls; the state
            // moved under the pass just like a version conflict
            ErrorClass::Conflict | ErrorClass::Benign => {
                debug!(error = %error, "Concurrent modification, retrying now");
                Outcome::RetryNow
            }
            ErrorClass::Transient => {
                let delay = self.backoff.next_delay(key);
                warn!(
                    error = %error,
                    delay_secs = delay.as_secs_f64(),
                    failures = self.backoff.failures(key),
                    "Reconciliation failed, scheduling retry"
                );
                Outcome::Backoff { delay, error }
            }
            ErrorClass::Fatal => {
                error!(error = %error, "Reconciliation failed permanently");
                self.backoff.reset(key);
                Outcome::Failed(error)
            }
        }
    }
}
