//! WebApp Kubernetes Operator
//!
//! Main entry point for the operator. Sets up the Kubernetes client,
//! runs the WebApp controller, and serves metrics.

use std::sync::Arc;

use kube::Client;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use webapp_operator::{
    config::OperatorConfig,
    controllers::{self, Context},
    metrics,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    init_tracing();

    info!("Starting WebApp Operator");

    let config = OperatorConfig::from_env()?;
    let metrics_port = config.metrics_port;

    // Create Kubernetes client
    let client = Client::try_default().await?;
    info!("Connected to Kubernetes API server");

    // Create shared context
    let context = Arc::new(Context::new(client, config));

    // Start metrics server
    let metrics_handle = tokio::spawn(metrics::serve(metrics_port));
    info!("Metrics server starting on port {}", metrics_port);

    // The controller drains in-flight reconciles on SIGTERM or SIGINT
    tokio::select! {
        result = controllers::run_webapp_controller(context) => {
            if let Err(e) = result {
                error!(error = %e, "WebApp controller failed");
                return Err(e.into());
            }
        }
        _ = metrics_handle => {
            error!("Metrics server exited unexpectedly");
        }
    }

    info!("WebApp Operator stopped");
    Ok(())
}

/// Initialize tracing subscriber
fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,kube=warn,hyper=warn"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}
