use crate::crds::Build;
use crate::resources::BUILD_NAME_LABEL;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::controller::Controller;
use kube::runtime::watcher::Config;
use kube::Api;
use std::sync::Arc;
use tracing::{error, info, instrument, Instrument};

pub mod build;
pub mod config;
pub mod template;
pub mod timeout;
pub mod types;

// Re-export commonly used items
pub use build::{error_policy, reconcile_build};
pub use config::ControllerConfig;
pub use timeout::TimeoutHandler;
pub use types::{Context, Error, ErrorBackoff, Result};

/// Run the `Build` controller until its watch streams end
#[instrument(skip(context), fields(namespace = ?context.config.namespace))]
pub async fn run_build_controller(context: Arc<Context>) -> Result<()> {
    info!("Starting Build controller");

    let client = context.client.clone();
    let (builds, pods): (Api<Build>, Api<Pod>) = match context.config.namespace.as_deref() {
        Some(namespace) => (
            Api::namespaced(client.clone(), namespace),
            Api::namespaced(client, namespace),
        ),
        None => (Api::all(client.clone()), Api::all(client)),
    };

    Controller::new(builds, Config::default().any_semantic())
        .owns(pods, Config::default().labels(BUILD_NAME_LABEL))
        .run(reconcile_build, error_policy, context)
        .for_each(|reconciliation_result| {
            let build_span = tracing::info_span!("build_reconciliation_result");
            async move {
                match reconciliation_result {
                    Ok(build_resource) => {
                        info!(
                            resource = ?build_resource,
                            "Build reconciliation successful"
                        );
                    }
                    Err(reconciliation_err) => {
                        error!(
                            error = ?reconciliation_err,
                            "Build reconciliation error"
                        );
                    }
                }
            }
            .instrument(build_span)
        })
        .await;

    info!("Build controller shutting down");
    Ok(())
}
