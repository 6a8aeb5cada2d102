//! StorageVersionMigration controller
//!
//! Watches StorageVersionMigration resources and runs one migration at a time.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::{
    api::ListParams,
    runtime::{
        controller::{Action, Config as ControllerConfig, Controller},
        watcher::Config as WatcherConfig,
    },
    Api, Client, ResourceExt,
};
use tracing::{error, info, instrument, warn};

use crate::controllers::Context;
use crate::crd::StorageVersionMigration;
use crate::error::{Error, Result};
use crate::metrics;
use crate::reconcilers::migration as migration_reconciler;

const KIND: &str = "StorageVersionMigration";

/// Run the StorageVersionMigration controller
pub async fn run(client: Client, context: Arc<Context>) {
    let api: Api<StorageVersionMigration> = Api::all(client.clone());

    // Verify CRD is installed
    if let Err(e) = api.list(&ListParams::default().limit(1)).await {
        error!("StorageVersionMigration CRD not installed: {}", e);
        return;
    }

    info!("Starting StorageVersionMigration controller");

    // Migrations share the API server's write budget; run them one by one
    Controller::new(api, WatcherConfig::default())
        .with_config(ControllerConfig::default().concurrency(1))
        .shutdown_on_signal()
        .run(reconcile, error_policy, context)
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => {
                    info!(name = %obj.name, "Reconciled StorageVersionMigration");
                }
                Err(e) => {
                    error!(error = %e, "Reconciliation error");
                    metrics::RECONCILIATION_ERRORS.with_label_values(&[KIND]).inc();
                }
            }
        })
        .await;
}

/// Main reconciliation function
#[instrument(skip(ctx), fields(name = %obj.name_any(), resource = %obj.spec.resource))]
async fn reconcile(obj: Arc<StorageVersionMigration>, ctx: Arc<Context>) -> Result<Action> {
    let _timer = metrics::RECONCILE_DURATION
        .with_label_values(&[KIND])
        .start_timer();
    metrics::RECONCILIATIONS.with_label_values(&[KIND]).inc();

    if obj.is_finished() {
        return Ok(Action::await_change());
    }
    if ctx.cancel.is_cancelled() {
        return Ok(Action::await_change());
    }

    if let Err(e) = migration_reconciler::validate(&obj) {
        warn!(error = %e, "Validation failed");
        migration_reconciler::fail_invalid(&obj, &ctx.client, &e).await?;
        return Ok(Action::await_change());
    }

    migration_reconciler::execute(&obj, &ctx).await
}

/// Error policy for the controller
fn error_policy(obj: Arc<StorageVersionMigration>, error: &Error, _ctx: Arc<Context>) -> Action {
    let name = obj.name_any();
    error!(
        name = %name,
        error = %error,
        "Reconciliation failed, scheduling retry"
    );

    let requeue_duration = match error {
        Error::Config(_) | Error::Validation(_) => Duration::from_secs(300),
        Error::Discovery(_) => Duration::from_secs(60),
        _ => Duration::from_secs(30),
    };

    Action::requeue(requeue_duration)
}
