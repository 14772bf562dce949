//! ManagedDatabase controller
//!
//! Watches ManagedDatabase resources and their owned children and drives
//! each reconciliation pass: finalizer handling, phase updates, convergence,
//! and the resulting scheduling decision.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Service};
use kube::{
    api::ListParams,
    runtime::{
        controller::{Action, Controller},
        finalizer::{finalizer, Event as FinalizerEvent},
        watcher::Config as WatcherConfig,
    },
    Api, Client, ResourceExt,
};
use tracing::{error, info, instrument, warn};

use crate::controllers::Context;
use crate::crd::ManagedDatabase;
use crate::error::{Error, Result};
use crate::metrics;
use crate::reconcilers::database;

/// Finalizer name guarding explicit storage cleanup
const FINALIZER_NAME: &str = "database.example.com/finalizer";

/// Requeue delay after a failed convergence pass
const ERROR_REQUEUE: Duration = Duration::from_secs(30);

/// Requeue delay after a validation failure; the object cannot converge
/// until its spec changes
const VALIDATION_REQUEUE: Duration = Duration::from_secs(300);

/// Requeue delay after full success, re-asserting convergence against drift
const SUCCESS_REQUEUE: Duration = Duration::from_secs(300);

/// Run the ManagedDatabase controller
pub async fn run(client: Client, context: Arc<Context>) {
    let api: Api<ManagedDatabase> = Api::all(client.clone());

    // Verify CRD is installed
    if let Err(e) = api.list(&ListParams::default().limit(1)).await {
        error!("ManagedDatabase CRD not installed: {}", e);
        return;
    }

    info!("Starting ManagedDatabase controller");

    Controller::new(api, WatcherConfig::default())
        .owns(
            Api::<Deployment>::all(client.clone()),
            WatcherConfig::default(),
        )
        .owns(
            Api::<Service>::all(client.clone()),
            WatcherConfig::default(),
        )
        .owns(
            Api::<PersistentVolumeClaim>::all(client.clone()),
            WatcherConfig::default(),
        )
        .shutdown_on_signal()
        .run(reconcile, error_policy, context)
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => {
                    info!(
                        name = %obj.name,
                        namespace = obj.namespace.as_deref().unwrap_or("default"),
                        "Reconciled ManagedDatabase"
                    );
                }
                Err(e) => {
                    error!(error = %e, "Reconciliation error");
                    metrics::RECONCILIATION_ERRORS
                        .with_label_values(&["ManagedDatabase"])
                        .inc();
                }
            }
        })
        .await;
}

/// Main reconciliation function
#[instrument(skip(ctx), fields(name = %obj.name_any(), namespace = obj.namespace()))]
async fn reconcile(obj: Arc<ManagedDatabase>, ctx: Arc<Context>) -> Result<Action> {
    let _timer = metrics::RECONCILE_DURATION
        .with_label_values(&["ManagedDatabase"])
        .start_timer();
    metrics::RECONCILIATIONS
        .with_label_values(&["ManagedDatabase"])
        .inc();

    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<ManagedDatabase> = Api::namespaced(ctx.client.clone(), &namespace);

    // The finalizer helper adds the marker before apply ever creates a child
    // and removes it only after cleanup succeeds, so the resource is never
    // purged while the storage claim still needs explicit deletion.
    finalizer(&api, FINALIZER_NAME, obj, |event| async {
        match event {
            FinalizerEvent::Apply(db) => apply(db, ctx.clone()).await,
            FinalizerEvent::Cleanup(db) => cleanup(db, ctx.clone()).await,
        }
    })
    .await
    .map_err(|e| Error::Finalizer(Box::new(e)))
}

/// Apply reconciliation (create/update)
async fn apply(db: Arc<ManagedDatabase>, ctx: Arc<Context>) -> Result<Action> {
    let name = db.name_any();
    let namespace = db.namespace().unwrap_or_else(|| "default".to_string());
    let generation = db.metadata.generation.unwrap_or(0);

    info!(
        name = %name,
        namespace = %namespace,
        generation = generation,
        engine = %db.spec.engine,
        "Reconciling ManagedDatabase"
    );

    if let Err(e) = database::validate(&db) {
        warn!(name = %name, error = %e, "Validation failed");
        database::update_status_failed(&db, &ctx.client, &namespace, &e.to_string()).await?;
        return Ok(Action::requeue(VALIDATION_REQUEUE));
    }

    // Initial phase, persisted before any child resource is touched
    if db.status.as_ref().and_then(|s| s.phase).is_none() {
        database::update_status_provisioning(&db, &ctx.client, &namespace).await?;
    }

    match database::converge(&db, &ctx.client, &namespace).await {
        Ok(summary) => {
            database::update_status_running(&db, &ctx.client, &namespace, &summary).await?;
            info!(
                name = %name,
                storage = summary.storage.as_str(),
                workload = summary.workload.as_str(),
                endpoint = summary.endpoint.as_str(),
                "Convergence pass complete"
            );
            Ok(Action::requeue(SUCCESS_REQUEUE))
        }
        Err(e) => {
            error!(name = %name, error = %e, "Convergence failed");
            // The phase write is logged but must not mask the convergence
            // error that drives the retry decision.
            if let Err(status_err) =
                database::update_status_failed(&db, &ctx.client, &namespace, &e.to_string()).await
            {
                warn!(name = %name, error = %status_err, "Failed to record Failed phase");
            }
            Err(e)
        }
    }
}

/// Cleanup when resource is being deleted
///
/// The workload and service are garbage-collected via owner references; only
/// the storage claim needs explicit deletion. A cleanup failure keeps the
/// finalizer in place and the pass is retried.
async fn cleanup(db: Arc<ManagedDatabase>, ctx: Arc<Context>) -> Result<Action> {
    let name = db.name_any();
    let namespace = db.namespace().unwrap_or_else(|| "default".to_string());

    info!(name = %name, namespace = %namespace, "Cleaning up ManagedDatabase");

    database::update_status_terminating(&db, &ctx.client, &namespace).await;
    database::delete_storage(&db, &ctx.client, &namespace).await?;

    metrics::CLEANUPS
        .with_label_values(&["ManagedDatabase"])
        .inc();

    Ok(Action::await_change())
}

/// Error policy for the controller
fn error_policy(obj: Arc<ManagedDatabase>, error: &Error, _ctx: Arc<Context>) -> Action {
    let name = obj.name_any();
    error!(
        name = %name,
        error = %error,
        "Reconciliation failed, scheduling retry"
    );

    Action::requeue(requeue_for(error))
}

/// Retry backoff by error class: API and cleanup errors are transient and
/// retried quickly; a validation failure cannot heal until the spec changes
fn requeue_for(error: &Error) -> Duration {
    match error {
        Error::Kube(_) | Error::Cleanup(_) => ERROR_REQUEUE,
        Error::Validation(_) => VALIDATION_REQUEUE,
        _ => ERROR_REQUEUE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_and_cleanup_errors_retry_quickly() {
        assert_eq!(
            requeue_for(&Error::cleanup("deleting claim mydb-data: timed out")),
            ERROR_REQUEUE
        );
        let serde_err = serde_json::from_str::<i32>("not json").unwrap_err();
        assert_eq!(requeue_for(&Error::Serialization(serde_err)), ERROR_REQUEUE);
    }

    #[test]
    fn validation_errors_back_off_until_spec_changes() {
        assert_eq!(
            requeue_for(&Error::validation("Invalid replica count 0")),
            VALIDATION_REQUEUE
        );
    }
}
