//! ManagedDatabase reconciler
//!
//! Business logic for driving a ManagedDatabase to its declared state:
//! - Spec validation
//! - Idempotent convergence of the child resources (claim, workload, service)
//! - Explicit storage cleanup on deletion
//! - Status phase updates
//!
//! Convergence runs storage first (the workload's volume depends on it), then
//! the workload, then the service endpoint. A failure aborts the remaining
//! steps; already-converged children keep their state and the whole pass is
//! retried from the top on the next reconciliation.

use chrono::Utc;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Service};
use kube::{
    api::{DeleteParams, Patch, PatchParams, PostParams},
    Api, Client, ResourceExt,
};
use serde_json::json;
use tracing::{info, warn};

use crate::crd::{DatabasePhase, ManagedDatabase};
use crate::error::{Error, Result};
use crate::metrics;
use crate::resources::{self, DesiredState};

/// Field manager name used for all patches issued by this operator
const FIELD_MANAGER: &str = "database-operator";

/// Outcome of one convergence step for one child kind
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Convergence {
    /// The child did not exist and was created
    Created,
    /// The child diverged from desired state and was updated
    Updated,
    /// The child already matched desired state
    Unchanged,
}

impl Convergence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Convergence::Created => "created",
            Convergence::Updated => "updated",
            Convergence::Unchanged => "unchanged",
        }
    }
}

/// Result of a full convergence pass across all child kinds
#[derive(Clone, Copy, Debug)]
pub struct ConvergeSummary {
    pub storage: Convergence,
    pub workload: Convergence,
    pub endpoint: Convergence,
    /// Ready replicas observed on the workload during the pass
    pub ready_replicas: i32,
}

/// Validate the ManagedDatabase spec
///
/// The CRD schema enforces these constraints too; re-checking keeps a bad
/// object from looping through the API. An unrecognized engine is not an
/// error here: the resolver maps it to the postgres default.
pub fn validate(db: &ManagedDatabase) -> Result<()> {
    if db.spec.version.is_empty() {
        return Err(Error::validation("Engine version must not be empty"));
    }

    if !(1..=5).contains(&db.spec.replicas) {
        return Err(Error::validation(format!(
            "Invalid replica count {}: must be between 1 and 5",
            db.spec.replicas
        )));
    }

    if !is_valid_storage_size(&db.spec.storage_size) {
        return Err(Error::validation(format!(
            "Invalid storage size '{}': must be digits followed by Gi (e.g. \"10Gi\")",
            db.spec.storage_size
        )));
    }

    Ok(())
}

/// Storage sizes are digits followed by the Gi unit
fn is_valid_storage_size(size: &str) -> bool {
    match size.strip_suffix("Gi") {
        Some(digits) => !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()),
        None => false,
    }
}

/// Run one convergence pass over all child kinds, in dependency order
pub async fn converge(
    db: &ManagedDatabase,
    client: &Client,
    namespace: &str,
) -> Result<ConvergeSummary> {
    let desired = DesiredState::resolve(db);

    let storage = converge_storage(client, namespace, &desired.storage).await?;
    record_convergence("pvc", storage);

    let (workload, ready_replicas) = converge_workload(client, namespace, &desired.workload).await?;
    record_convergence("deployment", workload);

    let endpoint = converge_endpoint(client, namespace, &desired.endpoint).await?;
    record_convergence("service", endpoint);

    Ok(ConvergeSummary {
        storage,
        workload,
        endpoint,
        ready_replicas,
    })
}

fn record_convergence(kind: &str, outcome: Convergence) {
    metrics::CONVERGENCE_OPERATIONS
        .with_label_values(&[kind, outcome.as_str()])
        .inc();
}

/// Converge the persistent volume claim
///
/// Presence alone counts as converged: storage size and class are treated as
/// immutable after creation.
async fn converge_storage(
    client: &Client,
    namespace: &str,
    desired: &PersistentVolumeClaim,
) -> Result<Convergence> {
    let api: Api<PersistentVolumeClaim> = Api::namespaced(client.clone(), namespace);
    let name = desired.name_any();

    match api.get(&name).await {
        Ok(_) => Ok(Convergence::Unchanged),
        Err(kube::Error::Api(ae)) if ae.code == 404 => {
            info!(pvc = %name, "Creating persistent volume claim");
            api.create(&PostParams::default(), desired).await?;
            Ok(Convergence::Created)
        }
        Err(e) => Err(e.into()),
    }
}

/// Converge the database workload
///
/// Mutable desired-state fields (replica count, pod template) are overwritten
/// on divergence; name and selector are left untouched. Returns the ready
/// replica count observed on the existing workload.
async fn converge_workload(
    client: &Client,
    namespace: &str,
    desired: &Deployment,
) -> Result<(Convergence, i32)> {
    let api: Api<Deployment> = Api::namespaced(client.clone(), namespace);
    let name = desired.name_any();

    match api.get(&name).await {
        Ok(mut existing) => {
            let ready_replicas = existing
                .status
                .as_ref()
                .and_then(|s| s.ready_replicas)
                .unwrap_or(0);

            if workload_converged(&existing, desired) {
                return Ok((Convergence::Unchanged, ready_replicas));
            }

            if let (Some(current), Some(target)) = (existing.spec.as_mut(), desired.spec.as_ref())
            {
                current.replicas = target.replicas;
                current.template = target.template.clone();
            }
            info!(deployment = %name, "Updating workload to match desired state");
            api.replace(&name, &PostParams::default(), &existing).await?;
            Ok((Convergence::Updated, ready_replicas))
        }
        Err(kube::Error::Api(ae)) if ae.code == 404 => {
            info!(deployment = %name, "Creating workload");
            api.create(&PostParams::default(), desired).await?;
            Ok((Convergence::Created, 0))
        }
        Err(e) => Err(e.into()),
    }
}

/// Compare the fields this operator drives on the workload.
///
/// The fetched object carries server-applied defaults, so whole-template
/// equality would never hold; only replica count, container image, and
/// container resources are compared.
fn workload_converged(existing: &Deployment, desired: &Deployment) -> bool {
    let (Some(current), Some(target)) = (existing.spec.as_ref(), desired.spec.as_ref()) else {
        return false;
    };

    if current.replicas != target.replicas {
        return false;
    }

    let current_container = current.template.spec.as_ref().and_then(|p| p.containers.first());
    let target_container = target.template.spec.as_ref().and_then(|p| p.containers.first());

    match (current_container, target_container) {
        (Some(c), Some(t)) => c.image == t.image && c.resources == t.resources,
        _ => false,
    }
}

/// Converge the service endpoint
///
/// Presence alone counts as converged: the port is immutable after creation.
async fn converge_endpoint(
    client: &Client,
    namespace: &str,
    desired: &Service,
) -> Result<Convergence> {
    let api: Api<Service> = Api::namespaced(client.clone(), namespace);
    let name = desired.name_any();

    match api.get(&name).await {
        Ok(_) => Ok(Convergence::Unchanged),
        Err(kube::Error::Api(ae)) if ae.code == 404 => {
            info!(service = %name, "Creating service endpoint");
            api.create(&PostParams::default(), desired).await?;
            Ok(Convergence::Created)
        }
        Err(e) => Err(e.into()),
    }
}

/// Delete the storage claim during finalizer cleanup
///
/// The workload and service are garbage-collected through their owner
/// references; the claim is deleted explicitly so a database is never purged
/// with an orphaned volume. An already-absent claim counts as success.
pub async fn delete_storage(db: &ManagedDatabase, client: &Client, namespace: &str) -> Result<()> {
    let api: Api<PersistentVolumeClaim> = Api::namespaced(client.clone(), namespace);
    let name = resources::storage_name(&db.name_any());

    match api.delete(&name, &DeleteParams::default()).await {
        Ok(_) => {
            info!(pvc = %name, "Deleted persistent volume claim");
            Ok(())
        }
        Err(kube::Error::Api(ae)) if ae.code == 404 => {
            info!(pvc = %name, "Persistent volume claim already absent");
            Ok(())
        }
        Err(e) => Err(Error::cleanup(format!("deleting claim {}: {}", name, e))),
    }
}

/// Mark the database as Provisioning (initial phase)
pub async fn update_status_provisioning(
    db: &ManagedDatabase,
    client: &Client,
    namespace: &str,
) -> Result<()> {
    let name = db.name_any();
    let api: Api<ManagedDatabase> = Api::namespaced(client.clone(), namespace);

    let status = json!({
        "status": {
            "phase": DatabasePhase::Provisioning,
            "observedGeneration": db.metadata.generation,
        }
    });

    api.patch_status(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(status))
        .await?;
    Ok(())
}

/// Mark the database as Running and publish the derived status fields
pub async fn update_status_running(
    db: &ManagedDatabase,
    client: &Client,
    namespace: &str,
    summary: &ConvergeSummary,
) -> Result<()> {
    let name = db.name_any();
    let api: Api<ManagedDatabase> = Api::namespaced(client.clone(), namespace);

    let status = json!({
        "status": {
            "phase": DatabasePhase::Running,
            "readyReplicas": summary.ready_replicas,
            "storageProvisioned": true,
            "endpoint": resources::endpoint_address(&name, namespace),
            "lastReconcileTime": Utc::now(),
            "observedGeneration": db.metadata.generation,
            "conditions": [{
                "type": "Ready",
                "status": "True",
                "lastTransitionTime": Utc::now(),
                "reason": "ConvergenceSucceeded",
                "message": "All child resources converged"
            }]
        }
    });

    api.patch_status(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(status))
        .await?;
    Ok(())
}

/// Mark the database as Failed with the triggering error
pub async fn update_status_failed(
    db: &ManagedDatabase,
    client: &Client,
    namespace: &str,
    error_message: &str,
) -> Result<()> {
    let name = db.name_any();
    let api: Api<ManagedDatabase> = Api::namespaced(client.clone(), namespace);

    let status = json!({
        "status": {
            "phase": DatabasePhase::Failed,
            "observedGeneration": db.metadata.generation,
            "conditions": [{
                "type": "Ready",
                "status": "False",
                "lastTransitionTime": Utc::now(),
                "reason": "ConvergenceFailed",
                "message": error_message
            }]
        }
    });

    api.patch_status(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(status))
        .await?;
    Ok(())
}

/// Mark the database as Terminating, best effort
///
/// A failed status write during teardown must not block finalizer cleanup,
/// so the error is logged and swallowed.
pub async fn update_status_terminating(db: &ManagedDatabase, client: &Client, namespace: &str) {
    let name = db.name_any();
    let api: Api<ManagedDatabase> = Api::namespaced(client.clone(), namespace);

    let status = json!({
        "status": {
            "phase": DatabasePhase::Terminating,
        }
    });

    if let Err(e) = api
        .patch_status(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(status))
        .await
    {
        warn!(name = %name, error = %e, "Failed to record Terminating phase, continuing cleanup");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::ManagedDatabaseSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn test_database(replicas: i32) -> ManagedDatabase {
        ManagedDatabase {
            metadata: ObjectMeta {
                name: Some("testdb".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: ManagedDatabaseSpec {
                engine: "postgres".to_string(),
                version: "16".to_string(),
                storage_size: "10Gi".to_string(),
                replicas,
                storage_class: None,
                resources: None,
                backup_enabled: false,
            },
            status: None,
        }
    }

    #[test]
    fn valid_spec_passes_validation() {
        assert!(validate(&test_database(3)).is_ok());
    }

    #[test]
    fn replica_count_out_of_bounds_fails_validation() {
        assert!(validate(&test_database(0)).is_err());
        assert!(validate(&test_database(6)).is_err());
        assert!(validate(&test_database(5)).is_ok());
    }

    #[test]
    fn storage_size_pattern() {
        assert!(is_valid_storage_size("10Gi"));
        assert!(is_valid_storage_size("5Gi"));
        assert!(!is_valid_storage_size("Gi"));
        assert!(!is_valid_storage_size("10"));
        assert!(!is_valid_storage_size("10Mi"));
        assert!(!is_valid_storage_size("ten-Gi"));
    }

    #[test]
    fn unrecognized_engine_is_not_a_validation_error() {
        let mut db = test_database(1);
        db.spec.engine = "cassandra".to_string();
        assert!(validate(&db).is_ok());
    }

    #[test]
    fn workload_converged_when_driven_fields_match() {
        let desired = DesiredState::resolve(&test_database(2)).workload;
        // Simulate the fetched object: same driven fields, extra server state
        let mut existing = desired.clone();
        existing.metadata.resource_version = Some("42".to_string());

        assert!(workload_converged(&existing, &desired));
    }

    #[test]
    fn workload_diverges_on_replica_change() {
        let existing = DesiredState::resolve(&test_database(1)).workload;
        let desired = DesiredState::resolve(&test_database(3)).workload;

        assert!(!workload_converged(&existing, &desired));
    }

    #[test]
    fn workload_diverges_on_image_change() {
        let existing = DesiredState::resolve(&test_database(1)).workload;
        let mut db = test_database(1);
        db.spec.version = "17".to_string();
        let desired = DesiredState::resolve(&db).workload;

        assert!(!workload_converged(&existing, &desired));
    }

    #[test]
    fn convergence_outcome_labels() {
        assert_eq!(Convergence::Created.as_str(), "created");
        assert_eq!(Convergence::Updated.as_str(), "updated");
        assert_eq!(Convergence::Unchanged.as_str(), "unchanged");
    }
}
