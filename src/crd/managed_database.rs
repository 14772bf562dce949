//! ManagedDatabase Custom Resource Definition

use std::fmt;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// ManagedDatabase resource specification
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "database.example.com",
    version = "v1alpha1",
    kind = "ManagedDatabase",
    plural = "manageddatabases",
    singular = "manageddatabase",
    shortname = "mdb",
    namespaced,
    status = "ManagedDatabaseStatus",
    printcolumn = r#"{"name": "Engine", "type": "string", "jsonPath": ".spec.engine"}"#,
    printcolumn = r#"{"name": "Version", "type": "string", "jsonPath": ".spec.version"}"#,
    printcolumn = r#"{"name": "Storage", "type": "string", "jsonPath": ".spec.storageSize"}"#,
    printcolumn = r#"{"name": "Replicas", "type": "integer", "jsonPath": ".spec.replicas"}"#,
    printcolumn = r#"{"name": "Phase", "type": "string", "jsonPath": ".status.phase"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ManagedDatabaseSpec {
    /// Database engine (postgres, mysql, redis)
    #[schemars(schema_with = "engine_schema")]
    pub engine: String,

    /// Database engine version
    pub version: String,

    /// Size of the persistent volume (e.g., "10Gi")
    #[schemars(regex(pattern = r"^\d+Gi$"))]
    pub storage_size: String,

    /// Number of database pod replicas (1-5)
    #[serde(default = "default_replicas")]
    #[schemars(range(min = 1, max = 5))]
    pub replicas: i32,

    /// StorageClass to use for the persistent volume claim
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,

    /// CPU and memory requests/limits for the database pod
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<DatabaseResources>,

    /// Enable automatic daily backups
    #[serde(default)]
    pub backup_enabled: bool,
}

fn default_replicas() -> i32 {
    1
}

/// Schema for `spec.engine`: the closed set of supported engines.
///
/// The field stays a plain string in the Rust type so the operator can parse
/// defensively; the published schema still rejects anything outside the set.
fn engine_schema(_: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
    schemars::schema::SchemaObject {
        instance_type: Some(schemars::schema::InstanceType::String.into()),
        enum_values: Some(vec!["postgres".into(), "mysql".into(), "redis".into()]),
        ..Default::default()
    }
    .into()
}

/// Resource requests and limits for the database container
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseResources {
    /// CPU request (e.g., "250m")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_request: Option<String>,

    /// CPU limit (e.g., "1")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_limit: Option<String>,

    /// Memory request (e.g., "256Mi")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_request: Option<String>,

    /// Memory limit (e.g., "1Gi")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_limit: Option<String>,
}

/// Supported database engines.
///
/// The CRD schema restricts `spec.engine` to the known values; the operator
/// still parses defensively and maps anything unrecognized to postgres
/// rather than failing the reconciliation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DatabaseEngine {
    Postgres,
    Mysql,
    Redis,
}

impl DatabaseEngine {
    /// Parse an engine name, falling back to postgres for unknown values
    pub fn parse(engine: &str) -> Self {
        match engine {
            "mysql" => DatabaseEngine::Mysql,
            "redis" => DatabaseEngine::Redis,
            _ => DatabaseEngine::Postgres,
        }
    }

    /// Container image reference for this engine at the given version
    pub fn image(&self, version: &str) -> String {
        match self {
            DatabaseEngine::Postgres => format!("postgres:{}-alpine", version),
            DatabaseEngine::Mysql => format!("mysql:{}", version),
            DatabaseEngine::Redis => format!("redis:{}-alpine", version),
        }
    }

    /// Canonical network port for this engine
    pub fn port(&self) -> i32 {
        match self {
            DatabaseEngine::Postgres => 5432,
            DatabaseEngine::Mysql => 3306,
            DatabaseEngine::Redis => 6379,
        }
    }
}

impl fmt::Display for DatabaseEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatabaseEngine::Postgres => write!(f, "postgres"),
            DatabaseEngine::Mysql => write!(f, "mysql"),
            DatabaseEngine::Redis => write!(f, "redis"),
        }
    }
}

/// Lifecycle phase of a ManagedDatabase
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum DatabasePhase {
    /// Child resources are being created
    Provisioning,
    /// All child resources converged without error
    Running,
    /// A convergence step errored; retried with backoff
    Failed,
    /// Deletion requested, storage cleanup in progress
    Terminating,
}

impl fmt::Display for DatabasePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatabasePhase::Provisioning => write!(f, "Provisioning"),
            DatabasePhase::Running => write!(f, "Running"),
            DatabasePhase::Failed => write!(f, "Failed"),
            DatabasePhase::Terminating => write!(f, "Terminating"),
        }
    }
}

/// ManagedDatabase status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ManagedDatabaseStatus {
    /// Current lifecycle phase
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<DatabasePhase>,

    /// Number of ready database pod replicas
    #[serde(default)]
    pub ready_replicas: i32,

    /// Whether the persistent volume claim has been created
    #[serde(default)]
    pub storage_provisioned: bool,

    /// Service endpoint for connecting to the database
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Timestamp of the last successful reconciliation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_reconcile_time: Option<DateTime<Utc>>,

    /// Observed generation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Latest observations of the database state
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// Status condition
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type
    #[serde(rename = "type")]
    pub type_: String,

    /// Status (True, False, Unknown)
    pub status: String,

    /// Last transition time
    pub last_transition_time: DateTime<Utc>,

    /// Reason for the condition
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Human-readable message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_parse_known_values() {
        assert_eq!(DatabaseEngine::parse("postgres"), DatabaseEngine::Postgres);
        assert_eq!(DatabaseEngine::parse("mysql"), DatabaseEngine::Mysql);
        assert_eq!(DatabaseEngine::parse("redis"), DatabaseEngine::Redis);
    }

    #[test]
    fn engine_parse_unknown_falls_back_to_postgres() {
        assert_eq!(DatabaseEngine::parse("cassandra"), DatabaseEngine::Postgres);
        assert_eq!(DatabaseEngine::parse(""), DatabaseEngine::Postgres);
    }

    #[test]
    fn engine_image_and_port_mapping() {
        assert_eq!(DatabaseEngine::Postgres.image("16"), "postgres:16-alpine");
        assert_eq!(DatabaseEngine::Mysql.image("8"), "mysql:8");
        assert_eq!(DatabaseEngine::Redis.image("7"), "redis:7-alpine");
        assert_eq!(DatabaseEngine::Postgres.port(), 5432);
        assert_eq!(DatabaseEngine::Mysql.port(), 3306);
        assert_eq!(DatabaseEngine::Redis.port(), 6379);
    }

    #[test]
    fn crd_schema_carries_declared_constraints() {
        use kube::CustomResourceExt;

        let crd = serde_json::to_value(ManagedDatabase::crd()).unwrap();
        let spec_props = &crd["spec"]["versions"][0]["schema"]["openAPIV3Schema"]["properties"]
            ["spec"]["properties"];

        assert_eq!(
            spec_props["engine"]["enum"],
            serde_json::json!(["postgres", "mysql", "redis"])
        );
        assert_eq!(spec_props["storageSize"]["pattern"], r"^\d+Gi$");
        assert_eq!(spec_props["replicas"]["minimum"], serde_json::json!(1.0));
        assert_eq!(spec_props["replicas"]["maximum"], serde_json::json!(5.0));
    }

    #[test]
    fn phase_serializes_as_plain_string() {
        let json = serde_json::to_string(&DatabasePhase::Provisioning).unwrap();
        assert_eq!(json, "\"Provisioning\"");
        assert_eq!(DatabasePhase::Running.to_string(), "Running");
    }
}
