//! Desired-state resolver
//!
//! Pure construction of the child resources (persistent volume claim,
//! deployment, service) a ManagedDatabase declares. No I/O: the resolver is
//! deterministic for identical input, and the convergence engine decides
//! what to do with the result.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeClaimVolumeSource, PodSpec, PodTemplateSpec, ResourceRequirements, Service,
    ServicePort, ServiceSpec, Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{Resource, ResourceExt};

use crate::crd::{DatabaseEngine, ManagedDatabase};

/// Label value identifying resources managed by this operator
pub const MANAGED_BY: &str = "database-operator";

/// Baseline container resources, applied unless the spec overrides them
const DEFAULT_CPU_REQUEST: &str = "250m";
const DEFAULT_CPU_LIMIT: &str = "1";
const DEFAULT_MEMORY_REQUEST: &str = "256Mi";
const DEFAULT_MEMORY_LIMIT: &str = "1Gi";

/// Mount path for the database data volume
const DATA_MOUNT_PATH: &str = "/data";

/// Canonical desired shape of every child resource of a ManagedDatabase
pub struct DesiredState {
    /// Persistent volume claim backing the database data
    pub storage: PersistentVolumeClaim,
    /// Database workload
    pub workload: Deployment,
    /// ClusterIP service fronting the workload
    pub endpoint: Service,
}

impl DesiredState {
    /// Resolve the desired child resources for a ManagedDatabase
    pub fn resolve(db: &ManagedDatabase) -> Self {
        let name = db.name_any();
        let namespace = db.namespace().unwrap_or_else(|| "default".to_string());
        let engine = DatabaseEngine::parse(&db.spec.engine);

        DesiredState {
            storage: storage_claim(db, &name, &namespace),
            workload: workload(db, &name, &namespace, engine),
            endpoint: endpoint(db, &name, &namespace, engine),
        }
    }
}

/// Deterministic name of the storage claim for a database
pub fn storage_name(name: &str) -> String {
    format!("{}-data", name)
}

/// Cluster-internal address the database is reachable at once Running
pub fn endpoint_address(name: &str, namespace: &str) -> String {
    format!("{}.{}.svc.cluster.local", name, namespace)
}

fn labels(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), name.to_string()),
        (
            "app.kubernetes.io/managed-by".to_string(),
            MANAGED_BY.to_string(),
        ),
    ])
}

/// Metadata shared by all child resources, including the controller owner
/// reference back to the parent used for cascade deletion and event routing
fn child_metadata(db: &ManagedDatabase, name: &str, namespace: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        labels: Some(labels(&db.name_any())),
        owner_references: db.controller_owner_ref(&()).map(|oref| vec![oref]),
        ..Default::default()
    }
}

fn storage_claim(db: &ManagedDatabase, name: &str, namespace: &str) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: child_metadata(db, &storage_name(name), namespace),
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: db.spec.storage_class.clone(),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(db.spec.storage_size.clone()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn workload(
    db: &ManagedDatabase,
    name: &str,
    namespace: &str,
    engine: DatabaseEngine,
) -> Deployment {
    Deployment {
        metadata: child_metadata(db, name, namespace),
        spec: Some(DeploymentSpec {
            replicas: Some(db.spec.replicas),
            selector: LabelSelector {
                match_labels: Some(BTreeMap::from([("app".to_string(), name.to_string())])),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels(name)),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: engine.to_string(),
                        image: Some(engine.image(&db.spec.version)),
                        ports: Some(vec![ContainerPort {
                            container_port: engine.port(),
                            ..Default::default()
                        }]),
                        resources: Some(container_resources(db)),
                        volume_mounts: Some(vec![VolumeMount {
                            name: "data".to_string(),
                            mount_path: DATA_MOUNT_PATH.to_string(),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }],
                    volumes: Some(vec![Volume {
                        name: "data".to_string(),
                        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                            claim_name: storage_name(name),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn endpoint(db: &ManagedDatabase, name: &str, namespace: &str, engine: DatabaseEngine) -> Service {
    let port = engine.port();
    Service {
        metadata: child_metadata(db, name, namespace),
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(BTreeMap::from([("app".to_string(), name.to_string())])),
            ports: Some(vec![ServicePort {
                port,
                target_port: Some(IntOrString::Int(port)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Container resources: spec overrides where given, baseline otherwise
fn container_resources(db: &ManagedDatabase) -> ResourceRequirements {
    let overrides = db.spec.resources.as_ref();
    let pick = |value: Option<&String>, default: &str| {
        Quantity(value.cloned().unwrap_or_else(|| default.to_string()))
    };

    ResourceRequirements {
        requests: Some(BTreeMap::from([
            (
                "cpu".to_string(),
                pick(
                    overrides.and_then(|r| r.cpu_request.as_ref()),
                    DEFAULT_CPU_REQUEST,
                ),
            ),
            (
                "memory".to_string(),
                pick(
                    overrides.and_then(|r| r.memory_request.as_ref()),
                    DEFAULT_MEMORY_REQUEST,
                ),
            ),
        ])),
        limits: Some(BTreeMap::from([
            (
                "cpu".to_string(),
                pick(
                    overrides.and_then(|r| r.cpu_limit.as_ref()),
                    DEFAULT_CPU_LIMIT,
                ),
            ),
            (
                "memory".to_string(),
                pick(
                    overrides.and_then(|r| r.memory_limit.as_ref()),
                    DEFAULT_MEMORY_LIMIT,
                ),
            ),
        ])),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{DatabaseResources, ManagedDatabaseSpec};

    fn test_database(engine: &str, version: &str) -> ManagedDatabase {
        ManagedDatabase {
            metadata: ObjectMeta {
                name: Some("testdb".to_string()),
                namespace: Some("prod".to_string()),
                uid: Some("0000-1111".to_string()),
                ..Default::default()
            },
            spec: ManagedDatabaseSpec {
                engine: engine.to_string(),
                version: version.to_string(),
                storage_size: "5Gi".to_string(),
                replicas: 1,
                storage_class: None,
                resources: None,
                backup_enabled: false,
            },
            status: None,
        }
    }

    #[test]
    fn resolve_redis_workload_image_and_port() {
        let desired = DesiredState::resolve(&test_database("redis", "7"));

        let pod_spec = desired.workload.spec.unwrap().template.spec.unwrap();
        let container = &pod_spec.containers[0];
        assert_eq!(container.image.as_deref(), Some("redis:7-alpine"));
        assert_eq!(container.ports.as_ref().unwrap()[0].container_port, 6379);

        let svc_ports = desired.endpoint.spec.unwrap().ports.unwrap();
        assert_eq!(svc_ports[0].port, 6379);
        assert_eq!(svc_ports[0].target_port, Some(IntOrString::Int(6379)));
    }

    #[test]
    fn resolve_unknown_engine_falls_back_to_postgres() {
        let desired = DesiredState::resolve(&test_database("cassandra", "4"));

        let pod_spec = desired.workload.spec.unwrap().template.spec.unwrap();
        let container = &pod_spec.containers[0];
        assert_eq!(container.image.as_deref(), Some("postgres:4-alpine"));
        assert_eq!(container.ports.as_ref().unwrap()[0].container_port, 5432);
    }

    #[test]
    fn resolve_names_are_deterministic() {
        let desired = DesiredState::resolve(&test_database("postgres", "16"));

        assert_eq!(desired.storage.metadata.name.as_deref(), Some("testdb-data"));
        assert_eq!(desired.workload.metadata.name.as_deref(), Some("testdb"));
        assert_eq!(desired.endpoint.metadata.name.as_deref(), Some("testdb"));
    }

    #[test]
    fn resolve_is_deterministic_for_identical_input() {
        let db = test_database("mysql", "8");
        let a = DesiredState::resolve(&db);
        let b = DesiredState::resolve(&db);
        assert_eq!(a.storage, b.storage);
        assert_eq!(a.workload, b.workload);
        assert_eq!(a.endpoint, b.endpoint);
    }

    #[test]
    fn storage_claim_carries_size_and_class() {
        let mut db = test_database("postgres", "16");
        db.spec.storage_class = Some("fast-ssd".to_string());

        let desired = DesiredState::resolve(&db);
        let spec = desired.storage.spec.unwrap();
        assert_eq!(spec.storage_class_name.as_deref(), Some("fast-ssd"));
        let requests = spec.resources.unwrap().requests.unwrap();
        assert_eq!(requests["storage"], Quantity("5Gi".to_string()));
    }

    #[test]
    fn children_carry_owner_reference() {
        let desired = DesiredState::resolve(&test_database("postgres", "16"));

        for meta in [
            &desired.storage.metadata,
            &desired.workload.metadata,
            &desired.endpoint.metadata,
        ] {
            let orefs = meta.owner_references.as_ref().unwrap();
            assert_eq!(orefs.len(), 1);
            assert_eq!(orefs[0].kind, "ManagedDatabase");
            assert_eq!(orefs[0].name, "testdb");
            assert_eq!(orefs[0].controller, Some(true));
        }
    }

    #[test]
    fn baseline_resources_applied_without_overrides() {
        let desired = DesiredState::resolve(&test_database("postgres", "16"));

        let pod_spec = desired.workload.spec.unwrap().template.spec.unwrap();
        let resources = pod_spec.containers[0].resources.as_ref().unwrap();
        let requests = resources.requests.as_ref().unwrap();
        let limits = resources.limits.as_ref().unwrap();
        assert_eq!(requests["cpu"], Quantity("250m".to_string()));
        assert_eq!(requests["memory"], Quantity("256Mi".to_string()));
        assert_eq!(limits["cpu"], Quantity("1".to_string()));
        assert_eq!(limits["memory"], Quantity("1Gi".to_string()));
    }

    #[test]
    fn spec_resource_overrides_replace_baseline() {
        let mut db = test_database("postgres", "16");
        db.spec.resources = Some(DatabaseResources {
            cpu_request: Some("500m".to_string()),
            cpu_limit: None,
            memory_request: None,
            memory_limit: Some("2Gi".to_string()),
        });

        let desired = DesiredState::resolve(&db);
        let pod_spec = desired.workload.spec.unwrap().template.spec.unwrap();
        let resources = pod_spec.containers[0].resources.as_ref().unwrap();
        let requests = resources.requests.as_ref().unwrap();
        let limits = resources.limits.as_ref().unwrap();
        assert_eq!(requests["cpu"], Quantity("500m".to_string()));
        assert_eq!(requests["memory"], Quantity("256Mi".to_string()));
        assert_eq!(limits["cpu"], Quantity("1".to_string()));
        assert_eq!(limits["memory"], Quantity("2Gi".to_string()));
    }

    #[test]
    fn workload_mounts_the_storage_claim() {
        let desired = DesiredState::resolve(&test_database("postgres", "16"));

        let pod_spec = desired.workload.spec.unwrap().template.spec.unwrap();
        let volume = &pod_spec.volumes.as_ref().unwrap()[0];
        assert_eq!(
            volume
                .persistent_volume_claim
                .as_ref()
                .unwrap()
                .claim_name,
            "testdb-data"
        );
        let mount = &pod_spec.containers[0].volume_mounts.as_ref().unwrap()[0];
        assert_eq!(mount.mount_path, "/data");
    }

    #[test]
    fn endpoint_address_format() {
        assert_eq!(
            endpoint_address("testdb", "prod"),
            "testdb.prod.svc.cluster.local"
        );
    }
}
