//! Custom Resource Definitions for the Database Operator

mod managed_database;

pub use managed_database::*;

use kube::CustomResourceExt;

/// Generate all CRD YAML manifests
pub fn generate_crds() -> Vec<String> {
    vec![serde_yaml::to_string(&ManagedDatabase::crd()).unwrap()]
}
