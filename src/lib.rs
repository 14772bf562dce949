//! Database Operator for Kubernetes
//!
//! This operator manages the lifecycle of database instances declared via
//! the ManagedDatabase Custom Resource Definition: it provisions persistent
//! storage, the database workload, and its service endpoint, and keeps them
//! converged with the declared spec.

pub mod controllers;
pub mod crd;
pub mod error;
pub mod metrics;
pub mod reconcilers;
pub mod resources;

pub use error::{Error, Result};
