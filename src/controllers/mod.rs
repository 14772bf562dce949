//! Kubernetes controllers for the Database Operator CRDs
//!
//! This module contains the controller implementations that watch for CRD
//! changes and trigger reconciliation.

mod database_controller;

pub use database_controller::run as run_database_controller;

use kube::Client;

/// Shared context for all controllers
pub struct Context {
    /// Kubernetes client
    pub client: Client,
}

impl Context {
    /// Create a new context
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}
