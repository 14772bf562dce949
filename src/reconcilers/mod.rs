//! Reconcilers for the Database Operator CRDs
//!
//! This module contains the business logic for reconciling each CRD type.
//! Reconcilers are responsible for:
//! - Validating CRD specs
//! - Converging child resources to desired state
//! - Cleaning up storage on deletion
//! - Updating resource status

pub mod database;
