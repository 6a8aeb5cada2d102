//! Reconcilers for StorageVersionMigration objects
//!
//! Reconcilers are responsible for:
//! - Validating migration specs
//! - Running the migration engine
//! - Updating resource status

pub mod migration;
