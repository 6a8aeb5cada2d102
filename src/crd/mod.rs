//! Custom Resource Definitions for the Storage Version Migrator

mod storage_version_migration;

pub use storage_version_migration::*;

use kube::CustomResourceExt;

use crate::error::Result;

/// Generate all CRD YAML manifests
pub fn generate_crds() -> Result<Vec<String>> {
    Ok(vec![serde_yaml::to_string(&StorageVersionMigration::crd())?])
}
