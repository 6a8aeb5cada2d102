//! StorageVersionMigration Custom Resource Definition

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::migrator::ResourceTypeRef;

/// Condition types owned by the migration controller
pub const CONDITION_RUNNING: &str = "Running";
pub const CONDITION_SUCCEEDED: &str = "Succeeded";
pub const CONDITION_FAILED: &str = "Failed";

/// Requests the migration of every stored object of one resource type
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "migration.k8s.io",
    version = "v1alpha1",
    kind = "StorageVersionMigration",
    plural = "storageversionmigrations",
    singular = "storageversionmigration",
    shortname = "svm",
    status = "StorageVersionMigrationStatus",
    printcolumn = r#"{"name": "Resource", "type": "string", "jsonPath": ".spec.resource.resource"}"#,
    printcolumn = r#"{"name": "Group", "type": "string", "jsonPath": ".spec.resource.group"}"#,
    printcolumn = r#"{"name": "Migrated", "type": "integer", "jsonPath": ".status.objectsMigrated"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct StorageVersionMigrationSpec {
    /// Resource type to migrate
    pub resource: ResourceTypeRef,
}

/// StorageVersionMigration status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageVersionMigrationStatus {
    /// Continue token of the last fully migrated page
    #[serde(skip_serializing_if = "Option::is_none")]
    pub continue_token: Option<String>,

    /// Objects rewritten in the last attempt
    #[serde(skip_serializing_if = "Option::is_none")]
    pub objects_migrated: Option<u64>,

    /// Objects that failed in the last attempt
    #[serde(skip_serializing_if = "Option::is_none")]
    pub objects_failed: Option<u64>,

    /// Status conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<MigrationCondition>,
}

/// Status condition
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MigrationCondition {
    /// Condition type (Running, Succeeded, Failed)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status (True, False, Unknown)
    pub status: String,

    /// Last time the condition was written
    pub last_update_time: DateTime<Utc>,

    /// Human-readable message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StorageVersionMigration {
    /// Whether a condition of this type is currently True
    pub fn has_condition(&self, type_: &str) -> bool {
        self.status
            .as_ref()
            .map(|s| {
                s.conditions
                    .iter()
                    .any(|c| c.type_ == type_ && c.status == "True")
            })
            .unwrap_or(false)
    }

    /// Finished one way or the other
    pub fn is_finished(&self) -> bool {
        self.has_condition(CONDITION_SUCCEEDED) || self.has_condition(CONDITION_FAILED)
    }
}

/// Replace the controller's own conditions with `condition`, keeping any
/// condition types written by others.
pub fn with_condition(
    existing: &[MigrationCondition],
    type_: &str,
    message: Option<String>,
) -> Vec<MigrationCondition> {
    let mut conditions: Vec<MigrationCondition> = existing
        .iter()
        .filter(|c| {
            !matches!(
                c.type_.as_str(),
                CONDITION_RUNNING | CONDITION_SUCCEEDED | CONDITION_FAILED
            )
        })
        .cloned()
        .collect();
    conditions.push(MigrationCondition {
        type_: type_.to_string(),
        status: "True".to_string(),
        last_update_time: Utc::now(),
        message,
    });
    conditions
}
