//! StorageVersionMigration reconciler
//!
//! Handles the business logic for one migration object:
//! - Spec validation
//! - Running the engine for the requested resource type
//! - Status updates
//! - Creating migrations for every eligible type (`launch`)

use std::collections::BTreeSet;
use std::slice;
use std::sync::Arc;

use kube::{
    api::{ListParams, Patch, PatchParams, PostParams},
    runtime::controller::Action,
    Api, Client, ResourceExt,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::adapters::{KubeDiscovery, KubeResourceClient, MigrationProgressStore};
use crate::controllers::Context;
use crate::crd::{
    with_condition, StorageVersionMigration, StorageVersionMigrationSpec, CONDITION_FAILED,
    CONDITION_RUNNING, CONDITION_SUCCEEDED,
};
use crate::error::{Error, Result};
use crate::migrator::{
    pause, Backoff, BackoffConfig, EligibilityFilter, MigrationReport, Migrator, ProgressTracker,
    ResourceTypeRef,
};

const FIELD_MANAGER: &str = "storage-version-migrator";

/// Attempts for one status write
const STATUS_UPDATE_ATTEMPTS: u32 = 6;

/// Errors quoted in a Failed condition message
const MAX_REPORTED_ERRORS: usize = 3;

/// Validate the StorageVersionMigration spec
pub fn validate(migration: &StorageVersionMigration) -> Result<()> {
    let resource = &migration.spec.resource;

    if resource.version.is_empty() {
        return Err(Error::validation("spec.resource.version must be set"));
    }
    if resource.resource.is_empty() {
        return Err(Error::validation("spec.resource.resource must be set"));
    }
    if resource.resource.contains('/') {
        return Err(Error::validation(format!(
            "subresource '{}' cannot be migrated",
            resource.resource
        )));
    }

    Ok(())
}

/// Migrate the resource type named by `migration`
pub async fn execute(migration: &StorageVersionMigration, ctx: &Context) -> Result<Action> {
    let name = migration.name_any();
    let resource = migration.spec.resource.clone();

    info!(name = %name, resource = %resource, "Starting storage migration");
    update_status(&ctx.client, &name, CONDITION_RUNNING, None, None).await?;

    let migrator = Migrator::new(
        Arc::new(KubeDiscovery::new(ctx.client.clone())),
        Arc::new(KubeResourceClient::new(ctx.client.clone())),
        ProgressTracker::new(Arc::new(MigrationProgressStore::new(ctx.client.clone(), &name))),
        ctx.config.clone(),
    );
    let report = migrator
        .migrate_resources(slice::from_ref(&resource), &ctx.cancel)
        .await;

    // Stay Running; the next leader resumes from the stored token
    if ctx.cancel.is_cancelled() {
        warn!(name = %name, "Migration interrupted by shutdown");
        return Ok(Action::await_change());
    }

    let counts = Counts::from(&report);
    if report.is_success() {
        info!(name = %name, migrated = counts.migrated, "Storage migration succeeded");
        let message = format!("migrated {} objects", counts.migrated);
        update_status(&ctx.client, &name, CONDITION_SUCCEEDED, Some(message), Some(counts)).await?;
    } else {
        error!(name = %name, failed = counts.failed, "Storage migration failed");
        update_status(&ctx.client, &name, CONDITION_FAILED, Some(failure_message(&report)), Some(counts))
            .await?;
    }

    Ok(Action::await_change())
}

/// Mark a migration whose spec is unusable as Failed
pub async fn fail_invalid(migration: &StorageVersionMigration, client: &Client, error: &Error) -> Result<()> {
    update_status(
        client,
        &migration.name_any(),
        CONDITION_FAILED,
        Some(error.to_string()),
        None,
    )
    .await
}

/// Object counts written to the status
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Counts {
    pub migrated: u64,
    pub failed: u64,
}

impl From<&MigrationReport> for Counts {
    fn from(report: &MigrationReport) -> Self {
        let mut counts = Counts::default();
        for item in &report.items {
            if item.is_error() {
                counts.failed += 1;
            } else if item.object.is_some() && !item.skipped {
                counts.migrated += 1;
            }
        }
        counts
    }
}

fn failure_message(report: &MigrationReport) -> String {
    let errors: Vec<_> = report.errors().collect();
    let quoted: Vec<String> = errors
        .iter()
        .take(MAX_REPORTED_ERRORS)
        .map(|item| match &item.object {
            Some(object) => format!("{}: {}", object, item.error.as_deref().unwrap_or_default()),
            None => item.error.clone().unwrap_or_default(),
        })
        .collect();

    let mut message = format!("{} errors: {}", errors.len(), quoted.join("; "));
    if errors.len() > MAX_REPORTED_ERRORS {
        message.push_str("; ...");
    }
    message
}

/// Set `condition` as the migration's phase.
///
/// Conditions owned by other writers are kept, so every attempt reads the
/// current object first. Any failure is retried with backoff.
pub async fn update_status(
    client: &Client,
    name: &str,
    condition: &str,
    message: Option<String>,
    counts: Option<Counts>,
) -> Result<()> {
    let api: Api<StorageVersionMigration> = Api::all(client.clone());
    let mut backoff = Backoff::new(&BackoffConfig {
        initial_delay_ms: 10,
        max_delay_ms: 10_000,
        multiplier: 5.0,
    });
    let never = CancellationToken::new();

    let mut attempt = 1;
    loop {
        match try_update_status(&api, name, condition, message.clone(), counts).await {
            Ok(()) => return Ok(()),
            Err(e) if attempt < STATUS_UPDATE_ATTEMPTS => {
                debug!(name = %name, attempt, error = %e, "Status update failed, retrying");
                pause(backoff.step(), &never).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn try_update_status(
    api: &Api<StorageVersionMigration>,
    name: &str,
    condition: &str,
    message: Option<String>,
    counts: Option<Counts>,
) -> Result<()> {
    let current = api.get_status(name).await?;
    let existing = current
        .status
        .as_ref()
        .map(|s| s.conditions.as_slice())
        .unwrap_or_default();

    let mut status = json!({
        "conditions": with_condition(existing, condition, message),
    });
    if let Some(counts) = counts {
        status["objectsMigrated"] = json!(counts.migrated);
        status["objectsFailed"] = json!(counts.failed);
    }

    api.patch_status(
        name,
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(json!({ "status": status })),
    )
    .await?;
    Ok(())
}

/// Create a migration for every eligible resource type that has no
/// unfinished one. Returns the names of the created objects.
pub async fn launch_migrations(client: &Client, filter: &EligibilityFilter) -> Result<Vec<String>> {
    let eligible = filter.discover(&KubeDiscovery::new(client.clone())).await?;

    let api: Api<StorageVersionMigration> = Api::all(client.clone());
    let existing = api.list(&ListParams::default()).await?;
    let pending: BTreeSet<String> = existing
        .items
        .iter()
        .filter(|m| !m.is_finished())
        .map(|m| m.spec.resource.group_resource())
        .collect();

    let mut created = Vec::new();
    for resource in eligible {
        if pending.contains(&resource.group_resource()) {
            debug!(resource = %resource, "Migration already pending, skipping");
            continue;
        }

        let migration = api
            .create(&PostParams::default(), &new_migration(resource.clone()))
            .await?;
        let name = migration.name_any();
        info!(name = %name, resource = %resource, "Created storage migration");
        created.push(name);
    }

    Ok(created)
}

fn new_migration(resource: ResourceTypeRef) -> StorageVersionMigration {
    let mut migration = StorageVersionMigration::new("", StorageVersionMigrationSpec { resource });
    migration.metadata.name = None;
    migration.metadata.generate_name = Some(format!("{}-", migration.spec.resource.group_resource()));
    migration
}
