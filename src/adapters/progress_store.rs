//! Checkpoints kept in a StorageVersionMigration's status

use async_trait::async_trait;
use kube::api::PostParams;
use kube::{Api, Client};

use crate::adapters::api_error;
use crate::crd::{StorageVersionMigration, StorageVersionMigrationStatus};
use crate::error::{Error, Result};
use crate::migrator::{ContinuationState, ProgressStore, ResourceTypeRef};

/// Progress for the single resource type named by one migration object.
///
/// Writes replace the whole status with the resourceVersion that was read,
/// so a concurrent status writer surfaces as a 409 and the tracker retries.
#[derive(Clone)]
pub struct MigrationProgressStore {
    api: Api<StorageVersionMigration>,
    name: String,
}

impl MigrationProgressStore {
    pub fn new(client: Client, name: impl Into<String>) -> Self {
        Self {
            api: Api::all(client),
            name: name.into(),
        }
    }

    async fn fetch(&self) -> Result<StorageVersionMigration> {
        self.api
            .get(&self.name)
            .await
            .map_err(|e| Error::Api(api_error(e)))
    }

    async fn write_token(&self, mut migration: StorageVersionMigration, token: Option<String>) -> Result<()> {
        let status = migration
            .status
            .get_or_insert_with(StorageVersionMigrationStatus::default);
        if status.continue_token == token {
            return Ok(());
        }
        status.continue_token = token;

        let body = serde_json::to_vec(&migration)?;
        self.api
            .replace_status(&self.name, &PostParams::default(), body)
            .await
            .map_err(|e| Error::Api(api_error(e)))?;
        Ok(())
    }
}

#[async_trait]
impl ProgressStore for MigrationProgressStore {
    async fn load(&self, resource: &ResourceTypeRef) -> Result<Option<ContinuationState>> {
        let migration = self.fetch().await?;
        if migration.spec.resource != *resource {
            return Ok(None);
        }

        Ok(migration
            .status
            .and_then(|s| s.continue_token)
            .filter(|t| !t.is_empty())
            .map(|token| ContinuationState {
                resource_type: Some(resource.clone()),
                token,
                completed: false,
            }))
    }

    async fn save(&self, resource: &ResourceTypeRef, state: &ContinuationState) -> Result<()> {
        let migration = self.fetch().await?;
        if migration.spec.resource != *resource {
            return Err(Error::progress(format!(
                "migration {} covers {}, not {}",
                self.name, migration.spec.resource, resource
            )));
        }

        // Completion is recorded through conditions, not the token
        let token = Some(state.token.clone()).filter(|t| !state.completed && !t.is_empty());
        self.write_token(migration, token).await
    }

    async fn clear(&self) -> Result<()> {
        let migration = self.fetch().await?;
        self.write_token(migration, None).await
    }
}
