//! Kubernetes controllers for StorageVersionMigration objects
//!
//! This module contains the controller that watches migration requests and
//! triggers reconciliation.

mod migration_controller;

pub use migration_controller::run as run_migration_controller;

use kube::Client;
use tokio_util::sync::CancellationToken;

use crate::migrator::MigratorConfig;

/// Shared context for the controller
pub struct Context {
    /// Kubernetes client
    pub client: Client,

    /// Settings for every migration the controller runs
    pub config: MigratorConfig,

    /// Cancelled on shutdown; stops the migration in progress
    pub cancel: CancellationToken,
}

impl Context {
    /// Create a new context
    pub fn new(client: Client, config: MigratorConfig, cancel: CancellationToken) -> Self {
        Self {
            client,
            config,
            cancel,
        }
    }
}
