//! One migration run over all eligible resource types

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{Error, Result};
use crate::metrics;
use crate::migrator::{
    DiscoveryClient, EligibilityFilter, MigrationOutcome, MigrationReport, MigratorConfig, Pager,
    ProgressTracker, ResourceClient, ResourceTypeRef, ResultAggregator, RewritePool,
};

/// Drives discovery, listing, rewriting and checkpointing.
///
/// Resource types are processed one after another, pages within a type one
/// after another; only the rewrites of a single page run concurrently.
pub struct Migrator {
    discovery: Arc<dyn DiscoveryClient>,
    client: Arc<dyn ResourceClient>,
    progress: ProgressTracker,
    filter: EligibilityFilter,
    config: MigratorConfig,
}

impl Migrator {
    pub fn new(
        discovery: Arc<dyn DiscoveryClient>,
        client: Arc<dyn ResourceClient>,
        progress: ProgressTracker,
        config: MigratorConfig,
    ) -> Self {
        Self {
            discovery,
            client,
            progress,
            filter: EligibilityFilter::new(config.eligibility.clone()),
            config,
        }
    }

    /// Resource types this run would migrate
    pub async fn eligible_resources(&self) -> Result<Vec<ResourceTypeRef>> {
        self.filter.discover(self.discovery.as_ref()).await
    }

    /// Full run. Only a discovery failure is returned as an error; every
    /// data-plane problem ends up in the report.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<MigrationReport> {
        let resources = self.eligible_resources().await?;
        Ok(self.migrate_resources(&resources, cancel).await)
    }

    /// Migrate the given resource types in order.
    ///
    /// Types finished by an interrupted earlier run are skipped. When the run
    /// is not cancelled all checkpoints are cleared afterwards so the next
    /// run starts from scratch.
    pub async fn migrate_resources(
        &self,
        resources: &[ResourceTypeRef],
        cancel: &CancellationToken,
    ) -> MigrationReport {
        let aggregator = ResultAggregator::new();
        let start = Instant::now();
        info!(resources = resources.len(), "Storage migration started");

        for (index, resource) in resources.iter().enumerate() {
            if cancel.is_cancelled() {
                // Types never reached are recorded as abandoned
                for skipped in &resources[index..] {
                    aggregator.record(MigrationOutcome::resource_failed(skipped, Error::Cancelled));
                }
                warn!(
                    abandoned = resources.len() - index,
                    "Migration cancelled before all resource types were reached"
                );
                break;
            }

            match self.progress.is_complete(resource).await {
                Ok(true) => {
                    info!(resource = %resource, "Already migrated by an interrupted run, skipping");
                    continue;
                }
                Ok(false) => {}
                Err(e) => warn!(resource = %resource, error = %e, "Could not read checkpoint, migrating from the start"),
            }

            let label = resource.to_string();
            match self.migrate_resource(resource, &aggregator, cancel).await {
                Ok(()) => {
                    metrics::MIGRATIONS_TOTAL.with_label_values(&["completed", &label]).inc();
                }
                Err(Error::Cancelled) => {
                    warn!(resource = %resource, "Migration cancelled");
                    metrics::MIGRATIONS_TOTAL.with_label_values(&["cancelled", &label]).inc();
                    aggregator.record(MigrationOutcome::resource_failed(resource, Error::Cancelled));
                }
                Err(e) => {
                    error!(resource = %resource, error = %e, "Migration of resource type failed");
                    metrics::MIGRATIONS_TOTAL.with_label_values(&["failed", &label]).inc();
                    aggregator.record(MigrationOutcome::resource_failed(
                        resource,
                        format!("could not list resources: {}", e),
                    ));
                }
            }
        }

        if !cancel.is_cancelled() {
            if let Err(e) = self.progress.reset().await {
                warn!(error = %e, "Failed to clear checkpoints after a finished run");
            }
        }

        if aggregator.is_empty() {
            info!("Nothing was migrated");
        }
        let report = aggregator.finalize();
        info!(
            status = ?report.status,
            outcomes = report.items.len(),
            errors = report.errors().count(),
            duration = ?start.elapsed(),
            "Storage migration finished"
        );
        report
    }

    /// Walk one resource type to its last page.
    ///
    /// The cursor is checkpointed only after a page's rewrites have all
    /// finished; a cancelled page is listed again on resume.
    pub async fn migrate_resource(
        &self,
        resource: &ResourceTypeRef,
        aggregator: &ResultAggregator,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut pager = Pager::resume(
            self.client.as_ref(),
            &self.progress,
            resource,
            &self.config.backoff,
            self.config.chunk_size,
            cancel,
        )
        .await?;
        let pool = RewritePool::new(
            self.client.as_ref(),
            aggregator,
            &self.config.backoff,
            self.config.concurrency,
        );

        info!(resource = %resource, token = %pager.token(), "Migrating resource type");
        while let Some(page) = pager.next_page().await {
            let page = page?;
            let listed = page.items.len();
            let outcomes = pool.migrate(resource, page, cancel).await;
            if cancel.is_cancelled() {
                let page_finished =
                    outcomes.len() == listed && !outcomes.iter().any(MigrationOutcome::is_cancelled);
                if pager.is_done() && page_finished {
                    pager.checkpoint().await;
                    info!(resource = %resource, "Last page rewritten before cancellation");
                    return Ok(());
                }
                return Err(Error::Cancelled);
            }
            pager.checkpoint().await;
        }

        info!(resource = %resource, pages = pager.pages(), "Resource type migrated");
        Ok(())
    }
}
