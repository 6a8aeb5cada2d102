//! Bounded-concurrency rewrite of a listed page

use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::Error;
use crate::metrics;
use crate::migrator::{
    classify, pause, ApiError, Backoff, BackoffConfig, ListPage, MigrationOutcome, ObjectIdentity,
    ResourceClient, ResourceObject, ResourceTypeRef, ResultAggregator, Verdict,
};

/// Rewrites every object of a page by writing it back unchanged.
///
/// Each object is owned by exactly one in-flight future from its first
/// attempt to its outcome. Objects not yet started when cancellation is
/// observed are left for the next run; objects mid-retry stop before the
/// next attempt and are recorded as cancelled.
pub struct RewritePool<'a> {
    client: &'a dyn ResourceClient,
    aggregator: &'a ResultAggregator,
    backoff: &'a BackoffConfig,
    concurrency: usize,
}

impl<'a> RewritePool<'a> {
    pub fn new(
        client: &'a dyn ResourceClient,
        aggregator: &'a ResultAggregator,
        backoff: &'a BackoffConfig,
        concurrency: usize,
    ) -> Self {
        Self {
            client,
            aggregator,
            backoff,
            concurrency: concurrency.max(1),
        }
    }

    /// Rewrite one page. Outcomes are recorded as they complete and also
    /// returned.
    pub async fn migrate(
        &self,
        resource: &ResourceTypeRef,
        page: ListPage,
        cancel: &CancellationToken,
    ) -> Vec<MigrationOutcome> {
        stream::iter(page.items)
            .map(|item| self.migrate_one(resource, item, cancel))
            .buffer_unordered(self.concurrency)
            .filter_map(|outcome| async move { outcome })
            .collect()
            .await
    }

    async fn migrate_one(
        &self,
        resource: &ResourceTypeRef,
        item: ResourceObject,
        cancel: &CancellationToken,
    ) -> Option<MigrationOutcome> {
        if cancel.is_cancelled() {
            return None;
        }

        let identity = item.identity();
        let outcome = self.rewrite(resource, item, &identity, cancel).await;
        self.aggregator.record(outcome.clone());
        Some(outcome)
    }

    /// Retry loop for one object; ends on success, Gone, a terminal error or
    /// cancellation.
    async fn rewrite(
        &self,
        resource: &ResourceTypeRef,
        item: ResourceObject,
        identity: &ObjectIdentity,
        cancel: &CancellationToken,
    ) -> MigrationOutcome {
        let namespace = identity.namespace.as_deref();
        let mut current = item;
        let mut refetch = false;
        let mut backoff = Backoff::new(self.backoff);

        loop {
            let (refetch_next, result) = self.attempt(resource, namespace, &mut current, refetch).await;
            let err = match result {
                Ok(()) => {
                    debug!(resource = %resource, object = %identity, "Migrated object");
                    return MigrationOutcome::migrated(resource, identity.clone());
                }
                Err(err) => err,
            };
            refetch = refetch_next;

            match classify(&err) {
                Verdict::Gone => {
                    debug!(resource = %resource, object = %identity, "Object deleted before rewrite, skipping");
                    return MigrationOutcome::skipped(resource, identity.clone());
                }
                Verdict::Retriable => {
                    let wait = backoff.next_delay(&err);
                    metrics::RETRIES
                        .with_label_values(&[&resource.to_string(), err.reason_label()])
                        .inc();
                    match namespace {
                        Some(ns) => warn!(
                            name = %identity.name,
                            namespace = %ns,
                            delay_ms = wait.as_millis() as u64,
                            error = %err,
                            "Migration of object will be retried"
                        ),
                        None => warn!(
                            name = %identity.name,
                            delay_ms = wait.as_millis() as u64,
                            error = %err,
                            "Migration of object will be retried"
                        ),
                    }
                    if !pause(wait, cancel).await {
                        return MigrationOutcome::object_failed(resource, identity.clone(), Error::Cancelled);
                    }
                }
                Verdict::Terminal | Verdict::SnapshotExpired => {
                    warn!(resource = %resource, object = %identity, error = %err, "Migration of object failed");
                    return MigrationOutcome::object_failed(
                        resource,
                        identity.clone(),
                        format!("can not retry: {}", err),
                    );
                }
            }
        }
    }

    /// One write, preceded by a fresh read when the cached copy is stale.
    ///
    /// Returns whether the next attempt must re-read: after a conflict, or
    /// when the read itself failed.
    async fn attempt(
        &self,
        resource: &ResourceTypeRef,
        namespace: Option<&str>,
        current: &mut ResourceObject,
        refetch: bool,
    ) -> (bool, Result<(), ApiError>) {
        if refetch {
            let fetched = self.client.get(resource, namespace, current.name()).await;
            match fetched {
                Ok(fresh) => *current = fresh,
                Err(err) => return (true, Err(err)),
            }
        }

        // The body carries resourceVersion and uid, so the write is
        // conditioned on both.
        match self.client.update(resource, namespace, current).await {
            Ok(_) => (false, Ok(())),
            Err(err) => (err.is_conflict(), Err(err)),
        }
    }
}
