//! Paginated listing of one resource type

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::metrics;
use crate::migrator::{
    classify, pause, Backoff, BackoffConfig, ListPage, ProgressTracker, ResourceClient,
    ResourceTypeRef, Verdict,
};

/// Walks one resource type page by page.
///
/// Each call to [`Pager::next_page`] advances the cursor; the sequence ends
/// after the page with an empty continue token or after the first error that
/// is not retried. Pages are expected to be fully rewritten before
/// [`Pager::checkpoint`] records the cursor, so a crash mid-page re-lists
/// that page on resume.
pub struct Pager<'a> {
    client: &'a dyn ResourceClient,
    progress: &'a ProgressTracker,
    resource: &'a ResourceTypeRef,
    backoff: &'a BackoffConfig,
    cancel: &'a CancellationToken,
    limit: u32,
    token: String,
    pages: usize,
    done: bool,
}

impl<'a> Pager<'a> {
    /// Resume from the tracker's checkpoint, or start at the beginning
    pub async fn resume(
        client: &'a dyn ResourceClient,
        progress: &'a ProgressTracker,
        resource: &'a ResourceTypeRef,
        backoff: &'a BackoffConfig,
        limit: u32,
        cancel: &'a CancellationToken,
    ) -> Result<Pager<'a>> {
        let token = progress.load(resource).await?;
        if !token.is_empty() {
            debug!(resource = %resource, token = %token, "Resuming listing from checkpoint");
        }
        Ok(Self {
            client,
            progress,
            resource,
            backoff,
            cancel,
            limit,
            token,
            pages: 0,
            done: false,
        })
    }

    /// Cursor the next request will use
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Pages returned so far
    pub fn pages(&self) -> usize {
        self.pages
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub async fn next_page(&mut self) -> Option<Result<ListPage>> {
        if self.done {
            return None;
        }

        let mut backoff = Backoff::new(self.backoff);
        loop {
            if self.cancel.is_cancelled() {
                return Some(self.finish(Err(Error::Cancelled)));
            }

            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                result = self.client.list(self.resource, &self.token, self.limit) => Some(result),
            };

            let err = match result {
                None => return Some(self.finish(Err(Error::Cancelled))),
                Some(Ok(page)) => {
                    self.pages += 1;
                    self.token = page.continue_token.clone();
                    self.done = page.is_last();
                    debug!(
                        resource = %self.resource,
                        page = self.pages,
                        items = page.items.len(),
                        last = self.done,
                        "Listed page"
                    );
                    return Some(Ok(page));
                }
                Some(Err(err)) => err,
            };

            match classify(&err) {
                Verdict::SnapshotExpired => {
                    let Some(token) = err.continue_token.clone() else {
                        return Some(self.finish(Err(Error::Api(err))));
                    };
                    warn!(
                        resource = %self.resource,
                        error = %err,
                        "Listing snapshot expired, continuing with inconsistent continue token"
                    );
                    self.token = token;
                    self.progress.save(self.resource, &self.token).await;
                }
                Verdict::Retriable => {
                    let wait = backoff.next_delay(&err);
                    metrics::RETRIES
                        .with_label_values(&[&self.resource.to_string(), err.reason_label()])
                        .inc();
                    warn!(
                        resource = %self.resource,
                        delay_ms = wait.as_millis() as u64,
                        error = %err,
                        "Listing failed, retrying with the same continue token"
                    );
                    if !pause(wait, self.cancel).await {
                        return Some(self.finish(Err(Error::Cancelled)));
                    }
                }
                // NotFound while listing means the type itself is gone
                Verdict::Gone | Verdict::Terminal => {
                    return Some(self.finish(Err(Error::Api(err))));
                }
            }
        }
    }

    /// Record the cursor after the last returned page has been rewritten
    pub async fn checkpoint(&self) {
        if self.pages == 0 {
            return;
        }
        if self.done {
            self.progress.complete(self.resource).await;
        } else {
            self.progress.save(self.resource, &self.token).await;
        }
    }

    fn finish(&mut self, result: Result<ListPage>) -> Result<ListPage> {
        self.done = true;
        result
    }
}
