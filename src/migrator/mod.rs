//! Storage migration engine
//!
//! Rewrites every stored instance of the selected resource types so the API
//! server re-persists them under its current storage version. The engine only
//! talks to the control plane through the [`DiscoveryClient`] and
//! [`ResourceClient`] traits; `crate::adapters` provides the kube-rs backed
//! implementations.
//!
//! Flow of one run:
//! - [`EligibilityFilter`] selects resource types from discovery
//! - [`Pager`] walks each type page by page, recovering from expired tokens
//! - [`RewritePool`] rewrites each page with bounded concurrency
//! - [`ResultAggregator`] collects outcomes, [`ProgressTracker`] checkpoints

mod aggregator;
mod classify;
mod eligibility;
mod engine;
mod lister;
mod progress;
mod types;
mod worker;

pub use aggregator::ResultAggregator;
pub use classify::{classify, delay, pause, ApiError, ApiErrorKind, Backoff, BackoffConfig, Verdict};
pub use eligibility::{EligibilityConfig, EligibilityFilter};
pub use engine::Migrator;
pub use lister::Pager;
pub use progress::{FileProgressStore, MemoryProgressStore, ProgressStore, ProgressTracker};
pub use types::*;
pub use worker::RewritePool;

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Resources served under one group/version, as reported by discovery
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscoveredGroupVersion {
    /// Empty for the core group
    pub group: String,
    pub version: String,
    pub resources: Vec<DiscoveredResource>,
}

/// One resource entry in a discovery document
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscoveredResource {
    /// Plural name; subresources contain a '/'
    pub name: String,
    pub verbs: Vec<String>,
}

impl DiscoveredResource {
    pub fn supports(&self, verb: &str) -> bool {
        self.verbs.iter().any(|v| v == verb)
    }
}

/// Discovery side of the control plane
#[async_trait]
pub trait DiscoveryClient: Send + Sync {
    /// Resources at each group's preferred version
    async fn server_preferred_resources(&self) -> Result<Vec<DiscoveredGroupVersion>>;

    /// Groups served by a delegated (aggregated) API server
    async fn aggregated_groups(&self) -> Result<BTreeSet<String>>;

    /// Groups defined by installed CustomResourceDefinitions
    async fn custom_resource_groups(&self) -> Result<BTreeSet<String>>;
}

/// Data side of the control plane. `namespace` of `None` means cluster-wide
/// for `list`, and a cluster-scoped object for `get` and `update`.
#[async_trait]
pub trait ResourceClient: Send + Sync {
    async fn list(
        &self,
        resource: &ResourceTypeRef,
        continue_token: &str,
        limit: u32,
    ) -> std::result::Result<ListPage, ApiError>;

    async fn get(
        &self,
        resource: &ResourceTypeRef,
        namespace: Option<&str>,
        name: &str,
    ) -> std::result::Result<ResourceObject, ApiError>;

    async fn update(
        &self,
        resource: &ResourceTypeRef,
        namespace: Option<&str>,
        object: &ResourceObject,
    ) -> std::result::Result<ResourceObject, ApiError>;
}

/// Tunables for a migration run
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigratorConfig {
    /// Concurrent rewrites per page
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Objects requested per list call
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u32,

    #[serde(default)]
    pub backoff: BackoffConfig,

    #[serde(default)]
    pub eligibility: EligibilityConfig,
}

fn default_concurrency() -> usize {
    1
}

fn default_chunk_size() -> u32 {
    500
}

impl Default for MigratorConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            chunk_size: default_chunk_size(),
            backoff: BackoffConfig::default(),
            eligibility: EligibilityConfig::default(),
        }
    }
}

impl MigratorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(Error::validation("concurrency must be at least 1"));
        }
        if self.chunk_size == 0 {
            return Err(Error::validation("chunkSize must be at least 1"));
        }
        if self.backoff.multiplier < 1.0 {
            return Err(Error::validation(format!(
                "backoff multiplier {} must be >= 1.0",
                self.backoff.multiplier
            )));
        }
        if self.backoff.initial_delay_ms > self.backoff.max_delay_ms {
            return Err(Error::validation(format!(
                "backoff initialDelayMs {} exceeds maxDelayMs {}",
                self.backoff.initial_delay_ms, self.backoff.max_delay_ms
            )));
        }
        Ok(())
    }
}
