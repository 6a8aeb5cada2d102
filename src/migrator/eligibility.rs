//! Selection of the resource types a run rewrites

use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::migrator::{DiscoveredGroupVersion, DiscoveryClient, ResourceTypeRef};

/// Filter settings, fixed when the filter is built
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EligibilityConfig {
    /// Resource names never migrated, in any group (high-churn kinds)
    #[serde(default = "default_denied_resources")]
    pub denied_resources: BTreeSet<String>,

    /// Only these `resource.group` names are migrated when non-empty
    #[serde(default)]
    pub include_resources: BTreeSet<String>,

    /// `resource.group` names to skip
    #[serde(default)]
    pub exclude_resources: BTreeSet<String>,

    /// API groups to skip entirely
    #[serde(default)]
    pub exclude_groups: BTreeSet<String>,

    /// Skip groups that belong to installed CustomResourceDefinitions
    #[serde(default)]
    pub exclude_custom_resources: bool,
}

fn default_denied_resources() -> BTreeSet<String> {
    BTreeSet::from(["events".to_string()])
}

impl Default for EligibilityConfig {
    fn default() -> Self {
        Self {
            denied_resources: default_denied_resources(),
            include_resources: BTreeSet::new(),
            exclude_resources: BTreeSet::new(),
            exclude_groups: BTreeSet::new(),
            exclude_custom_resources: false,
        }
    }
}

/// Computes which discovered resource types are safe to rewrite
#[derive(Clone, Debug, Default)]
pub struct EligibilityFilter {
    config: EligibilityConfig,
}

impl EligibilityFilter {
    pub fn new(config: EligibilityConfig) -> Self {
        Self { config }
    }

    /// Query discovery and compute the eligible set.
    ///
    /// Any discovery failure aborts; a partial document is never used.
    pub async fn discover(&self, discovery: &dyn DiscoveryClient) -> Result<Vec<ResourceTypeRef>> {
        let document = discovery
            .server_preferred_resources()
            .await
            .map_err(|e| Error::discovery(format!("failed to discover preferred resources: {}", e)))?;
        let aggregated = discovery
            .aggregated_groups()
            .await
            .map_err(|e| Error::discovery(format!("failed to list aggregated APIs: {}", e)))?;
        let custom = if self.config.exclude_custom_resources {
            discovery
                .custom_resource_groups()
                .await
                .map_err(|e| Error::discovery(format!("failed to list custom resource groups: {}", e)))?
        } else {
            BTreeSet::new()
        };

        let eligible = self.compute_eligible(&document, &aggregated, &custom);
        info!(count = eligible.len(), "Computed migratable resource types");
        Ok(eligible)
    }

    /// Pure selection over an already fetched discovery document.
    ///
    /// Output follows discovery order; the first version reported for a
    /// (group, resource) pair is the one kept.
    pub fn compute_eligible(
        &self,
        document: &[DiscoveredGroupVersion],
        aggregated_groups: &BTreeSet<String>,
        custom_groups: &BTreeSet<String>,
    ) -> Vec<ResourceTypeRef> {
        let mut seen: HashSet<(String, String)> = HashSet::new();
        let mut eligible = Vec::new();

        for gv in document {
            if aggregated_groups.contains(&gv.group) {
                debug!(group = %gv.group, "Ignoring aggregated API group");
                continue;
            }
            if custom_groups.contains(&gv.group) {
                debug!(group = %gv.group, "Ignoring custom resource group");
                continue;
            }
            if self.config.exclude_groups.contains(&gv.group) {
                debug!(group = %gv.group, "Ignoring excluded group");
                continue;
            }

            for entry in &gv.resources {
                // subresources such as pods/status
                if entry.name.contains('/') {
                    continue;
                }
                if self.config.denied_resources.contains(&entry.name) {
                    continue;
                }
                if !entry.supports("list") || !entry.supports("update") {
                    debug!(
                        group = %gv.group,
                        resource = %entry.name,
                        "Ignoring resource without list and update verbs"
                    );
                    continue;
                }

                let gvr = ResourceTypeRef::new(&gv.group, &gv.version, &entry.name);
                if !self.selected(&gvr) {
                    continue;
                }
                if seen.insert((gvr.group.clone(), gvr.resource.clone())) {
                    eligible.push(gvr);
                }
            }
        }

        eligible
    }

    fn selected(&self, gvr: &ResourceTypeRef) -> bool {
        let name = gvr.group_resource();
        if self.config.exclude_resources.contains(&name) {
            return false;
        }
        self.config.include_resources.is_empty() || self.config.include_resources.contains(&name)
    }
}
