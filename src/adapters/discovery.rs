//! API discovery through kube-rs

use std::collections::BTreeSet;

use async_trait::async_trait;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::APIResourceList;
use k8s_openapi::kube_aggregator::pkg::apis::apiregistration::v1::APIService;
use kube::api::ListParams;
use kube::{Api, Client};
use tracing::debug;

use crate::error::Result;
use crate::migrator::{DiscoveredGroupVersion, DiscoveredResource, DiscoveryClient};

/// Discovery backed by the API server's discovery endpoints
#[derive(Clone)]
pub struct KubeDiscovery {
    client: Client,
}

impl KubeDiscovery {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn to_group_version(group: &str, version: &str, list: APIResourceList) -> DiscoveredGroupVersion {
    DiscoveredGroupVersion {
        group: group.to_string(),
        version: version.to_string(),
        resources: list
            .resources
            .into_iter()
            .map(|r| DiscoveredResource {
                name: r.name,
                verbs: r.verbs,
            })
            .collect(),
    }
}

#[async_trait]
impl DiscoveryClient for KubeDiscovery {
    async fn server_preferred_resources(&self) -> Result<Vec<DiscoveredGroupVersion>> {
        let mut document = Vec::new();

        let core = self.client.list_core_api_versions().await?;
        if let Some(version) = core.versions.first() {
            let list = self.client.list_core_api_resources(version).await?;
            document.push(to_group_version("", version, list));
        }

        let groups = self.client.list_api_groups().await?;
        for group in groups.groups {
            let Some(preferred) = group
                .preferred_version
                .clone()
                .or_else(|| group.versions.first().cloned())
            else {
                debug!(group = %group.name, "Group advertises no versions, ignoring");
                continue;
            };
            let list = self
                .client
                .list_api_group_resources(&preferred.group_version)
                .await?;
            document.push(to_group_version(&group.name, &preferred.version, list));
        }

        Ok(document)
    }

    async fn aggregated_groups(&self) -> Result<BTreeSet<String>> {
        let api: Api<APIService> = Api::all(self.client.clone());
        let services = api.list(&ListParams::default()).await?;

        // Local APIServices have no backing service; only delegated ones do
        Ok(services
            .items
            .into_iter()
            .filter_map(|s| s.spec)
            .filter(|spec| spec.service.is_some())
            .filter_map(|spec| spec.group)
            .collect())
    }

    async fn custom_resource_groups(&self) -> Result<BTreeSet<String>> {
        let api: Api<CustomResourceDefinition> = Api::all(self.client.clone());
        let crds = api.list(&ListParams::default()).await?;
        Ok(crds.items.into_iter().map(|crd| crd.spec.group).collect())
    }
}
