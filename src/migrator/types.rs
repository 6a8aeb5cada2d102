//! Data model shared by every stage of a migration run

use std::fmt;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// One resource kind across all of its instances.
///
/// Equality is by the (group, version, resource) triple.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceTypeRef {
    /// API group; empty for the legacy core group
    #[serde(default)]
    pub group: String,

    /// API version
    pub version: String,

    /// Plural resource name, e.g. "deployments"
    pub resource: String,
}

impl ResourceTypeRef {
    pub fn new(
        group: impl Into<String>,
        version: impl Into<String>,
        resource: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            resource: resource.into(),
        }
    }

    /// `group/version`, or just `version` for the core group
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// `resource.group` as used by include/exclude filters; `resource` for core
    pub fn group_resource(&self) -> String {
        if self.group.is_empty() {
            self.resource.clone()
        } else {
            format!("{}.{}", self.resource, self.group)
        }
    }
}

impl fmt::Display for ResourceTypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, Resource={}", self.api_version(), self.resource)
    }
}

/// A stored object carried through the engine unmodified.
///
/// Only the identity and concurrency metadata are read; the payload is the
/// object exactly as the control plane returned it and is written back as-is.
#[derive(Clone, Debug, PartialEq)]
pub struct ResourceObject {
    namespace: Option<String>,
    name: String,
    uid: Option<String>,
    resource_version: Option<String>,
    raw: Value,
}

impl ResourceObject {
    /// Wrap a raw object, reading its metadata
    pub fn from_raw(raw: Value) -> Result<Self> {
        let metadata = raw
            .get("metadata")
            .ok_or_else(|| Error::validation("object has no metadata"))?;
        let field = |key: &str| {
            metadata
                .get(key)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        let name = field("name").ok_or_else(|| Error::validation("object has no metadata.name"))?;

        Ok(Self {
            namespace: field("namespace"),
            name,
            uid: field("uid"),
            resource_version: field("resourceVersion"),
            raw,
        })
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn uid(&self) -> Option<&str> {
        self.uid.as_deref()
    }

    pub fn resource_version(&self) -> Option<&str> {
        self.resource_version.as_deref()
    }

    /// The untouched payload
    pub fn raw(&self) -> &Value {
        &self.raw
    }

    pub fn identity(&self) -> ObjectIdentity {
        ObjectIdentity {
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }
}

/// Stable identity of an object within its resource type
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectIdentity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
}

impl fmt::Display for ObjectIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// One page of a listing. An empty continue token marks the last page.
#[derive(Clone, Debug, Default)]
pub struct ListPage {
    pub items: Vec<ResourceObject>,
    pub continue_token: String,
}

impl ListPage {
    pub fn is_last(&self) -> bool {
        self.continue_token.is_empty()
    }
}

/// Resumable position within one resource type's listing
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContinuationState {
    pub resource_type: Option<ResourceTypeRef>,

    #[serde(default)]
    pub token: String,

    /// The resource type reached its last page in an interrupted run
    #[serde(default)]
    pub completed: bool,
}

/// What happened to one object, or to a whole resource type when
/// `object` is absent.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationOutcome {
    pub resource_type: ResourceTypeRef,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<ObjectIdentity>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// The object was deleted before it could be rewritten
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub skipped: bool,

    pub timestamp: DateTime<Utc>,
}

impl MigrationOutcome {
    pub fn migrated(resource_type: &ResourceTypeRef, object: ObjectIdentity) -> Self {
        Self {
            resource_type: resource_type.clone(),
            object: Some(object),
            error: None,
            skipped: false,
            timestamp: Utc::now(),
        }
    }

    pub fn skipped(resource_type: &ResourceTypeRef, object: ObjectIdentity) -> Self {
        Self {
            skipped: true,
            ..Self::migrated(resource_type, object)
        }
    }

    pub fn object_failed(
        resource_type: &ResourceTypeRef,
        object: ObjectIdentity,
        error: impl fmt::Display,
    ) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Self::migrated(resource_type, object)
        }
    }

    /// The whole resource type was abandoned
    pub fn resource_failed(resource_type: &ResourceTypeRef, error: impl fmt::Display) -> Self {
        Self {
            resource_type: resource_type.clone(),
            object: None,
            error: Some(error.to_string()),
            skipped: false,
            timestamp: Utc::now(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Work stopped by cancellation rather than by an API error
    pub fn is_cancelled(&self) -> bool {
        self.error.as_deref() == Some(Error::Cancelled.to_string().as_str())
    }
}

/// Overall verdict of a run
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum MigrationStatus {
    Success,
    Failure,
}

/// Everything attempted during one run
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationReport {
    pub status: MigrationStatus,
    pub items: Vec<MigrationOutcome>,
}

impl MigrationReport {
    pub fn is_success(&self) -> bool {
        self.status == MigrationStatus::Success
    }

    pub fn errors(&self) -> impl Iterator<Item = &MigrationOutcome> {
        self.items.iter().filter(|o| o.is_error())
    }

    /// Outcomes recorded for one resource type, in recording order
    pub fn for_resource<'a>(
        &'a self,
        resource_type: &ResourceTypeRef,
    ) -> impl Iterator<Item = &'a MigrationOutcome> {
        let resource_type = resource_type.clone();
        self.items
            .iter()
            .filter(move |o| o.resource_type == resource_type)
    }
}
