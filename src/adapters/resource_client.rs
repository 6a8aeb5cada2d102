//! Untyped list/get/update against arbitrary resource types
//!
//! Requests go through `Client::send` rather than `Api<DynamicObject>` so
//! that error bodies can be decoded in full: the retry hint
//! (`details.retryAfterSeconds`) and the inconsistent continue token
//! (`metadata.continue`) are not exposed by `kube::error::ErrorResponse`.

use std::time::Duration;

use async_trait::async_trait;
use kube::api::{GetParams, ListParams, PostParams};
use kube::client::Body;
use kube::core::Request;
use kube::Client;
use serde::Deserialize;
use serde_json::Value;

use crate::migrator::{ApiError, ApiErrorKind, ListPage, ResourceClient, ResourceObject, ResourceTypeRef};

/// The subset of `metav1.Status` the classifier needs
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusBody {
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    metadata: Option<StatusListMeta>,
    #[serde(default)]
    details: Option<StatusDetails>,
}

#[derive(Debug, Default, Deserialize)]
struct StatusListMeta {
    #[serde(default, rename = "continue")]
    continue_: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusDetails {
    #[serde(default)]
    retry_after_seconds: Option<i64>,
}

/// Resource client backed by a kube `Client`
#[derive(Clone)]
pub struct KubeResourceClient {
    client: Client,
}

impl KubeResourceClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn send(&self, request: hyper::Request<Vec<u8>>) -> Result<Value, ApiError> {
        let response = self
            .client
            .send(request.map(Body::from))
            .await
            .map_err(ApiError::from_transport)?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get(hyper::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let bytes = response
            .into_body()
            .collect_bytes()
            .await
            .map_err(ApiError::from_transport)?;

        if status.is_success() {
            return serde_json::from_slice(&bytes)
                .map_err(|e| ApiError::new(ApiErrorKind::ProbableEof, format!("undecodable response: {}", e)));
        }

        Err(status_error(status.as_u16(), &bytes, retry_after))
    }
}

/// Decode a failed response into an [`ApiError`]
fn status_error(code: u16, body: &[u8], header_retry_after: Option<Duration>) -> ApiError {
    let status: StatusBody = serde_json::from_slice(body).unwrap_or_default();
    if status.kind.as_deref() != Some("Status") {
        let text = String::from_utf8_lossy(body);
        return ApiError::from_status(code, None, format!("HTTP {}: {}", code, text.trim()))
            .with_retry_after(header_retry_after);
    }

    let retry_after = status
        .details
        .as_ref()
        .and_then(|d| d.retry_after_seconds)
        .filter(|s| *s > 0)
        .map(|s| Duration::from_secs(s as u64))
        .or(header_retry_after);
    let continue_token = status.metadata.and_then(|m| m.continue_);

    ApiError::from_status(code, status.reason.as_deref(), status.message.unwrap_or_default())
        .with_retry_after(retry_after)
        .with_continue_token(continue_token)
}

/// `/api/v1[/namespaces/ns]/pods` or `/apis/apps/v1[/namespaces/ns]/deployments`
fn collection_path(resource: &ResourceTypeRef, namespace: Option<&str>) -> String {
    let base = if resource.group.is_empty() {
        format!("/api/{}", resource.version)
    } else {
        format!("/apis/{}/{}", resource.group, resource.version)
    };
    match namespace {
        Some(ns) => format!("{}/namespaces/{}/{}", base, ns, resource.resource),
        None => format!("{}/{}", base, resource.resource),
    }
}

fn request_error(err: kube::core::request::Error) -> ApiError {
    ApiError::new(ApiErrorKind::Other, format!("failed to build request: {}", err))
}

fn decode_object(value: Value) -> Result<ResourceObject, ApiError> {
    ResourceObject::from_raw(value).map_err(|e| ApiError::new(ApiErrorKind::Other, e.to_string()))
}

/// Turn a list response into a page.
///
/// List items omit apiVersion/kind; they are restored from the list's own
/// type so the item can be written back as a complete object.
fn decode_list(mut list: Value) -> Result<ListPage, ApiError> {
    let api_version = list.get("apiVersion").and_then(Value::as_str).map(str::to_string);
    let kind = list
        .get("kind")
        .and_then(Value::as_str)
        .and_then(|k| k.strip_suffix("List"))
        .map(str::to_string);
    let continue_token = list
        .pointer("/metadata/continue")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let items = match list.get_mut("items").map(Value::take) {
        Some(Value::Array(items)) => items,
        Some(Value::Null) | None => Vec::new(),
        Some(other) => {
            return Err(ApiError::new(
                ApiErrorKind::Other,
                format!("list items is not an array: {}", other),
            ))
        }
    };

    let items = items
        .into_iter()
        .map(|mut item| {
            if let Some(obj) = item.as_object_mut() {
                if let Some(v) = &api_version {
                    obj.entry("apiVersion").or_insert_with(|| Value::String(v.clone()));
                }
                if let Some(k) = &kind {
                    obj.entry("kind").or_insert_with(|| Value::String(k.clone()));
                }
            }
            decode_object(item)
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(ListPage { items, continue_token })
}

#[async_trait]
impl ResourceClient for KubeResourceClient {
    async fn list(
        &self,
        resource: &ResourceTypeRef,
        continue_token: &str,
        limit: u32,
    ) -> Result<ListPage, ApiError> {
        let mut params = ListParams::default().limit(limit);
        if !continue_token.is_empty() {
            params = params.continue_token(continue_token);
        }
        let request = Request::new(collection_path(resource, None))
            .list(&params)
            .map_err(request_error)?;
        decode_list(self.send(request).await?)
    }

    async fn get(
        &self,
        resource: &ResourceTypeRef,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<ResourceObject, ApiError> {
        let request = Request::new(collection_path(resource, namespace))
            .get(name, &GetParams::default())
            .map_err(request_error)?;
        decode_object(self.send(request).await?)
    }

    async fn update(
        &self,
        resource: &ResourceTypeRef,
        namespace: Option<&str>,
        object: &ResourceObject,
    ) -> Result<ResourceObject, ApiError> {
        let body = serde_json::to_vec(object.raw())
            .map_err(|e| ApiError::new(ApiErrorKind::Other, e.to_string()))?;
        let request = Request::new(collection_path(resource, namespace))
            .replace(object.name(), &PostParams::default(), body)
            .map_err(request_error)?;
        decode_object(self.send(request).await?)
    }
}
