//! Integration tests for the migration engine
//!
//! These tests run complete migrations against an in-memory control plane
//! that can inject list and write failures, expire continue tokens and
//! cancel the run after a number of writes.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;
use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;

use storage_version_migrator::migrator::{
    classify, ApiError, ApiErrorKind, BackoffConfig, DiscoveredGroupVersion, DiscoveredResource,
    DiscoveryClient, ListPage, MemoryProgressStore, MigrationReport, MigrationStatus, Migrator,
    MigratorConfig, ObjectIdentity, ProgressTracker, ResourceClient, ResourceObject,
    ResourceTypeRef, Verdict,
};
use storage_version_migrator::{Error, Result};

// ============================================================================
// Fake control plane
// ============================================================================

#[derive(Clone, Debug)]
struct Stored {
    namespace: Option<String>,
    name: String,
    resource_version: u64,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<ResourceTypeRef, Vec<Stored>>,
    list_calls: Vec<(ResourceTypeRef, String)>,
    writes: BTreeMap<(ResourceTypeRef, String), u32>,
    total_writes: usize,
    /// Tokens that report an expired snapshot the first time they are used
    expiring: BTreeSet<String>,
    /// Every write to these types fails with the given error
    broken_types: BTreeMap<ResourceTypeRef, ApiError>,
    /// Errors returned, in order, by the next writes of one object
    write_faults: BTreeMap<String, VecDeque<ApiError>>,
    /// Errors returned, in order, by the next list calls of one type
    list_faults: BTreeMap<ResourceTypeRef, VecDeque<ApiError>>,
}

struct FakeCluster {
    discovery: Vec<DiscoveredGroupVersion>,
    aggregated: BTreeSet<String>,
    discovery_fails: bool,
    state: Mutex<State>,
    cancel_after: Mutex<Option<(usize, CancellationToken)>>,
}

fn configmaps() -> ResourceTypeRef {
    ResourceTypeRef::new("", "v1", "configmaps")
}

fn secrets() -> ResourceTypeRef {
    ResourceTypeRef::new("", "v1", "secrets")
}

fn deployments() -> ResourceTypeRef {
    ResourceTypeRef::new("apps", "v1", "deployments")
}

fn entry(name: &str) -> DiscoveredResource {
    DiscoveredResource {
        name: name.to_string(),
        verbs: ["create", "delete", "get", "list", "patch", "update", "watch"]
            .iter()
            .map(|v| v.to_string())
            .collect(),
    }
}

fn offset(token: &str) -> usize {
    token
        .strip_prefix("tok-")
        .or_else(|| token.strip_prefix("inc-"))
        .and_then(|n| n.parse().ok())
        .unwrap_or(0)
}

impl FakeCluster {
    /// A cluster serving configmaps, secrets, events, deployments and an
    /// aggregated metrics API
    fn new() -> Self {
        Self {
            discovery: vec![
                DiscoveredGroupVersion {
                    group: String::new(),
                    version: "v1".to_string(),
                    resources: vec![
                        entry("configmaps"),
                        entry("secrets"),
                        entry("events"),
                        entry("pods/status"),
                    ],
                },
                DiscoveredGroupVersion {
                    group: "apps".to_string(),
                    version: "v1".to_string(),
                    resources: vec![entry("deployments"), entry("deployments/scale")],
                },
                DiscoveredGroupVersion {
                    group: "metrics.k8s.io".to_string(),
                    version: "v1beta1".to_string(),
                    resources: vec![entry("pods")],
                },
            ],
            aggregated: BTreeSet::from(["metrics.k8s.io".to_string()]),
            discovery_fails: false,
            state: Mutex::new(State::default()),
            cancel_after: Mutex::new(None),
        }
    }

    fn with_objects(self, resource: ResourceTypeRef, count: usize) -> Self {
        let objects = (0..count)
            .map(|i| Stored {
                namespace: Some("default".to_string()),
                name: format!("{}-{}", resource.resource, i),
                resource_version: 1,
            })
            .collect();
        self.state.lock().unwrap().objects.insert(resource, objects);
        self
    }

    fn expire_once(&self, token: &str) {
        self.state.lock().unwrap().expiring.insert(token.to_string());
    }

    fn break_writes(&self, resource: ResourceTypeRef, err: ApiError) {
        self.state.lock().unwrap().broken_types.insert(resource, err);
    }

    fn fail_writes(&self, name: &str, errors: Vec<ApiError>) {
        self.state
            .lock()
            .unwrap()
            .write_faults
            .insert(name.to_string(), errors.into());
    }

    fn fail_lists(&self, resource: ResourceTypeRef, errors: Vec<ApiError>) {
        self.state
            .lock()
            .unwrap()
            .list_faults
            .insert(resource, errors.into());
    }

    fn cancel_after_writes(&self, writes: usize, cancel: CancellationToken) {
        *self.cancel_after.lock().unwrap() = Some((writes, cancel));
    }

    fn list_calls(&self, resource: &ResourceTypeRef) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .list_calls
            .iter()
            .filter(|(r, _)| r == resource)
            .map(|(_, t)| t.clone())
            .collect()
    }

    fn clear_list_calls(&self) {
        self.state.lock().unwrap().list_calls.clear();
    }

    fn writes_of(&self, resource: &ResourceTypeRef, name: &str) -> u32 {
        self.state
            .lock()
            .unwrap()
            .writes
            .get(&(resource.clone(), name.to_string()))
            .copied()
            .unwrap_or(0)
    }

    fn render(resource: &ResourceTypeRef, stored: &Stored) -> ResourceObject {
        ResourceObject::from_raw(json!({
            "apiVersion": resource.api_version(),
            "kind": "Object",
            "metadata": {
                "name": stored.name,
                "namespace": stored.namespace,
                "resourceVersion": stored.resource_version.to_string(),
            },
            "data": {"payload": "unchanged"}
        }))
        .unwrap()
    }
}

#[async_trait]
impl DiscoveryClient for FakeCluster {
    async fn server_preferred_resources(&self) -> Result<Vec<DiscoveredGroupVersion>> {
        if self.discovery_fails {
            return Err(Error::Api(ApiError::from_status(
                503,
                Some("ServiceUnavailable"),
                "the server is currently unable to handle the request",
            )));
        }
        Ok(self.discovery.clone())
    }

    async fn aggregated_groups(&self) -> Result<BTreeSet<String>> {
        Ok(self.aggregated.clone())
    }

    async fn custom_resource_groups(&self) -> Result<BTreeSet<String>> {
        Ok(BTreeSet::new())
    }
}

#[async_trait]
impl ResourceClient for FakeCluster {
    async fn list(
        &self,
        resource: &ResourceTypeRef,
        continue_token: &str,
        limit: u32,
    ) -> std::result::Result<ListPage, ApiError> {
        let mut state = self.state.lock().unwrap();
        state
            .list_calls
            .push((resource.clone(), continue_token.to_string()));

        if let Some(err) = state.list_faults.get_mut(resource).and_then(VecDeque::pop_front) {
            return Err(err);
        }

        let start = offset(continue_token);
        if state.expiring.remove(continue_token) {
            return Err(ApiError::from_status(410, Some("Expired"), "continue token too old")
                .with_continue_token(Some(format!("inc-{}", start))));
        }

        let objects = state.objects.get(resource).cloned().unwrap_or_default();
        let end = (start + limit as usize).min(objects.len());
        let items = objects[start.min(end)..end]
            .iter()
            .map(|o| Self::render(resource, o))
            .collect();
        let continue_token = if end < objects.len() {
            format!("tok-{}", end)
        } else {
            String::new()
        };

        Ok(ListPage { items, continue_token })
    }

    async fn get(
        &self,
        resource: &ResourceTypeRef,
        namespace: Option<&str>,
        name: &str,
    ) -> std::result::Result<ResourceObject, ApiError> {
        let state = self.state.lock().unwrap();
        state
            .objects
            .get(resource)
            .and_then(|objects| {
                objects
                    .iter()
                    .find(|o| o.name == name && o.namespace.as_deref() == namespace)
            })
            .map(|o| Self::render(resource, o))
            .ok_or_else(|| ApiError::from_status(404, Some("NotFound"), format!("{} not found", name)))
    }

    async fn update(
        &self,
        resource: &ResourceTypeRef,
        namespace: Option<&str>,
        object: &ResourceObject,
    ) -> std::result::Result<ResourceObject, ApiError> {
        let updated = {
            let mut state = self.state.lock().unwrap();

            if let Some(err) = state
                .write_faults
                .get_mut(object.name())
                .and_then(VecDeque::pop_front)
            {
                return Err(err);
            }
            if let Some(err) = state.broken_types.get(resource) {
                return Err(err.clone());
            }

            let stored = state
                .objects
                .get_mut(resource)
                .and_then(|objects| {
                    objects
                        .iter_mut()
                        .find(|o| o.name == object.name() && o.namespace.as_deref() == namespace)
                })
                .ok_or_else(|| ApiError::from_status(404, Some("NotFound"), "not found"))?;

            if object.resource_version() != Some(stored.resource_version.to_string().as_str()) {
                return Err(ApiError::from_status(
                    409,
                    Some("Conflict"),
                    "the object has been modified",
                ));
            }
            stored.resource_version += 1;
            let updated = Self::render(resource, stored);

            *state
                .writes
                .entry((resource.clone(), object.name().to_string()))
                .or_insert(0) += 1;
            state.total_writes += 1;

            let total = state.total_writes;
            if let Some((limit, cancel)) = self.cancel_after.lock().unwrap().as_ref() {
                if total >= *limit {
                    cancel.cancel();
                }
            }
            updated
        };

        Ok(updated)
    }
}

// ============================================================================
// Test Helpers
// ============================================================================

fn fast_config(chunk_size: u32, concurrency: usize) -> MigratorConfig {
    MigratorConfig {
        concurrency,
        chunk_size,
        backoff: BackoffConfig {
            initial_delay_ms: 1,
            max_delay_ms: 5,
            multiplier: 2.0,
        },
        ..Default::default()
    }
}

fn migrator(cluster: &Arc<FakeCluster>, progress: ProgressTracker, config: MigratorConfig) -> Migrator {
    Migrator::new(cluster.clone(), cluster.clone(), progress, config)
}

fn migrated(report: &MigrationReport) -> BTreeSet<(ResourceTypeRef, ObjectIdentity)> {
    report
        .items
        .iter()
        .filter(|o| !o.is_error() && !o.skipped)
        .filter_map(|o| o.object.clone().map(|obj| (o.resource_type.clone(), obj)))
        .collect()
}

fn identity(name: &str) -> ObjectIdentity {
    ObjectIdentity {
        namespace: Some("default".to_string()),
        name: name.to_string(),
    }
}

// ============================================================================
// Discovery and eligibility
// ============================================================================

#[tokio::test]
async fn test_eligible_types_exclude_aggregated_denied_and_subresources() {
    let cluster = Arc::new(FakeCluster::new());
    let m = migrator(&cluster, ProgressTracker::in_memory(), fast_config(10, 1));

    let eligible = assert_ok!(m.eligible_resources().await);
    assert_eq!(eligible, vec![configmaps(), secrets(), deployments()]);
}

#[tokio::test]
async fn test_discovery_failure_aborts_run() {
    let mut cluster = FakeCluster::new().with_objects(configmaps(), 3);
    cluster.discovery_fails = true;
    let cluster = Arc::new(cluster);
    let m = migrator(&cluster, ProgressTracker::in_memory(), fast_config(10, 1));

    let err = assert_err!(m.run(&CancellationToken::new()).await);
    assert!(matches!(err, Error::Discovery(_)));
    assert!(cluster.list_calls(&configmaps()).is_empty());
}

// ============================================================================
// Testable properties
// ============================================================================

#[tokio::test]
async fn test_second_run_is_idempotent() {
    let cluster = Arc::new(
        FakeCluster::new()
            .with_objects(configmaps(), 5)
            .with_objects(deployments(), 3),
    );
    let m = migrator(&cluster, ProgressTracker::in_memory(), fast_config(2, 2));
    let cancel = CancellationToken::new();

    let first = assert_ok!(m.run(&cancel).await);
    let second = assert_ok!(m.run(&cancel).await);

    assert_eq!(first.status, MigrationStatus::Success);
    assert_eq!(second.status, MigrationStatus::Success);
    assert_eq!(second.errors().count(), 0);
    assert_eq!(migrated(&first), migrated(&second));
    assert_eq!(migrated(&second).len(), 8);

    // The second run started over rather than skipping completed types
    assert_eq!(cluster.writes_of(&configmaps(), "configmaps-4"), 2);
    assert_eq!(cluster.writes_of(&deployments(), "deployments-0"), 2);
}

#[tokio::test]
async fn test_pagination_visits_every_object_once() {
    let cluster = Arc::new(FakeCluster::new().with_objects(secrets(), 7));
    let m = migrator(&cluster, ProgressTracker::in_memory(), fast_config(3, 3));

    let report = m
        .migrate_resources(&[secrets()], &CancellationToken::new())
        .await;

    assert!(report.is_success());
    assert_eq!(cluster.list_calls(&secrets()), vec!["", "tok-3", "tok-6"]);

    let expected: BTreeSet<_> = (0..7)
        .map(|i| (secrets(), identity(&format!("secrets-{}", i))))
        .collect();
    assert_eq!(migrated(&report), expected);
    for i in 0..7 {
        assert_eq!(cluster.writes_of(&secrets(), &format!("secrets-{}", i)), 1);
    }
}

#[tokio::test]
async fn test_expired_token_resumes_from_inconsistent_token() {
    let cluster = Arc::new(FakeCluster::new().with_objects(configmaps(), 6));
    cluster.expire_once("tok-2");
    let m = migrator(&cluster, ProgressTracker::in_memory(), fast_config(2, 1));

    let report = m
        .migrate_resources(&[configmaps()], &CancellationToken::new())
        .await;

    assert_eq!(report.status, MigrationStatus::Success);
    assert_eq!(
        cluster.list_calls(&configmaps()),
        vec!["", "tok-2", "inc-2", "tok-4"]
    );
    assert_eq!(migrated(&report).len(), 6);
}

#[tokio::test]
async fn test_retry_classification() {
    for err in [
        ApiError::from_status(409, Some("Conflict"), "modified"),
        ApiError::from_status(500, Some("ServerTimeout"), "server timeout"),
        ApiError::from_status(429, Some("TooManyRequests"), "slow down"),
        ApiError::from_transport(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "connection reset by peer",
        )),
    ] {
        assert_eq!(classify(&err), Verdict::Retriable, "{:?}", err.kind);
    }
    assert_eq!(
        classify(&ApiError::from_status(405, Some("MethodNotAllowed"), "not allowed")),
        Verdict::Terminal
    );
    assert_eq!(
        classify(&ApiError::from_status(404, Some("NotFound"), "gone")),
        Verdict::Gone
    );
}

#[tokio::test]
async fn test_transient_write_failures_are_retried_and_gone_objects_skipped() {
    let cluster = Arc::new(FakeCluster::new().with_objects(configmaps(), 3));
    cluster.fail_writes(
        "configmaps-0",
        vec![
            ApiError::from_status(409, Some("Conflict"), "modified"),
            ApiError::from_status(500, Some("ServerTimeout"), "server timeout"),
            ApiError::from_status(429, Some("TooManyRequests"), "slow down"),
        ],
    );
    cluster.fail_writes(
        "configmaps-1",
        vec![ApiError::from_status(404, Some("NotFound"), "deleted")],
    );
    let m = migrator(&cluster, ProgressTracker::in_memory(), fast_config(10, 2));

    let report = m
        .migrate_resources(&[configmaps()], &CancellationToken::new())
        .await;

    assert!(report.is_success());
    assert_eq!(report.errors().count(), 0);
    assert_eq!(cluster.writes_of(&configmaps(), "configmaps-0"), 1);

    let gone = report
        .items
        .iter()
        .find(|o| o.object.as_ref() == Some(&identity("configmaps-1")))
        .unwrap();
    assert!(gone.skipped);
    assert!(gone.error.is_none());
}

#[tokio::test]
async fn test_terminal_failures_are_isolated_per_type() {
    let cluster = Arc::new(
        FakeCluster::new()
            .with_objects(configmaps(), 4)
            .with_objects(secrets(), 3),
    );
    cluster.break_writes(
        secrets(),
        ApiError::from_status(500, Some("InternalError"), "etcd is unhappy"),
    );
    let m = migrator(&cluster, ProgressTracker::in_memory(), fast_config(2, 2));

    let report = m
        .migrate_resources(&[configmaps(), secrets()], &CancellationToken::new())
        .await;

    assert_eq!(report.status, MigrationStatus::Failure);

    let a: Vec<_> = report.for_resource(&configmaps()).collect();
    assert_eq!(a.len(), 4);
    assert!(a.iter().all(|o| !o.is_error()));

    let b: Vec<_> = report.for_resource(&secrets()).collect();
    assert_eq!(b.len(), 3);
    assert!(b.iter().all(|o| o.is_error() && o.object.is_some()));
}

#[tokio::test]
async fn test_terminal_list_error_fails_only_that_type() {
    let cluster = Arc::new(
        FakeCluster::new()
            .with_objects(configmaps(), 2)
            .with_objects(secrets(), 2),
    );
    cluster.fail_lists(
        configmaps(),
        vec![ApiError::from_status(405, Some("MethodNotAllowed"), "list not allowed")],
    );
    let m = migrator(&cluster, ProgressTracker::in_memory(), fast_config(10, 1));

    let report = m
        .migrate_resources(&[configmaps(), secrets()], &CancellationToken::new())
        .await;

    assert_eq!(report.status, MigrationStatus::Failure);
    let failed: Vec<_> = report.for_resource(&configmaps()).collect();
    assert_eq!(failed.len(), 1);
    assert!(failed[0].object.is_none());
    assert!(failed[0]
        .error
        .as_deref()
        .unwrap()
        .starts_with("could not list resources"));
    assert_eq!(report.for_resource(&secrets()).filter(|o| !o.is_error()).count(), 2);
}

#[tokio::test]
async fn test_retriable_list_errors_reuse_the_same_token() {
    let cluster = Arc::new(FakeCluster::new().with_objects(secrets(), 2));
    cluster.fail_lists(
        secrets(),
        vec![ApiError::from_status(429, Some("TooManyRequests"), "slow down")],
    );
    let m = migrator(&cluster, ProgressTracker::in_memory(), fast_config(10, 1));

    let report = m
        .migrate_resources(&[secrets()], &CancellationToken::new())
        .await;

    assert!(report.is_success());
    assert_eq!(cluster.list_calls(&secrets()), vec!["", ""]);
}

#[tokio::test]
async fn test_cancelled_run_resumes_from_checkpoint() {
    let cluster = Arc::new(
        FakeCluster::new()
            .with_objects(configmaps(), 2)
            .with_objects(secrets(), 6),
    );
    let store = Arc::new(MemoryProgressStore::default());

    // configmaps: 2 writes; secrets pages [0,1] [2,3] [4,5]; stop inside the third page
    let cancel = CancellationToken::new();
    cluster.cancel_after_writes(7, cancel.clone());
    let first = migrator(&cluster, ProgressTracker::new(store.clone()), fast_config(2, 1))
        .migrate_resources(&[configmaps(), secrets()], &cancel)
        .await;

    assert_eq!(first.status, MigrationStatus::Failure);
    let interrupted: Vec<_> = first
        .for_resource(&secrets())
        .filter(|o| o.object.is_none())
        .collect();
    assert_eq!(interrupted.len(), 1);
    assert!(interrupted[0].error.as_deref().unwrap().contains("cancelled"));
    assert_eq!(cluster.writes_of(&secrets(), "secrets-5"), 0);

    cluster.clear_list_calls();
    cluster.cancel_after_writes(usize::MAX, CancellationToken::new());
    let second = migrator(&cluster, ProgressTracker::new(store.clone()), fast_config(2, 1))
        .migrate_resources(&[configmaps(), secrets()], &CancellationToken::new())
        .await;

    assert!(second.is_success());
    // Finished type skipped, interrupted type resumed at the last checkpoint
    assert!(cluster.list_calls(&configmaps()).is_empty());
    assert_eq!(cluster.list_calls(&secrets()), vec!["tok-4"]);
    assert_eq!(cluster.writes_of(&secrets(), "secrets-0"), 1);
    assert_eq!(cluster.writes_of(&secrets(), "secrets-4"), 2);
    assert_eq!(cluster.writes_of(&secrets(), "secrets-5"), 1);

    // A finished run leaves nothing to resume
    let tracker = ProgressTracker::new(store);
    assert_eq!(tracker.load(&secrets()).await.unwrap(), "");
    assert!(!tracker.is_complete(&configmaps()).await.unwrap());
}

#[tokio::test]
async fn test_cancellation_before_start_records_nothing_migrated() {
    let cluster = Arc::new(FakeCluster::new().with_objects(configmaps(), 3));
    let cancel = CancellationToken::new();
    cancel.cancel();
    let m = migrator(&cluster, ProgressTracker::in_memory(), fast_config(10, 1));

    let report = m.migrate_resources(&[configmaps(), secrets()], &cancel).await;

    assert!(migrated(&report).is_empty());
    assert!(cluster.list_calls(&configmaps()).is_empty());
    assert_eq!(report.status, MigrationStatus::Failure);
    // Every type never reached is abandoned explicitly
    for resource in [configmaps(), secrets()] {
        let abandoned: Vec<_> = report.for_resource(&resource).collect();
        assert_eq!(abandoned.len(), 1);
        assert!(abandoned[0].object.is_none());
        assert!(abandoned[0].is_cancelled());
    }
}

#[tokio::test]
async fn test_type_finished_as_cancellation_lands_is_checkpointed_complete() {
    let cluster = Arc::new(
        FakeCluster::new()
            .with_objects(configmaps(), 2)
            .with_objects(secrets(), 2),
    );
    let store = Arc::new(MemoryProgressStore::default());

    // The last configmaps write cancels the run
    let cancel = CancellationToken::new();
    cluster.cancel_after_writes(2, cancel.clone());
    let first = migrator(&cluster, ProgressTracker::new(store.clone()), fast_config(10, 1))
        .migrate_resources(&[configmaps(), secrets()], &cancel)
        .await;

    assert_eq!(first.status, MigrationStatus::Failure);
    assert!(first.for_resource(&configmaps()).all(|o| !o.is_error()));
    assert_eq!(first.for_resource(&configmaps()).count(), 2);
    let abandoned: Vec<_> = first.for_resource(&secrets()).collect();
    assert_eq!(abandoned.len(), 1);
    assert!(abandoned[0].is_cancelled());

    let tracker = ProgressTracker::new(store.clone());
    assert!(tracker.is_complete(&configmaps()).await.unwrap());
    assert!(!tracker.is_complete(&secrets()).await.unwrap());

    cluster.clear_list_calls();
    cluster.cancel_after_writes(usize::MAX, CancellationToken::new());
    let second = migrator(&cluster, ProgressTracker::new(store), fast_config(10, 1))
        .migrate_resources(&[configmaps(), secrets()], &CancellationToken::new())
        .await;

    assert!(second.is_success());
    assert!(cluster.list_calls(&configmaps()).is_empty());
    assert_eq!(cluster.writes_of(&configmaps(), "configmaps-0"), 1);
    assert_eq!(cluster.writes_of(&secrets(), "secrets-1"), 1);
}

#[tokio::test]
async fn test_unknown_errors_fail_closed() {
    let cluster = Arc::new(FakeCluster::new().with_objects(configmaps(), 1));
    cluster.fail_writes(
        "configmaps-0",
        vec![ApiError::new(ApiErrorKind::Other, "admission webhook denied the request")],
    );
    let m = migrator(&cluster, ProgressTracker::in_memory(), fast_config(10, 1));

    let report = m
        .migrate_resources(&[configmaps()], &CancellationToken::new())
        .await;

    assert_eq!(report.status, MigrationStatus::Failure);
    let err = report.errors().next().unwrap();
    assert!(err.error.as_deref().unwrap().contains("can not retry"));
    assert_eq!(cluster.writes_of(&configmaps(), "configmaps-0"), 0);
}
