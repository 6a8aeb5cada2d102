//! Resumable checkpoints
//!
//! A [`ProgressStore`] is any durable record of [`ContinuationState`]. The
//! [`ProgressTracker`] in front of it retries writes that lost a
//! read-modify-write race; a checkpoint that still cannot be written is
//! logged and dropped, since that only costs re-listing on resume.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::migrator::{classify, pause, Backoff, BackoffConfig, ContinuationState, ResourceTypeRef, Verdict};

/// Attempts for one checkpoint write before giving up
const SAVE_ATTEMPTS: u32 = 6;

/// Durable record of checkpoints
#[async_trait]
pub trait ProgressStore: Send + Sync {
    async fn load(&self, resource: &ResourceTypeRef) -> Result<Option<ContinuationState>>;

    /// One read-modify-write attempt. Losing a race is reported as a
    /// conflict `Error::Api` so the tracker can retry.
    async fn save(&self, resource: &ResourceTypeRef, state: &ContinuationState) -> Result<()>;

    /// Forget every checkpoint
    async fn clear(&self) -> Result<()>;
}

/// Engine-facing checkpoint API
#[derive(Clone)]
pub struct ProgressTracker {
    store: Arc<dyn ProgressStore>,
    backoff: BackoffConfig,
}

impl ProgressTracker {
    pub fn new(store: Arc<dyn ProgressStore>) -> Self {
        Self {
            store,
            backoff: BackoffConfig {
                initial_delay_ms: 10,
                max_delay_ms: 5_000,
                multiplier: 5.0,
            },
        }
    }

    /// In-memory tracker; checkpoints do not survive the process
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryProgressStore::default()))
    }

    /// Token to start listing from; empty on a cold start
    pub async fn load(&self, resource: &ResourceTypeRef) -> Result<String> {
        Ok(self
            .store
            .load(resource)
            .await?
            .filter(|s| !s.completed)
            .map(|s| s.token)
            .unwrap_or_default())
    }

    /// Whether an interrupted earlier run already finished this type
    pub async fn is_complete(&self, resource: &ResourceTypeRef) -> Result<bool> {
        Ok(self
            .store
            .load(resource)
            .await?
            .map(|s| s.completed)
            .unwrap_or(false))
    }

    pub async fn save(&self, resource: &ResourceTypeRef, token: &str) {
        let state = ContinuationState {
            resource_type: Some(resource.clone()),
            token: token.to_string(),
            completed: false,
        };
        self.write(resource, &state).await;
    }

    pub async fn complete(&self, resource: &ResourceTypeRef) {
        let state = ContinuationState {
            resource_type: Some(resource.clone()),
            token: String::new(),
            completed: true,
        };
        self.write(resource, &state).await;
    }

    pub async fn reset(&self) -> Result<()> {
        self.store.clear().await
    }

    async fn write(&self, resource: &ResourceTypeRef, state: &ContinuationState) {
        // Checkpoint writes are never cut short; losing one only costs a re-list.
        let never = CancellationToken::new();
        let mut backoff = Backoff::new(&self.backoff);

        for attempt in 1..=SAVE_ATTEMPTS {
            let err = match self.store.save(resource, state).await {
                Ok(()) => {
                    debug!(resource = %resource, token = %state.token, completed = state.completed, "Checkpoint saved");
                    return;
                }
                Err(e) => e,
            };

            let retry = match err.as_api() {
                Some(api) if attempt < SAVE_ATTEMPTS => classify(api) == Verdict::Retriable,
                _ => false,
            };
            if !retry {
                warn!(resource = %resource, attempt, error = %err, "Failed to save checkpoint");
                return;
            }

            let wait = match err.as_api() {
                Some(api) => backoff.next_delay(api),
                None => return,
            };
            debug!(resource = %resource, attempt, error = %err, "Checkpoint write lost a race, retrying");
            pause(wait, &never).await;
        }
    }
}

/// Process-local store
#[derive(Debug, Default)]
pub struct MemoryProgressStore {
    states: Mutex<BTreeMap<ResourceTypeRef, ContinuationState>>,
}

#[async_trait]
impl ProgressStore for MemoryProgressStore {
    async fn load(&self, resource: &ResourceTypeRef) -> Result<Option<ContinuationState>> {
        Ok(self
            .states
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(resource)
            .cloned())
    }

    async fn save(&self, resource: &ResourceTypeRef, state: &ContinuationState) -> Result<()> {
        self.states
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(resource.clone(), state.clone());
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.states
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
        Ok(())
    }
}

/// JSON file keyed by `group/version/resource`, replaced atomically on
/// every write
#[derive(Debug)]
pub struct FileProgressStore {
    path: PathBuf,
    lock: tokio::sync::Mutex<()>,
}

impl FileProgressStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn key(resource: &ResourceTypeRef) -> String {
        format!("{}/{}/{}", resource.group, resource.version, resource.resource)
    }

    async fn read_all(&self) -> Result<BTreeMap<String, ContinuationState>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(BTreeMap::new()),
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                Error::progress(format!("corrupt progress file {}: {}", self.path.display(), e))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_all(&self, states: &BTreeMap<String, ContinuationState>) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(states)?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl ProgressStore for FileProgressStore {
    async fn load(&self, resource: &ResourceTypeRef) -> Result<Option<ContinuationState>> {
        let _guard = self.lock.lock().await;
        Ok(self.read_all().await?.remove(&Self::key(resource)))
    }

    async fn save(&self, resource: &ResourceTypeRef, state: &ContinuationState) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut states = self.read_all().await?;
        states.insert(Self::key(resource), state.clone());
        self.write_all(&states).await
    }

    async fn clear(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
