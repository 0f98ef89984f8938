//! Durable storage for step-wizard state.

use super::StepState;
use crate::error::Result;
use crate::types::ids::ThreadId;
use async_trait::async_trait;
use dashmap::DashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[async_trait]
pub trait StepStateStore: Send + Sync {
    async fn load(&self, thread_id: &ThreadId) -> Result<Option<StepState>>;
    async fn save(&self, thread_id: &ThreadId, state: &StepState) -> Result<()>;
    async fn clear(&self, thread_id: &ThreadId) -> Result<()>;
}

pub type SharedStepStateStore = Arc<dyn StepStateStore>;

/// One JSON file per thread under `dir`.
#[derive(Debug, Clone)]
pub struct FileStepStateStore {
    dir: PathBuf,
}

impl FileStepStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File of a thread. Bytes other than ASCII alphanumerics and `-` are
    /// written as `_XX`, so distinct ids never share a file.
    pub fn path_for(&self, thread_id: &ThreadId) -> PathBuf {
        let mut name = String::with_capacity(thread_id.as_str().len());
        for b in thread_id.as_str().bytes() {
            if b.is_ascii_alphanumeric() || b == b'-' {
                name.push(char::from(b));
            } else {
                name.push_str(&format!("_{:02X}", b));
            }
        }
        self.dir.join(format!("step-state-{}.json", name))
    }
}

#[async_trait]
impl StepStateStore for FileStepStateStore {
    async fn load(&self, thread_id: &ThreadId) -> Result<Option<StepState>> {
        let path = self.path_for(thread_id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice(&bytes) {
            Ok(state) => Ok(Some(state)),
            Err(e) => {
                tracing::warn!("ignoring unreadable step state {}: {}", path.display(), e);
                Ok(None)
            }
        }
    }

    async fn save(&self, thread_id: &ThreadId, state: &StepState) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(thread_id);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec(state)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn clear(&self, thread_id: &ThreadId) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(thread_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Debug, Default)]
pub struct InMemoryStepStateStore {
    states: DashMap<ThreadId, StepState>,
}

impl InMemoryStepStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedStepStateStore {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl StepStateStore for InMemoryStepStateStore {
    async fn load(&self, thread_id: &ThreadId) -> Result<Option<StepState>> {
        Ok(self.states.get(thread_id).map(|s| *s.value()))
    }

    async fn save(&self, thread_id: &ThreadId, state: &StepState) -> Result<()> {
        self.states.insert(thread_id.clone(), *state);
        Ok(())
    }

    async fn clear(&self, thread_id: &ThreadId) -> Result<()> {
        self.states.remove(thread_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStepStateStore::new(dir.path().join("steps"));
        let thread = ThreadId::new("T/1");
        assert_eq!(store.load(&thread).await.unwrap(), None);

        let state = StepState {
            current_step_index: 3,
            completed_steps_high_water_mark: 4,
        };
        store.save(&thread, &state).await.unwrap();
        assert!(store.path_for(&thread).ends_with("step-state-T_2F1.json"));
        assert_eq!(store.load(&thread).await.unwrap(), Some(state));

        store.clear(&thread).await.unwrap();
        store.clear(&thread).await.unwrap();
        assert_eq!(store.load(&thread).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_file_names_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStepStateStore::new(dir.path());
        let slash = ThreadId::new("a/b");
        let underscore = ThreadId::new("a_b");
        assert_ne!(store.path_for(&slash), store.path_for(&underscore));

        let state = StepState {
            current_step_index: 2,
            completed_steps_high_water_mark: 2,
        };
        store.save(&slash, &state).await.unwrap();
        assert_eq!(store.load(&underscore).await.unwrap(), None);
        assert_eq!(store.load(&slash).await.unwrap(), Some(state));
    }

    #[tokio::test]
    async fn test_file_store_ignores_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStepStateStore::new(dir.path());
        let thread = ThreadId::new("T1");
        std::fs::write(store.path_for(&thread), b"{oops").unwrap();
        assert_eq!(store.load(&thread).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_in_memory_store() {
        let store = InMemoryStepStateStore::new();
        let thread = ThreadId::new("T1");
        let state = StepState {
            current_step_index: 1,
            completed_steps_high_water_mark: 1,
        };
        store.save(&thread, &state).await.unwrap();
        assert_eq!(store.load(&thread).await.unwrap(), Some(state));
        store.clear(&thread).await.unwrap();
        assert_eq!(store.load(&thread).await.unwrap(), None);
    }
}
