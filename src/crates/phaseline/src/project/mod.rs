//! Per-project database handles
//!
//! [`ProjectCache`] keeps a bounded number of project handles open. A lookup
//! refreshes the entry's recency; opening a project at capacity closes the
//! least recently used one first.

mod registry;

pub use registry::{ProjectEntry, ProjectRegistry};

use async_trait::async_trait;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::storage::SqliteStore;
use crate::{OrchestratorError, Result};

/// Default number of open project handles
pub const DEFAULT_CAPACITY: usize = 8;

/// Opens and closes project handles
#[async_trait]
pub trait HandleOpener: Send + Sync {
    type Handle: Clone + Send + Sync + 'static;

    async fn open(&self, project_id: &str, root: &Path) -> Result<Self::Handle>;

    async fn close(&self, project_id: &str, handle: Self::Handle);
}

/// Opens the SQLite database under `<project>/.phaseline/phaseline.db`
#[derive(Debug, Clone, Default)]
pub struct SqliteOpener;

impl SqliteOpener {
    pub fn database_path(root: &Path) -> PathBuf {
        root.join(".phaseline").join("phaseline.db")
    }
}

#[async_trait]
impl HandleOpener for SqliteOpener {
    type Handle = SqliteStore;

    async fn open(&self, project_id: &str, root: &Path) -> Result<SqliteStore> {
        let path = Self::database_path(root);
        debug!(project_id, path = ?path, "opening project database");
        Ok(SqliteStore::open(&path).await?)
    }

    async fn close(&self, project_id: &str, handle: SqliteStore) {
        debug!(project_id, "closing project database");
        handle.close().await;
    }
}

/// Cache diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub capacity: usize,
    pub open: usize,
    /// Most recently used first
    pub projects: Vec<String>,
}

struct LruState<H> {
    handles: HashMap<String, H>,
    /// Front is most recently used
    order: VecDeque<String>,
}

impl<H: Clone> LruState<H> {
    fn new() -> Self {
        Self {
            handles: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn touch(&mut self, id: &str) -> Option<H> {
        let handle = self.handles.get(id)?.clone();
        if let Some(pos) = self.order.iter().position(|k| k == id) {
            if let Some(key) = self.order.remove(pos) {
                self.order.push_front(key);
            }
        }
        Some(handle)
    }

    fn insert(&mut self, id: String, handle: H) {
        self.order.push_front(id.clone());
        self.handles.insert(id, handle);
    }

    fn pop_lru(&mut self) -> Option<(String, H)> {
        let id = self.order.pop_back()?;
        let handle = self.handles.remove(&id)?;
        Some((id, handle))
    }
}

/// Bounded LRU of open project handles
pub struct ProjectCache<O: HandleOpener> {
    registry: Arc<ProjectRegistry>,
    opener: O,
    capacity: usize,
    state: tokio::sync::Mutex<LruState<O::Handle>>,
}

impl<O: HandleOpener> ProjectCache<O> {
    pub fn new(registry: Arc<ProjectRegistry>, opener: O, capacity: usize) -> Self {
        Self {
            registry,
            opener,
            capacity: capacity.max(1),
            state: tokio::sync::Mutex::new(LruState::new()),
        }
    }

    pub fn registry(&self) -> &Arc<ProjectRegistry> {
        &self.registry
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Handle for a project, opening it on a miss
    pub async fn get(&self, project_id: &str) -> Result<O::Handle> {
        let mut state = self.state.lock().await;
        if let Some(handle) = state.touch(project_id) {
            return Ok(handle);
        }

        let root = self
            .registry
            .path(project_id)
            .ok_or_else(|| OrchestratorError::ProjectNotFound(project_id.to_string()))?;
        let handle = self.opener.open(project_id, &root).await?;

        while state.handles.len() >= self.capacity {
            let Some((evicted, old)) = state.pop_lru() else {
                break;
            };
            info!(project_id = %evicted, "evicting project handle");
            self.opener.close(&evicted, old).await;
        }
        state.insert(project_id.to_string(), handle.clone());
        Ok(handle)
    }

    /// Close every open handle
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        while let Some((id, handle)) = state.pop_lru() {
            self.opener.close(&id, handle).await;
        }
        state.handles.clear();
        state.order.clear();
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.handles.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn contains(&self, project_id: &str) -> bool {
        self.state.lock().await.handles.contains_key(project_id)
    }

    /// Open project IDs, most recently used first
    pub async fn ids(&self) -> Vec<String> {
        self.state.lock().await.order.iter().cloned().collect()
    }

    pub async fn stats(&self) -> CacheStats {
        let projects = self.ids().await;
        CacheStats {
            capacity: self.capacity,
            open: projects.len(),
            projects,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingOpener {
        opened: Mutex<Vec<String>>,
        closed: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl HandleOpener for Arc<RecordingOpener> {
        type Handle = String;

        async fn open(&self, project_id: &str, root: &Path) -> Result<String> {
            self.opened.lock().push(project_id.to_string());
            Ok(root.display().to_string())
        }

        async fn close(&self, project_id: &str, _handle: String) {
            self.closed.lock().push(project_id.to_string());
        }
    }

    fn registry() -> Arc<ProjectRegistry> {
        let registry = ProjectRegistry::new();
        for id in ["a", "b", "c"] {
            registry.register(id, format!("/projects/{}", id)).unwrap();
        }
        Arc::new(registry)
    }

    #[tokio::test]
    async fn test_hit_does_not_reopen() {
        let opener = Arc::new(RecordingOpener::default());
        let cache = ProjectCache::new(registry(), opener.clone(), 2);

        assert_eq!(cache.get("a").await.unwrap(), "/projects/a");
        cache.get("a").await.unwrap();
        assert_eq!(opener.opened.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_touch_changes_eviction_order() {
        let opener = Arc::new(RecordingOpener::default());
        let cache = ProjectCache::new(registry(), opener.clone(), 2);

        cache.get("a").await.unwrap();
        cache.get("b").await.unwrap();
        cache.get("a").await.unwrap();
        cache.get("c").await.unwrap();

        assert_eq!(*opener.closed.lock(), vec!["b".to_string()]);
        assert_eq!(cache.ids().await, vec!["c".to_string(), "a".to_string()]);
    }

    #[tokio::test]
    async fn test_unknown_project() {
        let cache = ProjectCache::new(registry(), Arc::new(RecordingOpener::default()), 2);
        let err = cache.get("zzz").await.unwrap_err();
        assert!(err.is_not_found());
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_close_all() {
        let opener = Arc::new(RecordingOpener::default());
        let cache = ProjectCache::new(registry(), opener.clone(), 3);
        cache.get("a").await.unwrap();
        cache.get("b").await.unwrap();
        cache.close().await;
        assert!(cache.is_empty().await);
        assert_eq!(opener.closed.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_sqlite_opener() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ProjectRegistry::new();
        registry.register("local", dir.path()).unwrap();
        let cache = ProjectCache::new(Arc::new(registry), SqliteOpener, 1);

        let store = cache.get("local").await.unwrap();
        store.health_check().await.unwrap();
        assert!(SqliteOpener::database_path(dir.path()).exists());
        cache.close().await;
        assert!(store.is_closed());
    }
}
