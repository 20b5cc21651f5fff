//! In-memory task state.
//!
//! Tracks which pages of each task have been generated or have failed, plus
//! the cover bytes used as reference image. Files on disk stay the durable
//! record; this store only mirrors in-flight and recent progress and is
//! pruned by [`TaskStore::evict_expired`].

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// State of one task.
#[derive(Debug, Clone)]
pub struct TaskState {
    pub total: usize,
    /// index -> filename
    pub generated: BTreeMap<u32, String>,
    /// index -> last error message
    pub failed: BTreeMap<u32, String>,
    pub cover_image: Option<Arc<Vec<u8>>>,
    pub full_outline: String,
    pub user_topic: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub last_touched: Instant,
    /// A pipeline or retry batch is working on this task.
    pub running: bool,
}

impl TaskState {
    fn new(total: usize, full_outline: String, user_topic: String) -> Self {
        Self {
            total,
            generated: BTreeMap::new(),
            failed: BTreeMap::new(),
            cover_image: None,
            full_outline,
            user_topic,
            created_at: chrono::Utc::now(),
            last_touched: Instant::now(),
            running: false,
        }
    }
}

/// Status view returned to callers.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TaskStatus {
    pub generated: BTreeMap<u32, String>,
    pub failed: BTreeMap<u32, String>,
    pub has_cover: bool,
}

/// Store for task state.
#[derive(Debug, Default)]
pub struct TaskStore {
    tasks: RwLock<HashMap<String, TaskState>>,
}

pub type SharedTaskStore = Arc<TaskStore>;

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a task, replacing any previous state under the same id.
    pub async fn create(&self, task_id: &str, total: usize, full_outline: &str, user_topic: &str) {
        let state = TaskState::new(total, full_outline.to_string(), user_topic.to_string());
        self.tasks.write().await.insert(task_id.to_string(), state);
    }

    /// Create the task if it is unknown, e.g. a retry after a restart.
    pub async fn ensure(&self, task_id: &str) {
        let mut tasks = self.tasks.write().await;
        tasks
            .entry(task_id.to_string())
            .or_insert_with(|| TaskState::new(0, String::new(), String::new()))
            .last_touched = Instant::now();
    }

    pub async fn get(&self, task_id: &str) -> Option<TaskState> {
        self.tasks.read().await.get(task_id).cloned()
    }

    #[cfg(test)]
    async fn contains(&self, task_id: &str) -> bool {
        self.tasks.read().await.contains_key(task_id)
    }

    pub async fn status(&self, task_id: &str) -> Option<TaskStatus> {
        self.tasks.read().await.get(task_id).map(|t| TaskStatus {
            generated: t.generated.clone(),
            failed: t.failed.clone(),
            has_cover: t.cover_image.is_some(),
        })
    }

    /// Record a written page. Removes the index from `failed`.
    pub async fn record_success(&self, task_id: &str, index: u32, filename: &str) {
        let mut tasks = self.tasks.write().await;
        if let Some(task) = tasks.get_mut(task_id) {
            task.failed.remove(&index);
            task.generated.insert(index, filename.to_string());
            task.last_touched = Instant::now();
        }
    }

    /// Record a failed page. Removes the index from `generated`.
    pub async fn record_failure(&self, task_id: &str, index: u32, error: &str) {
        let mut tasks = self.tasks.write().await;
        if let Some(task) = tasks.get_mut(task_id) {
            task.generated.remove(&index);
            task.failed.insert(index, error.to_string());
            task.last_touched = Instant::now();
        }
    }

    /// Store the cover bytes unless the task already has a cover.
    /// Returns whether the cover was stored.
    pub async fn set_cover_if_absent(&self, task_id: &str, bytes: Arc<Vec<u8>>) -> bool {
        let mut tasks = self.tasks.write().await;
        match tasks.get_mut(task_id) {
            Some(task) if task.cover_image.is_none() => {
                task.cover_image = Some(bytes);
                true
            }
            _ => false,
        }
    }

    pub async fn cover_image(&self, task_id: &str) -> Option<Arc<Vec<u8>>> {
        self.tasks
            .read()
            .await
            .get(task_id)
            .and_then(|t| t.cover_image.clone())
    }

    /// Outline and topic stored when the task was created.
    pub async fn context(&self, task_id: &str) -> (String, String) {
        self.tasks
            .read()
            .await
            .get(task_id)
            .map(|t| (t.full_outline.clone(), t.user_topic.clone()))
            .unwrap_or_default()
    }

    pub async fn set_running(&self, task_id: &str, running: bool) {
        let mut tasks = self.tasks.write().await;
        if let Some(task) = tasks.get_mut(task_id) {
            task.running = running;
            task.last_touched = Instant::now();
        }
    }

    pub async fn remove(&self, task_id: &str) -> bool {
        self.tasks.write().await.remove(task_id).is_some()
    }

    #[cfg(test)]
    async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    /// Drop tasks idle for longer than `ttl` that are not running.
    /// Returns the number of evicted tasks.
    pub async fn evict_expired(&self, ttl: Duration) -> usize {
        let mut tasks = self.tasks.write().await;
        let before = tasks.len();
        tasks.retain(|_, t| t.running || t.last_touched.elapsed() < ttl);
        before - tasks.len()
    }
}

/// Periodically evict idle tasks.
pub fn spawn_sweeper(
    store: SharedTaskStore,
    ttl: Duration,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let evicted = store.evict_expired(ttl).await;
            if evicted > 0 {
                tracing::info!("Evicted {} idle tasks", evicted);
            }
        }
    })
}
