//! Deck history.
//!
//! A history record describes one deck: title, outline, the task whose
//! directory holds the rendered pages, and a status derived from how many
//! pages exist on disk. Records live either in local JSON files or in the
//! Supabase `history_records` table; the backend can be switched at runtime.
//! Page images always stay on the local filesystem under
//! `{history_dir}/{task_id}/`.

mod file;
mod supabase;

pub use file::FileHistory;
pub use supabase::SupabaseHistory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::config::{HistoryStorage, SupabaseConfig};
use crate::supabase::SupabaseClient;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("History record not found: {0}")]
    NotFound(String),

    #[error("Task directory does not exist: {0}")]
    TaskDirMissing(String),

    #[error("Record {0} has no task images")]
    NoTaskImages(String),

    #[error("Invalid task id: {0}")]
    InvalidTaskId(String),

    #[error("Supabase is not configured; set SUPABASE_URL and SUPABASE_KEY")]
    SupabaseUnavailable,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Record status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Draft,
    Generating,
    Completed,
    Partial,
    Failed,
}

impl RecordStatus {
    pub const ALL: [RecordStatus; 5] = [
        Self::Draft,
        Self::Generating,
        Self::Completed,
        Self::Partial,
        Self::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Generating => "generating",
            Self::Completed => "completed",
            Self::Partial => "partial",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.as_str() == s)
    }

    /// Status implied by the number of pages found on disk.
    pub fn from_counts(actual: usize, expected: usize) -> Self {
        if actual == 0 {
            Self::Draft
        } else if actual >= expected {
            Self::Completed
        } else {
            Self::Partial
        }
    }
}

/// Images attached to a record.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RecordImages {
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub generated: Vec<String>,
}

/// Full record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryRecord {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub outline: serde_json::Value,
    #[serde(default)]
    pub images: RecordImages,
    pub status: RecordStatus,
    #[serde(default)]
    pub thumbnail: Option<String>,
}

impl HistoryRecord {
    pub fn summary(&self) -> RecordSummary {
        RecordSummary {
            id: self.id.clone(),
            title: self.title.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            status: self.status,
            thumbnail: self.thumbnail.clone(),
            page_count: page_count(&self.outline),
            task_id: self.images.task_id.clone(),
        }
    }
}

/// Listing entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordSummary {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: RecordStatus,
    #[serde(default)]
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub page_count: usize,
    #[serde(default)]
    pub task_id: Option<String>,
}

/// One page of a listing.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RecordPage {
    pub records: Vec<RecordSummary>,
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
    pub total_pages: usize,
}

impl RecordPage {
    pub fn new(records: Vec<RecordSummary>, total: usize, page: usize, page_size: usize) -> Self {
        Self {
            records,
            total,
            page,
            page_size,
            total_pages: total.div_ceil(page_size.max(1)),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct HistoryStats {
    pub total: usize,
    pub by_status: BTreeMap<String, usize>,
}

/// Partial update; `None` fields are left unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecordUpdate {
    #[serde(default)]
    pub outline: Option<serde_json::Value>,
    #[serde(default)]
    pub images: Option<RecordImages>,
    #[serde(default)]
    pub status: Option<RecordStatus>,
    #[serde(default)]
    pub thumbnail: Option<String>,
}

/// Number of pages in an outline document (`{"pages": [...]}`).
pub fn page_count(outline: &serde_json::Value) -> usize {
    outline
        .get("pages")
        .and_then(|p| p.as_array())
        .map(|p| p.len())
        .unwrap_or(0)
}

/// Storage for history records.
#[async_trait]
pub trait HistoryBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn create(
        &self,
        title: &str,
        outline: &serde_json::Value,
        task_id: Option<&str>,
    ) -> Result<String, HistoryError>;

    async fn get(&self, id: &str) -> Result<Option<HistoryRecord>, HistoryError>;

    /// Returns false when the record does not exist.
    async fn update(&self, id: &str, update: &RecordUpdate) -> Result<bool, HistoryError>;

    /// Returns false when the record does not exist.
    async fn delete(&self, id: &str) -> Result<bool, HistoryError>;

    /// Newest first. `page` is one-based.
    async fn list(
        &self,
        page: usize,
        page_size: usize,
        status: Option<RecordStatus>,
    ) -> Result<RecordPage, HistoryError>;

    /// Case-insensitive title search, newest first.
    async fn search(&self, keyword: &str) -> Result<Vec<RecordSummary>, HistoryError>;

    async fn stats(&self) -> Result<HistoryStats, HistoryError>;

    /// Id of the record attached to a task.
    async fn find_by_task(&self, task_id: &str) -> Result<Option<String>, HistoryError>;
}

/// Result of syncing a task directory into its history record.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SyncReport {
    pub task_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
    pub images_count: usize,
    pub images: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<RecordStatus>,
    /// The directory has no history record.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub no_record: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ScanAllReport {
    pub total_tasks: usize,
    pub synced: usize,
    pub failed: usize,
    pub orphan_tasks: Vec<String>,
    pub results: Vec<SyncReport>,
    pub errors: BTreeMap<String, String>,
}

/// File-listing sync called by the generation pipeline.
#[async_trait]
pub trait HistorySync: Send + Sync {
    async fn scan_and_sync_task_images(&self, task_id: &str) -> anyhow::Result<SyncReport>;
}

/// A task id is used as a directory name, so it must be a single path segment.
pub fn is_safe_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment != "."
        && segment != ".."
        && !segment.contains(['/', '\\', '\0'])
}

/// Page index encoded in a file name (`3.png` -> 3).
pub fn file_index(filename: &str) -> Option<u32> {
    filename.split('.').next().and_then(|s| s.parse().ok())
}

fn is_page_image(filename: &str) -> bool {
    let lower = filename.to_lowercase();
    !filename.starts_with("thumb_")
        && (lower.ends_with(".png") || lower.ends_with(".jpg") || lower.ends_with(".jpeg"))
}

/// Page images in a task directory, ordered by page index.
pub async fn list_task_images(task_dir: &Path) -> std::io::Result<Vec<String>> {
    let mut entries = tokio::fs::read_dir(task_dir).await?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if is_page_image(name) {
                files.push(name.to_string());
            }
        }
    }
    files.sort_by_key(|f| (file_index(f).unwrap_or(u32::MAX), f.clone()));
    Ok(files)
}

fn safe_title(title: &str) -> String {
    let cleaned: String = title
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '-' | '_'))
        .collect();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        "images".to_string()
    } else {
        cleaned.to_string()
    }
}

/// History records with a switchable backend.
pub struct HistoryService {
    history_dir: PathBuf,
    file: Arc<FileHistory>,
    supabase: RwLock<Option<Arc<SupabaseHistory>>>,
    mode: RwLock<HistoryStorage>,
}

pub type SharedHistory = Arc<HistoryService>;

impl HistoryService {
    pub fn new(
        history_dir: PathBuf,
        supabase: Option<SupabaseClient>,
        mode: HistoryStorage,
    ) -> Self {
        let mode = match (mode, &supabase) {
            (HistoryStorage::Supabase, None) => HistoryStorage::Local,
            (mode, _) => mode,
        };
        tracing::info!("History storage: {}", mode.as_str());
        Self {
            file: Arc::new(FileHistory::new(history_dir.clone())),
            history_dir,
            supabase: RwLock::new(supabase.map(|c| Arc::new(SupabaseHistory::new(c)))),
            mode: RwLock::new(mode),
        }
    }

    pub fn history_dir(&self) -> &Path {
        &self.history_dir
    }

    pub fn task_dir(&self, task_id: &str) -> Result<PathBuf, HistoryError> {
        if !is_safe_segment(task_id) {
            return Err(HistoryError::InvalidTaskId(task_id.to_string()));
        }
        Ok(self.history_dir.join(task_id))
    }

    pub async fn storage_mode(&self) -> HistoryStorage {
        *self.mode.read().await
    }

    /// Switch the record backend. Switching to Supabase with new
    /// credentials replaces the client.
    pub async fn set_storage_mode(
        &self,
        mode: HistoryStorage,
        credentials: Option<&SupabaseConfig>,
    ) -> Result<(), HistoryError> {
        if mode == HistoryStorage::Supabase {
            let mut supabase = self.supabase.write().await;
            if let Some(creds) = credentials {
                let client = SupabaseClient::from_config(creds)?;
                *supabase = Some(Arc::new(SupabaseHistory::new(client)));
            }
            if supabase.is_none() {
                return Err(HistoryError::SupabaseUnavailable);
            }
        }
        *self.mode.write().await = mode;
        tracing::info!("Switched history storage to {}", mode.as_str());
        Ok(())
    }

    async fn backend(&self) -> Arc<dyn HistoryBackend> {
        if *self.mode.read().await == HistoryStorage::Supabase {
            if let Some(supabase) = self.supabase.read().await.as_ref() {
                return supabase.clone();
            }
        }
        self.file.clone()
    }

    /// Create a record. A Supabase failure falls back to local files.
    pub async fn create_record(
        &self,
        title: &str,
        outline: &serde_json::Value,
        task_id: Option<&str>,
    ) -> Result<String, HistoryError> {
        let backend = self.backend().await;
        match backend.create(title, outline, task_id).await {
            Ok(id) => Ok(id),
            Err(e) if backend.name() != self.file.name() => {
                tracing::warn!(
                    "Failed to create history record in {}, using local files: {}",
                    backend.name(),
                    e
                );
                self.file.create(title, outline, task_id).await
            }
            Err(e) => Err(e),
        }
    }

    pub async fn get_record(&self, id: &str) -> Result<Option<HistoryRecord>, HistoryError> {
        self.backend().await.get(id).await
    }

    pub async fn update_record(&self, id: &str, update: &RecordUpdate) -> Result<bool, HistoryError> {
        self.backend().await.update(id, update).await
    }

    /// Delete a record and its task directory.
    pub async fn delete_record(&self, id: &str) -> Result<bool, HistoryError> {
        let backend = self.backend().await;
        let Some(record) = backend.get(id).await? else {
            return Ok(false);
        };

        if let Some(task_id) = record.images.task_id.as_deref() {
            if let Ok(task_dir) = self.task_dir(task_id) {
                if task_dir.is_dir() {
                    if let Err(e) = tokio::fs::remove_dir_all(&task_dir).await {
                        tracing::warn!(
                            "Failed to remove task directory {}: {}",
                            task_dir.display(),
                            e
                        );
                    }
                }
            }
        }

        backend.delete(id).await
    }

    pub async fn list_records(
        &self,
        page: usize,
        page_size: usize,
        status: Option<RecordStatus>,
    ) -> Result<RecordPage, HistoryError> {
        self.backend()
            .await
            .list(page.max(1), page_size.max(1), status)
            .await
    }

    pub async fn search_records(&self, keyword: &str) -> Result<Vec<RecordSummary>, HistoryError> {
        self.backend().await.search(keyword).await
    }

    pub async fn get_statistics(&self) -> Result<HistoryStats, HistoryError> {
        self.backend().await.stats().await
    }

    /// Sync the page files in a task directory into the task's record.
    pub async fn scan_task(&self, task_id: &str) -> Result<SyncReport, HistoryError> {
        let task_dir = self.task_dir(task_id)?;
        if !task_dir.is_dir() {
            return Err(HistoryError::TaskDirMissing(task_id.to_string()));
        }
        let images = list_task_images(&task_dir).await?;

        let backend = self.backend().await;
        let record = match backend.find_by_task(task_id).await? {
            Some(record_id) => backend.get(&record_id).await?,
            None => None,
        };

        let Some(record) = record else {
            return Ok(SyncReport {
                task_id: task_id.to_string(),
                record_id: None,
                images_count: images.len(),
                images,
                status: None,
                no_record: true,
            });
        };

        let status = RecordStatus::from_counts(images.len(), page_count(&record.outline));
        let update = RecordUpdate {
            outline: None,
            images: Some(RecordImages {
                task_id: Some(task_id.to_string()),
                generated: images.clone(),
            }),
            status: Some(status),
            thumbnail: images.first().cloned(),
        };
        backend.update(&record.id, &update).await?;
        tracing::debug!(
            "Synced {} images of task {} into record {} ({})",
            images.len(),
            task_id,
            record.id,
            status.as_str()
        );

        Ok(SyncReport {
            task_id: task_id.to_string(),
            record_id: Some(record.id),
            images_count: images.len(),
            images,
            status: Some(status),
            no_record: false,
        })
    }

    /// Sync every task directory under the history root.
    pub async fn scan_all_tasks(&self) -> Result<ScanAllReport, HistoryError> {
        if !self.history_dir.is_dir() {
            return Err(HistoryError::TaskDirMissing(
                self.history_dir.display().to_string(),
            ));
        }

        let mut task_ids = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.history_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    task_ids.push(name.to_string());
                }
            }
        }
        task_ids.sort();

        let mut report = ScanAllReport {
            total_tasks: task_ids.len(),
            synced: 0,
            failed: 0,
            orphan_tasks: Vec::new(),
            results: Vec::new(),
            errors: BTreeMap::new(),
        };
        for task_id in task_ids {
            match self.scan_task(&task_id).await {
                Ok(result) => {
                    if result.no_record {
                        report.orphan_tasks.push(task_id);
                    } else {
                        report.synced += 1;
                    }
                    report.results.push(result);
                }
                Err(e) => {
                    report.failed += 1;
                    report.errors.insert(task_id, e.to_string());
                }
            }
        }

        tracing::info!(
            "Scanned {} task directories: {} synced, {} orphaned, {} failed",
            report.total_tasks,
            report.synced,
            report.orphan_tasks.len(),
            report.failed
        );
        Ok(report)
    }

    /// Zip the page images of a record. Returns the download file name and
    /// the archive bytes; pages are named `page_{n}` counting from 1.
    pub async fn export_zip(&self, record_id: &str) -> Result<(String, Vec<u8>), HistoryError> {
        let record = self
            .get_record(record_id)
            .await?
            .ok_or_else(|| HistoryError::NotFound(record_id.to_string()))?;
        let task_id = record
            .images
            .task_id
            .clone()
            .ok_or_else(|| HistoryError::NoTaskImages(record_id.to_string()))?;
        let task_dir = self.task_dir(&task_id)?;
        if !task_dir.is_dir() {
            return Err(HistoryError::TaskDirMissing(task_id));
        }

        let mut files = Vec::new();
        for name in list_task_images(&task_dir).await? {
            let bytes = tokio::fs::read(task_dir.join(&name)).await?;
            files.push((name, bytes));
        }

        let archive = tokio::task::spawn_blocking(move || build_zip(files))
            .await
            .map_err(|e| anyhow::anyhow!("Zip task failed: {}", e))??;

        Ok((format!("{}.zip", safe_title(&record.title)), archive))
    }
}

fn archive_name(filename: &str) -> String {
    match file_index(filename) {
        Some(index) => {
            let ext = filename.rsplit('.').next().unwrap_or("png");
            format!("page_{}.{}", index + 1, ext)
        }
        None => filename.to_string(),
    }
}

fn build_zip(files: Vec<(String, Vec<u8>)>) -> Result<Vec<u8>, HistoryError> {
    let mut zip = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);
    for (name, bytes) in files {
        zip.start_file(archive_name(&name), options)?;
        zip.write_all(&bytes)?;
    }
    Ok(zip.finish()?.into_inner())
}

#[async_trait]
impl HistorySync for HistoryService {
    async fn scan_and_sync_task_images(&self, task_id: &str) -> anyhow::Result<SyncReport> {
        Ok(self.scan_task(task_id).await?)
    }
}
