//! Local JSON history backend.
//!
//! `{dir}/index.json` holds the listing (newest first) and every record is
//! stored in full as `{dir}/{id}.json`.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    page_count, HistoryBackend, HistoryError, HistoryRecord, HistoryStats, RecordImages,
    RecordPage, RecordStatus, RecordSummary, RecordUpdate,
};

#[derive(Debug, Default, Serialize, Deserialize)]
struct HistoryIndex {
    #[serde(default)]
    records: Vec<RecordSummary>,
}

pub struct FileHistory {
    dir: PathBuf,
    /// Serializes read-modify-write cycles on the index.
    lock: Mutex<()>,
}

impl FileHistory {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            lock: Mutex::new(()),
        }
    }

    fn index_path(&self) -> PathBuf {
        self.dir.join("index.json")
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    async fn load_index(&self) -> HistoryIndex {
        let path = self.index_path();
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("Ignoring unreadable history index {}: {}", path.display(), e);
                HistoryIndex::default()
            }),
            Err(_) => HistoryIndex::default(),
        }
    }

    async fn save_index(&self, index: &HistoryIndex) -> Result<(), HistoryError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let contents = serde_json::to_string_pretty(index)?;
        tokio::fs::write(self.index_path(), contents).await?;
        Ok(())
    }

    async fn read_record(&self, id: &str) -> Option<HistoryRecord> {
        if !super::is_safe_segment(id) {
            return None;
        }
        let contents = tokio::fs::read_to_string(self.record_path(id)).await.ok()?;
        match serde_json::from_str(&contents) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!("Ignoring unreadable history record {}: {}", id, e);
                None
            }
        }
    }

    async fn write_record(&self, record: &HistoryRecord) -> Result<(), HistoryError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let contents = serde_json::to_string_pretty(record)?;
        tokio::fs::write(self.record_path(&record.id), contents).await?;
        Ok(())
    }
}

#[async_trait]
impl HistoryBackend for FileHistory {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn create(
        &self,
        title: &str,
        outline: &serde_json::Value,
        task_id: Option<&str>,
    ) -> Result<String, HistoryError> {
        let _guard = self.lock.lock().await;
        let now = Utc::now();
        let record = HistoryRecord {
            id: Uuid::new_v4().to_string(),
            title: title.to_string(),
            created_at: now,
            updated_at: now,
            outline: outline.clone(),
            images: RecordImages {
                task_id: task_id.map(str::to_string),
                generated: Vec::new(),
            },
            status: RecordStatus::Draft,
            thumbnail: None,
        };
        self.write_record(&record).await?;

        let mut index = self.load_index().await;
        index.records.insert(0, record.summary());
        self.save_index(&index).await?;

        tracing::info!("Created history record {} ({})", record.id, title);
        Ok(record.id)
    }

    async fn get(&self, id: &str) -> Result<Option<HistoryRecord>, HistoryError> {
        Ok(self.read_record(id).await)
    }

    async fn update(&self, id: &str, update: &RecordUpdate) -> Result<bool, HistoryError> {
        let _guard = self.lock.lock().await;
        let Some(mut record) = self.read_record(id).await else {
            return Ok(false);
        };

        record.updated_at = Utc::now();
        if let Some(outline) = &update.outline {
            record.outline = outline.clone();
        }
        if let Some(images) = &update.images {
            record.images = images.clone();
        }
        if let Some(status) = update.status {
            record.status = status;
        }
        if let Some(thumbnail) = &update.thumbnail {
            record.thumbnail = Some(thumbnail.clone());
        }
        self.write_record(&record).await?;

        let mut index = self.load_index().await;
        match index.records.iter_mut().find(|r| r.id == id) {
            Some(entry) => *entry = record.summary(),
            None => index.records.insert(0, record.summary()),
        }
        self.save_index(&index).await?;
        Ok(true)
    }

    async fn delete(&self, id: &str) -> Result<bool, HistoryError> {
        let _guard = self.lock.lock().await;
        if self.read_record(id).await.is_none() {
            return Ok(false);
        }
        tokio::fs::remove_file(self.record_path(id)).await?;

        let mut index = self.load_index().await;
        index.records.retain(|r| r.id != id);
        self.save_index(&index).await?;

        tracing::info!("Deleted history record {}", id);
        Ok(true)
    }

    async fn list(
        &self,
        page: usize,
        page_size: usize,
        status: Option<RecordStatus>,
    ) -> Result<RecordPage, HistoryError> {
        let records: Vec<RecordSummary> = self
            .load_index()
            .await
            .records
            .into_iter()
            .filter(|r| status.map_or(true, |s| r.status == s))
            .collect();
        let total = records.len();
        let start = (page.saturating_sub(1)).saturating_mul(page_size);
        let page_records = records.into_iter().skip(start).take(page_size).collect();
        Ok(RecordPage::new(page_records, total, page, page_size))
    }

    async fn search(&self, keyword: &str) -> Result<Vec<RecordSummary>, HistoryError> {
        let keyword = keyword.to_lowercase();
        Ok(self
            .load_index()
            .await
            .records
            .into_iter()
            .filter(|r| r.title.to_lowercase().contains(&keyword))
            .collect())
    }

    async fn stats(&self) -> Result<HistoryStats, HistoryError> {
        let index = self.load_index().await;
        let mut by_status = BTreeMap::new();
        for record in &index.records {
            *by_status.entry(record.status.as_str().to_string()).or_insert(0) += 1;
        }
        Ok(HistoryStats {
            total: index.records.len(),
            by_status,
        })
    }

    async fn find_by_task(&self, task_id: &str) -> Result<Option<String>, HistoryError> {
        let index = self.load_index().await;
        if let Some(entry) = index
            .records
            .iter()
            .find(|r| r.task_id.as_deref() == Some(task_id))
        {
            return Ok(Some(entry.id.clone()));
        }

        // Index entries written before the task id was denormalized.
        for entry in index.records.iter().filter(|r| r.task_id.is_none()) {
            if let Some(record) = self.read_record(&entry.id).await {
                if record.images.task_id.as_deref() == Some(task_id) {
                    return Ok(Some(record.id));
                }
            }
        }
        Ok(None)
    }
}
