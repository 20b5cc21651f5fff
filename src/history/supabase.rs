//! Supabase history backend (`history_records` table).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::{
    page_count, HistoryBackend, HistoryError, HistoryRecord, HistoryStats, RecordImages,
    RecordPage, RecordStatus, RecordSummary, RecordUpdate,
};
use crate::supabase::SupabaseClient;

const TABLE: &str = "history_records";

/// Row of `history_records`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct HistoryRow {
    id: String,
    title: String,
    #[serde(default)]
    outline: serde_json::Value,
    #[serde(default)]
    task_id: Option<String>,
    #[serde(default)]
    images: Option<RecordImages>,
    status: RecordStatus,
    #[serde(default)]
    thumbnail: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<HistoryRow> for HistoryRecord {
    fn from(row: HistoryRow) -> Self {
        let images = row.images.unwrap_or_else(|| RecordImages {
            task_id: row.task_id.clone(),
            generated: Vec::new(),
        });
        Self {
            id: row.id,
            title: row.title,
            created_at: row.created_at,
            updated_at: row.updated_at,
            outline: row.outline,
            images,
            status: row.status,
            thumbnail: row.thumbnail,
        }
    }
}

impl From<HistoryRow> for RecordSummary {
    fn from(row: HistoryRow) -> Self {
        Self {
            page_count: page_count(&row.outline),
            id: row.id,
            title: row.title,
            created_at: row.created_at,
            updated_at: row.updated_at,
            status: row.status,
            thumbnail: row.thumbnail,
            task_id: row.task_id,
        }
    }
}

pub struct SupabaseHistory {
    client: SupabaseClient,
}

impl SupabaseHistory {
    pub fn new(client: SupabaseClient) -> Self {
        Self { client }
    }
}

fn eq_filter(column: &str, value: &str) -> String {
    format!("{}=eq.{}", column, urlencoding::encode(value))
}

/// PATCH body for a partial update.
fn update_body(update: &RecordUpdate) -> Result<serde_json::Value, HistoryError> {
    let mut body = serde_json::Map::new();
    body.insert(
        "updated_at".to_string(),
        serde_json::Value::String(Utc::now().to_rfc3339()),
    );
    if let Some(outline) = &update.outline {
        body.insert("outline".to_string(), outline.clone());
    }
    if let Some(status) = update.status {
        body.insert("status".to_string(), serde_json::to_value(status)?);
    }
    if let Some(thumbnail) = &update.thumbnail {
        body.insert("thumbnail".to_string(), thumbnail.clone().into());
    }
    if let Some(images) = &update.images {
        body.insert("images".to_string(), serde_json::to_value(images)?);
        if let Some(task_id) = &images.task_id {
            body.insert("task_id".to_string(), task_id.clone().into());
        }
    }
    Ok(serde_json::Value::Object(body))
}

#[async_trait]
impl HistoryBackend for SupabaseHistory {
    fn name(&self) -> &'static str {
        "supabase"
    }

    async fn create(
        &self,
        title: &str,
        outline: &serde_json::Value,
        task_id: Option<&str>,
    ) -> Result<String, HistoryError> {
        let now = Utc::now();
        let row = HistoryRow {
            id: Uuid::new_v4().to_string(),
            title: title.to_string(),
            outline: outline.clone(),
            task_id: task_id.map(str::to_string),
            images: Some(RecordImages {
                task_id: task_id.map(str::to_string),
                generated: Vec::new(),
            }),
            status: RecordStatus::Draft,
            thumbnail: None,
            created_at: now,
            updated_at: now,
        };
        let stored: HistoryRow = self.client.insert(TABLE, &row).await?;
        tracing::info!("Created history record {} in Supabase", stored.id);
        Ok(stored.id)
    }

    async fn get(&self, id: &str) -> Result<Option<HistoryRecord>, HistoryError> {
        let rows: Vec<HistoryRow> = self
            .client
            .select(TABLE, &format!("select=*&{}", eq_filter("id", id)))
            .await?;
        Ok(rows.into_iter().next().map(HistoryRecord::from))
    }

    async fn update(&self, id: &str, update: &RecordUpdate) -> Result<bool, HistoryError> {
        if self.get(id).await?.is_none() {
            return Ok(false);
        }
        let body = update_body(update)?;
        self.client.update(TABLE, &eq_filter("id", id), &body).await?;
        Ok(true)
    }

    async fn delete(&self, id: &str) -> Result<bool, HistoryError> {
        if self.get(id).await?.is_none() {
            return Ok(false);
        }
        self.client.delete(TABLE, &eq_filter("id", id)).await?;
        tracing::info!("Deleted history record {} from Supabase", id);
        Ok(true)
    }

    async fn list(
        &self,
        page: usize,
        page_size: usize,
        status: Option<RecordStatus>,
    ) -> Result<RecordPage, HistoryError> {
        let offset = page.saturating_sub(1).saturating_mul(page_size);
        let mut query = format!(
            "select=*&order=created_at.desc&offset={}&limit={}",
            offset, page_size
        );
        if let Some(status) = status {
            query.push('&');
            query.push_str(&eq_filter("status", status.as_str()));
        }
        let (rows, total): (Vec<HistoryRow>, usize) =
            self.client.select_with_count(TABLE, &query).await?;
        let records = rows.into_iter().map(RecordSummary::from).collect();
        Ok(RecordPage::new(records, total, page, page_size))
    }

    async fn search(&self, keyword: &str) -> Result<Vec<RecordSummary>, HistoryError> {
        let query = format!(
            "select=*&title=ilike.*{}*&order=created_at.desc",
            urlencoding::encode(keyword)
        );
        let rows: Vec<HistoryRow> = self.client.select(TABLE, &query).await?;
        Ok(rows.into_iter().map(RecordSummary::from).collect())
    }

    async fn stats(&self) -> Result<HistoryStats, HistoryError> {
        let mut stats = HistoryStats {
            total: 0,
            by_status: BTreeMap::new(),
        };
        for status in RecordStatus::ALL {
            let query = format!("select=id&limit=0&{}", eq_filter("status", status.as_str()));
            let (_, count): (Vec<serde_json::Value>, usize) =
                self.client.select_with_count(TABLE, &query).await?;
            if count > 0 {
                stats.by_status.insert(status.as_str().to_string(), count);
                stats.total += count;
            }
        }
        Ok(stats)
    }

    async fn find_by_task(&self, task_id: &str) -> Result<Option<String>, HistoryError> {
        #[derive(Deserialize)]
        struct IdRow {
            id: String,
        }
        let rows: Vec<IdRow> = self
            .client
            .select(TABLE, &format!("select=id&{}", eq_filter("task_id", task_id)))
            .await?;
        Ok(rows.into_iter().next().map(|r| r.id))
    }
}
