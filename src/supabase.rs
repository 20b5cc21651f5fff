//! Minimal Supabase PostgREST client.
//!
//! Only the table operations the history store and provider overrides need:
//! select with filters, insert, patch, delete, upsert and exact counts.

use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;

use crate::config::SupabaseConfig;

/// Supabase client for PostgREST table operations.
#[derive(Clone)]
pub struct SupabaseClient {
    client: Client,
    url: String,
    service_role_key: String,
}

impl std::fmt::Debug for SupabaseClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupabaseClient")
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

impl SupabaseClient {
    /// Create a new Supabase client.
    pub fn new(url: &str, service_role_key: &str) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            client,
            url: url.trim_end_matches('/').to_string(),
            service_role_key: service_role_key.to_string(),
        })
    }

    pub fn from_config(config: &SupabaseConfig) -> anyhow::Result<Self> {
        Self::new(&config.url, &config.key)
    }

    /// Get the PostgREST URL.
    fn rest_url(&self) -> String {
        format!("{}/rest/v1", self.url)
    }

    fn table_url(&self, table: &str, query: &str) -> String {
        if query.is_empty() {
            format!("{}/{}", self.rest_url(), table)
        } else {
            format!("{}/{}?{}", self.rest_url(), table, query)
        }
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .header("apikey", &self.service_role_key)
            .header("Authorization", format!("Bearer {}", self.service_role_key))
    }

    /// Select rows. `query` is a raw PostgREST query string such as
    /// `id=eq.abc&order=created_at.desc`.
    pub async fn select<T: DeserializeOwned>(
        &self,
        table: &str,
        query: &str,
    ) -> anyhow::Result<Vec<T>> {
        let resp = self
            .authed(self.client.get(self.table_url(table, query)))
            .send()
            .await?;

        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            anyhow::bail!("Failed to select from {}: {} - {}", table, status, text);
        }

        Ok(serde_json::from_str(&text)?)
    }

    /// Insert a row and return the stored representation.
    pub async fn insert<B: Serialize, T: DeserializeOwned>(
        &self,
        table: &str,
        body: &B,
    ) -> anyhow::Result<T> {
        let resp = self
            .authed(self.client.post(self.table_url(table, "")))
            .header("Content-Type", "application/json")
            .header("Prefer", "return=representation")
            .json(body)
            .send()
            .await?;

        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            anyhow::bail!("Failed to insert into {}: {} - {}", table, status, text);
        }

        let rows: Vec<T> = serde_json::from_str(&text)?;
        rows.into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("No row returned from {}", table))
    }

    /// Insert or replace a row keyed by its primary key.
    pub async fn upsert<B: Serialize>(&self, table: &str, body: &B) -> anyhow::Result<()> {
        let resp = self
            .authed(self.client.post(self.table_url(table, "")))
            .header("Content-Type", "application/json")
            .header("Prefer", "resolution=merge-duplicates")
            .json(body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await?;
            anyhow::bail!("Failed to upsert into {}: {} - {}", table, status, text);
        }

        Ok(())
    }

    /// Patch rows matching `query`.
    pub async fn update(
        &self,
        table: &str,
        query: &str,
        updates: &serde_json::Value,
    ) -> anyhow::Result<()> {
        let resp = self
            .authed(self.client.patch(self.table_url(table, query)))
            .header("Content-Type", "application/json")
            .json(updates)
            .send()
            .await?;

        if !resp.status().is_success() {
            let text = resp.text().await?;
            anyhow::bail!("Failed to update {}: {}", table, text);
        }

        Ok(())
    }

    /// Delete rows matching `query`.
    pub async fn delete(&self, table: &str, query: &str) -> anyhow::Result<()> {
        let resp = self
            .authed(self.client.delete(self.table_url(table, query)))
            .send()
            .await?;

        if !resp.status().is_success() {
            let text = resp.text().await?;
            anyhow::bail!("Failed to delete from {}: {}", table, text);
        }

        Ok(())
    }

    /// Select rows together with the exact total count of matching rows.
    pub async fn select_with_count<T: DeserializeOwned>(
        &self,
        table: &str,
        query: &str,
    ) -> anyhow::Result<(Vec<T>, usize)> {
        let resp = self
            .authed(self.client.get(self.table_url(table, query)))
            .header("Prefer", "count=exact")
            .send()
            .await?;

        let status = resp.status();
        let total = resp
            .headers()
            .get("content-range")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range_total);
        let text = resp.text().await?;
        if !status.is_success() {
            anyhow::bail!("Failed to select from {}: {} - {}", table, status, text);
        }

        let rows: Vec<T> = serde_json::from_str(&text)?;
        let total = total.unwrap_or(rows.len());
        Ok((rows, total))
    }
}

/// Parse the total from a PostgREST `Content-Range` header (`0-19/57` or `*/0`).
fn parse_content_range_total(header: &str) -> Option<usize> {
    header.rsplit('/').next().and_then(|t| t.parse().ok())
}
