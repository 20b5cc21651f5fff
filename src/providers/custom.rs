//! Runtime provider overrides.
//!
//! Custom providers and the active-provider selection added at runtime are
//! kept in one document, persisted either as `custom_providers.json` or as a
//! row of the Supabase `app_config` table.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use super::{EndpointType, ProviderConfig};
use crate::supabase::SupabaseClient;

/// Which generation service a provider is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    Text,
    Image,
}

impl ServiceType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(Self::Text),
            "image" => Some(Self::Image),
            _ => None,
        }
    }
}

/// A provider added at runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CustomProvider {
    #[serde(rename = "type")]
    pub provider_type: String,
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub service_type: ServiceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_type: Option<EndpointType>,
    #[serde(default)]
    pub high_concurrency: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent: Option<usize>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl CustomProvider {
    pub fn to_provider_config(&self) -> ProviderConfig {
        ProviderConfig {
            provider_type: self.provider_type.clone(),
            api_key: self.api_key.clone(),
            base_url: self.base_url.clone(),
            model: self.model.clone(),
            endpoint_type: self.endpoint_type,
            high_concurrency: self.high_concurrency,
            max_concurrent: self.max_concurrent,
            ..ProviderConfig::default()
        }
    }
}

/// The persisted override document.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CustomProvidersDoc {
    #[serde(default)]
    pub custom_providers: BTreeMap<String, CustomProvider>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_text_provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_image_provider: Option<String>,
}

/// Persistence for the override document.
#[async_trait]
pub trait OverrideBackend: Send + Sync {
    /// Load the document, `None` when nothing has been stored yet.
    async fn load(&self) -> anyhow::Result<Option<CustomProvidersDoc>>;

    async fn save(&self, doc: &CustomProvidersDoc) -> anyhow::Result<()>;

    fn name(&self) -> &'static str;
}

/// JSON file backend.
pub struct FileOverrides {
    path: PathBuf,
}

impl FileOverrides {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl OverrideBackend for FileOverrides {
    async fn load(&self) -> anyhow::Result<Option<CustomProvidersDoc>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let contents = tokio::fs::read_to_string(&self.path).await?;
        Ok(Some(serde_json::from_str(&contents)?))
    }

    async fn save(&self, doc: &CustomProvidersDoc) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let contents = serde_json::to_string_pretty(doc)?;
        tokio::fs::write(&self.path, contents).await?;
        tracing::debug!("Saved provider overrides to {}", self.path.display());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "local"
    }
}

const CONFIG_TABLE: &str = "app_config";
const OVERRIDES_KEY: &str = "custom_providers";

#[derive(Debug, Serialize, Deserialize)]
struct ConfigRow {
    key: String,
    value: serde_json::Value,
    #[serde(default)]
    updated_at: Option<String>,
}

/// Supabase backend: one `app_config` row keyed `custom_providers`.
pub struct SupabaseOverrides {
    client: SupabaseClient,
}

impl SupabaseOverrides {
    pub fn new(client: SupabaseClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl OverrideBackend for SupabaseOverrides {
    async fn load(&self) -> anyhow::Result<Option<CustomProvidersDoc>> {
        let rows: Vec<ConfigRow> = self
            .client
            .select(CONFIG_TABLE, &format!("key=eq.{}", OVERRIDES_KEY))
            .await?;
        match rows.into_iter().next() {
            Some(row) => Ok(Some(serde_json::from_value(row.value)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, doc: &CustomProvidersDoc) -> anyhow::Result<()> {
        let row = ConfigRow {
            key: OVERRIDES_KEY.to_string(),
            value: serde_json::to_value(doc)?,
            updated_at: Some(chrono::Utc::now().to_rfc3339()),
        };
        self.client.upsert(CONFIG_TABLE, &row).await
    }

    fn name(&self) -> &'static str {
        "supabase"
    }
}

/// Store for runtime provider overrides.
#[derive(Clone)]
pub struct CustomProviderStore {
    backend: Arc<dyn OverrideBackend>,
}

impl CustomProviderStore {
    pub fn new(backend: Arc<dyn OverrideBackend>) -> Self {
        Self { backend }
    }

    pub fn storage_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Load the override document; a backend failure yields an empty document.
    pub async fn load(&self) -> CustomProvidersDoc {
        match self.backend.load().await {
            Ok(Some(doc)) => doc,
            Ok(None) => CustomProvidersDoc::default(),
            Err(e) => {
                tracing::warn!(
                    "Failed to load provider overrides from {} storage: {}",
                    self.backend.name(),
                    e
                );
                CustomProvidersDoc::default()
            }
        }
    }

    pub async fn get(&self, name: &str) -> Option<CustomProvider> {
        self.load().await.custom_providers.get(name).cloned()
    }

    /// Add or replace a custom provider.
    pub async fn add(&self, name: &str, provider: CustomProvider) -> anyhow::Result<()> {
        let mut doc = self.load().await;
        doc.custom_providers.insert(name.to_string(), provider);
        self.backend.save(&doc).await?;
        tracing::info!("Saved custom provider {}", name);
        Ok(())
    }

    /// Delete a custom provider. Clears the active selection when it pointed
    /// at the deleted provider. Returns false when it did not exist.
    pub async fn delete(&self, name: &str) -> anyhow::Result<bool> {
        let mut doc = self.load().await;
        if doc.custom_providers.remove(name).is_none() {
            return Ok(false);
        }
        if doc.active_text_provider.as_deref() == Some(name) {
            doc.active_text_provider = None;
        }
        if doc.active_image_provider.as_deref() == Some(name) {
            doc.active_image_provider = None;
        }
        self.backend.save(&doc).await?;
        tracing::info!("Deleted custom provider {}", name);
        Ok(true)
    }

    /// Select the active provider for a service.
    pub async fn set_active(&self, name: &str, service: ServiceType) -> anyhow::Result<()> {
        let mut doc = self.load().await;
        match service {
            ServiceType::Text => doc.active_text_provider = Some(name.to_string()),
            ServiceType::Image => doc.active_image_provider = Some(name.to_string()),
        }
        self.backend.save(&doc).await
    }
}
