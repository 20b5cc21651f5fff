//! Image provider configuration.
//!
//! The active provider and its settings are resolved from three layers, each
//! overriding the previous one:
//! 1. Environment defaults (`ACTIVE_IMAGE_PROVIDER`, `GEMINI_*`)
//! 2. `image_providers.yaml`
//! 3. Runtime overrides (custom providers, active selection)

mod custom;

pub use custom::{
    CustomProvider, CustomProviderStore, CustomProvidersDoc, FileOverrides, OverrideBackend,
    ServiceType, SupabaseOverrides,
};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Name of the provider injected from environment defaults.
pub const DEFAULT_PROVIDER: &str = "gemini";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Image provider '{name}' is not configured (available: {available})")]
    UnknownProvider { name: String, available: String },

    #[error("Image provider '{0}' has no API key; edit the provider and set one")]
    MissingApiKey(String),

    #[error("Image provider '{0}' has no base URL; edit the provider and set one")]
    MissingBaseUrl(String),

    #[error("Failed to read provider config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse provider config: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Upstream API shape used by an OpenAI-compatible provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointType {
    /// `/v1/images/generations`
    Images,
    /// `/v1/chat/completions` returning the image inside the message
    Chat,
}

fn default_provider_type() -> String {
    "openai_compatible".to_string()
}

fn default_size() -> String {
    "1024x1024".to_string()
}

fn default_quality() -> String {
    "standard".to_string()
}

/// Settings of one image provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderConfig {
    #[serde(rename = "type", default = "default_provider_type")]
    pub provider_type: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_type: Option<EndpointType>,
    /// Generate content pages through the worker pool instead of one by one.
    #[serde(default)]
    pub high_concurrency: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent: Option<usize>,
    #[serde(default = "default_size")]
    pub default_size: String,
    #[serde(default = "default_quality")]
    pub quality: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub negative_prompt: Option<String>,
    /// Provider-specific keys we do not interpret.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            provider_type: default_provider_type(),
            api_key: String::new(),
            base_url: String::new(),
            model: String::new(),
            endpoint_type: None,
            high_concurrency: false,
            max_concurrent: None,
            default_size: default_size(),
            quality: default_quality(),
            negative_prompt: None,
            extra: BTreeMap::new(),
        }
    }
}

impl ProviderConfig {
    /// Fill empty credential fields from `defaults`.
    fn fill_missing_from(&mut self, defaults: &ProviderConfig) {
        if self.api_key.is_empty() {
            self.api_key = defaults.api_key.clone();
        }
        if self.base_url.is_empty() {
            self.base_url = defaults.base_url.clone();
        }
        if self.model.is_empty() {
            self.model = defaults.model.clone();
        }
    }

    /// Copy with the API key masked for display.
    pub fn masked(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or_default();
        if let Some(obj) = value.as_object_mut() {
            obj.insert(
                "api_key_masked".to_string(),
                serde_json::Value::String(mask_api_key(&self.api_key)),
            );
            obj.insert("api_key".to_string(), serde_json::Value::String(String::new()));
        }
        value
    }
}

/// Contents of `image_providers.yaml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ImageProvidersFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_provider: Option<String>,
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,
}

/// Defaults read from the environment.
#[derive(Debug, Clone, Default)]
pub struct EnvDefaults {
    pub active_image_provider: Option<String>,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub model: Option<String>,
}

impl EnvDefaults {
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        Self {
            active_image_provider: var("ACTIVE_IMAGE_PROVIDER"),
            api_key: var("GEMINI_API_KEY"),
            base_url: var("GEMINI_BASE_URL"),
            model: var("GEMINI_IMAGE_MODEL"),
        }
    }

    fn default_provider(&self) -> ProviderConfig {
        ProviderConfig {
            api_key: self.api_key.clone().unwrap_or_default(),
            base_url: self.base_url.clone().unwrap_or_default(),
            model: self
                .model
                .clone()
                .unwrap_or_else(|| "gemini-3-image".to_string()),
            ..ProviderConfig::default()
        }
    }
}

/// Fully merged provider view at one point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct ProvidersSnapshot {
    pub active_provider: String,
    pub providers: BTreeMap<String, ProviderConfig>,
}

impl ProvidersSnapshot {
    pub fn provider_config(&self, name: &str) -> Result<ProviderConfig, ConfigError> {
        let config = self
            .providers
            .get(name)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownProvider {
                name: name.to_string(),
                available: self
                    .providers
                    .keys()
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(", "),
            })?;

        if config.api_key.is_empty() {
            return Err(ConfigError::MissingApiKey(name.to_string()));
        }

        Ok(config)
    }
}

/// Resolves the active image provider and its configuration.
#[derive(Clone)]
pub struct ProviderResolver {
    providers_path: PathBuf,
    env: EnvDefaults,
    overrides: CustomProviderStore,
}

impl ProviderResolver {
    pub fn new(providers_path: PathBuf, env: EnvDefaults, overrides: CustomProviderStore) -> Self {
        Self {
            providers_path,
            env,
            overrides,
        }
    }

    pub fn overrides(&self) -> &CustomProviderStore {
        &self.overrides
    }

    /// Read `image_providers.yaml`; a missing file is an empty document.
    pub async fn load_providers_file(&self) -> Result<ImageProvidersFile, ConfigError> {
        let contents = match tokio::fs::read_to_string(&self.providers_path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(ImageProvidersFile::default())
            }
            Err(e) => return Err(e.into()),
        };
        if contents.trim().is_empty() {
            return Ok(ImageProvidersFile::default());
        }
        Ok(serde_yaml::from_str(&contents)?)
    }

    pub async fn save_providers_file(&self, file: &ImageProvidersFile) -> Result<(), ConfigError> {
        if let Some(parent) = self.providers_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let contents = serde_yaml::to_string(file)?;
        tokio::fs::write(&self.providers_path, contents).await?;
        tracing::info!("Saved image providers to {}", self.providers_path.display());
        Ok(())
    }

    /// Merge all layers into one snapshot.
    pub async fn snapshot(&self) -> Result<ProvidersSnapshot, ConfigError> {
        let file = self.load_providers_file().await?;
        let mut providers = file.providers;

        let defaults = self.env.default_provider();
        match providers.get_mut(DEFAULT_PROVIDER) {
            Some(user) if user.api_key.is_empty() => user.fill_missing_from(&defaults),
            Some(_) => {}
            None => {
                providers.insert(DEFAULT_PROVIDER.to_string(), defaults);
            }
        }

        let mut active_provider = file
            .active_provider
            .filter(|a| !a.is_empty())
            .or_else(|| self.env.active_image_provider.clone())
            .unwrap_or_else(|| DEFAULT_PROVIDER.to_string());

        let overrides = self.overrides.load().await;
        for (name, custom) in overrides.custom_providers {
            if custom.service_type == ServiceType::Image {
                providers.insert(name, custom.to_provider_config());
            }
        }
        if let Some(active) = overrides.active_image_provider.filter(|a| !a.is_empty()) {
            active_provider = active;
        }

        Ok(ProvidersSnapshot {
            active_provider,
            providers,
        })
    }

    pub async fn get_active_image_provider(&self) -> Result<String, ConfigError> {
        Ok(self.snapshot().await?.active_provider)
    }

    pub async fn get_provider_config(&self, name: &str) -> Result<ProviderConfig, ConfigError> {
        self.snapshot().await?.provider_config(name)
    }

    /// Name and configuration of the active provider.
    pub async fn active_provider_config(&self) -> Result<(String, ProviderConfig), ConfigError> {
        let snapshot = self.snapshot().await?;
        let config = snapshot.provider_config(&snapshot.active_provider)?;
        Ok((snapshot.active_provider, config))
    }
}

/// Mask an API key, keeping the first and last four characters.
pub fn mask_api_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.is_empty() {
        return String::new();
    }
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}{}{}", head, "*".repeat(chars.len() - 8), tail)
}

/// Result of probing a provider's `/models` endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionTestResult {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub models: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    #[serde(default)]
    id: String,
}

/// Check that a provider accepts the key by listing its models.
pub async fn test_provider_connection(base_url: &str, api_key: &str) -> ConnectionTestResult {
    let url = format!("{}/models", base_url.trim_end_matches('/'));
    let result = async {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        let resp = client
            .get(&url)
            .header("Authorization", format!("Bearer {}", api_key))
            .send()
            .await?;
        let status = resp.status();
        let body = resp.text().await?;
        anyhow::Ok((status, body))
    }
    .await;

    match result {
        Ok((status, body)) if status.is_success() => {
            let models = serde_json::from_str::<ModelsResponse>(&body)
                .map(|m| {
                    m.data
                        .into_iter()
                        .map(|e| e.id)
                        .filter(|id| !id.is_empty())
                        .collect()
                })
                .unwrap_or_default();
            ConnectionTestResult {
                success: true,
                message: "Connection succeeded".to_string(),
                models,
                error: None,
            }
        }
        Ok((status, body)) => ConnectionTestResult {
            success: false,
            message: format!("Connection failed: HTTP {}", status.as_u16()),
            models: Vec::new(),
            error: Some(body),
        },
        Err(e) => ConnectionTestResult {
            success: false,
            message: format!("Connection test failed: {}", e),
            models: Vec::new(),
            error: Some(e.to_string()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn resolver(dir: &std::path::Path, env: EnvDefaults) -> ProviderResolver {
        let overrides = CustomProviderStore::new(Arc::new(FileOverrides::new(
            dir.join("custom_providers.json"),
        )));
        ProviderResolver::new(dir.join("image_providers.yaml"), env, overrides)
    }

    fn env_with_key() -> EnvDefaults {
        EnvDefaults {
            active_image_provider: None,
            api_key: Some("env-key".to_string()),
            base_url: Some("https://env.example.com/v1".to_string()),
            model: None,
        }
    }

    #[tokio::test]
    async fn test_defaults_without_yaml() {
        let temp = tempdir().unwrap();
        let resolver = resolver(temp.path(), env_with_key());

        assert_eq!(resolver.get_active_image_provider().await.unwrap(), "gemini");
        let config = resolver.get_provider_config("gemini").await.unwrap();
        assert_eq!(config.api_key, "env-key");
        assert_eq!(config.base_url, "https://env.example.com/v1");
        assert_eq!(config.model, "gemini-3-image");
        assert!(!config.high_concurrency);
    }

    #[tokio::test]
    async fn test_yaml_overrides_env_and_fills_empty_key() {
        let temp = tempdir().unwrap();
        std::fs::write(
            temp.path().join("image_providers.yaml"),
            r#"
active_provider: flux
providers:
  gemini:
    model: custom-gemini
  flux:
    type: openai_compatible
    api_key: flux-key
    base_url: https://flux.example.com
    model: flux-pro
    endpoint_type: chat
    high_concurrency: true
    max_concurrent: 4
    style_preset: anime
"#,
        )
        .unwrap();
        let resolver = resolver(temp.path(), env_with_key());

        let snapshot = resolver.snapshot().await.unwrap();
        assert_eq!(snapshot.active_provider, "flux");

        let gemini = snapshot.provider_config("gemini").unwrap();
        assert_eq!(gemini.api_key, "env-key");
        assert_eq!(gemini.model, "custom-gemini");

        let flux = snapshot.provider_config("flux").unwrap();
        assert_eq!(flux.endpoint_type, Some(EndpointType::Chat));
        assert!(flux.high_concurrency);
        assert_eq!(flux.max_concurrent, Some(4));
        assert_eq!(flux.extra.get("style_preset").unwrap(), "anime");
    }

    #[tokio::test]
    async fn test_runtime_override_wins() {
        let temp = tempdir().unwrap();
        let resolver = resolver(temp.path(), env_with_key());
        resolver
            .overrides()
            .add(
                "mine",
                CustomProvider {
                    provider_type: "openai_compatible".to_string(),
                    api_key: "mine-key".to_string(),
                    base_url: "https://mine.example.com".to_string(),
                    model: "m1".to_string(),
                    service_type: ServiceType::Image,
                    endpoint_type: None,
                    high_concurrency: true,
                    max_concurrent: Some(3),
                    created_at: chrono::Utc::now(),
                },
            )
            .await
            .unwrap();
        resolver
            .overrides()
            .set_active("mine", ServiceType::Image)
            .await
            .unwrap();

        let (name, config) = resolver.active_provider_config().await.unwrap();
        assert_eq!(name, "mine");
        assert_eq!(config.api_key, "mine-key");
        assert_eq!(config.max_concurrent, Some(3));
    }

    #[tokio::test]
    async fn test_missing_provider_and_key_errors() {
        let temp = tempdir().unwrap();
        let resolver = resolver(temp.path(), EnvDefaults::default());

        match resolver.get_provider_config("nope").await {
            Err(ConfigError::UnknownProvider { name, available }) => {
                assert_eq!(name, "nope");
                assert_eq!(available, "gemini");
            }
            other => panic!("unexpected result: {:?}", other),
        }

        assert!(matches!(
            resolver.get_provider_config("gemini").await,
            Err(ConfigError::MissingApiKey(_))
        ));
    }

    #[tokio::test]
    async fn test_save_providers_file_round_trip() {
        let temp = tempdir().unwrap();
        let resolver = resolver(temp.path(), env_with_key());
        assert_eq!(
            resolver.load_providers_file().await.unwrap(),
            ImageProvidersFile::default()
        );

        let mut file = ImageProvidersFile::default();
        file.active_provider = Some("gemini".to_string());
        file.providers.insert(
            "gemini".to_string(),
            ProviderConfig {
                api_key: "yaml-key".to_string(),
                base_url: "https://yaml.example.com".to_string(),
                ..ProviderConfig::default()
            },
        );
        resolver.save_providers_file(&file).await.unwrap();
        assert_eq!(resolver.load_providers_file().await.unwrap(), file);
    }

    #[test]
    fn test_mask_api_key() {
        assert_eq!(mask_api_key(""), "");
        assert_eq!(mask_api_key("short"), "*****");
        assert_eq!(mask_api_key("sk-1234567890"), "sk-1*****7890");
    }

    #[test]
    fn test_masked_config_hides_key() {
        let config = ProviderConfig {
            api_key: "sk-1234567890".to_string(),
            ..ProviderConfig::default()
        };
        let masked = config.masked();
        assert_eq!(masked["api_key"], "");
        assert_eq!(masked["api_key_masked"], "sk-1*****7890");
    }
}
