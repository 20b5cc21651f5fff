//! Image generation providers.
//!
//! Providers implement [`ImageGenerator`]. The only concrete adapter speaks
//! the OpenAI-compatible protocol, either through the images endpoint or
//! through chat completions that return the picture inside the message.

mod error;
mod openai_compatible;

pub use error::{ImageGenError, ImageGenErrorKind, RetryConfig};
pub use openai_compatible::OpenAiCompatibleGenerator;

use async_trait::async_trait;
use std::sync::Arc;

use crate::providers::ProviderConfig;

/// One image generation call.
#[derive(Debug, Clone, Default)]
pub struct GenerateRequest {
    pub prompt: String,
    /// Previously generated image used to keep the deck consistent.
    pub reference_image: Option<Arc<Vec<u8>>>,
    pub negative_prompt: Option<String>,
    /// User-supplied pictures passed along as extra context.
    pub context_images: Vec<Arc<Vec<u8>>>,
}

impl GenerateRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }
}

/// Trait for image generation backends.
#[async_trait]
pub trait ImageGenerator: Send + Sync {
    /// Generate one image and return its encoded bytes.
    ///
    /// Never returns empty bytes: a response without an image is an error.
    async fn generate(&self, request: &GenerateRequest) -> Result<Vec<u8>, ImageGenError>;
}

/// Build the generator for a provider entry.
pub async fn create(
    name: &str,
    config: &ProviderConfig,
) -> Result<Arc<dyn ImageGenerator>, ImageGenError> {
    match config.provider_type.as_str() {
        "openai_compatible" | "openai" | "image_api" => {
            let generator = OpenAiCompatibleGenerator::new(name, config).await?;
            Ok(Arc::new(generator))
        }
        other => Err(ImageGenError::config(format!(
            "Unsupported image provider type '{}' for provider '{}' (supported: openai_compatible)",
            other, name
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_rejects_unknown_type() {
        let config = ProviderConfig {
            provider_type: "midjourney".to_string(),
            api_key: "key".to_string(),
            base_url: "http://127.0.0.1:9".to_string(),
            ..ProviderConfig::default()
        };
        let err = create("mj", &config).await.err().unwrap();
        assert_eq!(err.kind, ImageGenErrorKind::Config);
        assert!(err.message.contains("midjourney"));
    }

    #[tokio::test]
    async fn test_create_requires_credentials() {
        let config = ProviderConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            ..ProviderConfig::default()
        };
        let err = create("empty", &config).await.err().unwrap();
        assert_eq!(err.kind, ImageGenErrorKind::Config);
        assert!(err.message.contains("API key"));
    }
}
