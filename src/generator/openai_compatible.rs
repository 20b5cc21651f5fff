//! OpenAI-compatible image client with automatic retry for transient errors.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use regex::Regex;
use reqwest::Client;
use serde_json::{json, Value};
use std::net::IpAddr;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use super::error::{ImageGenError, RetryConfig};
use super::{GenerateRequest, ImageGenerator};
use crate::providers::{EndpointType, ProviderConfig};

const IMAGES_TIMEOUT: Duration = Duration::from_secs(600);
const CHAT_TIMEOUT: Duration = Duration::from_secs(180);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);

/// Image payload found in a provider response.
#[derive(Debug, PartialEq)]
enum ImagePayload {
    Bytes(Vec<u8>),
    Url(String),
}

/// OpenAI-compatible image client.
pub struct OpenAiCompatibleGenerator {
    name: String,
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    endpoint_type: EndpointType,
    size: String,
    quality: String,
    retry_config: RetryConfig,
}

impl OpenAiCompatibleGenerator {
    /// Create a client for a provider entry. Resolves the upstream host once
    /// and pins it into the HTTP client.
    pub async fn new(name: &str, config: &ProviderConfig) -> Result<Self, ImageGenError> {
        if config.api_key.is_empty() {
            return Err(ImageGenError::config(format!(
                "Provider '{}' has no API key; edit the provider and set one",
                name
            )));
        }
        if config.base_url.is_empty() {
            return Err(ImageGenError::config(format!(
                "Provider '{}' has no base URL; edit the provider and set one",
                name
            )));
        }

        let endpoint_type = resolve_endpoint_type(config);
        let model = if config.model.is_empty() {
            "dall-e-3".to_string()
        } else {
            config.model.clone()
        };

        tracing::info!(
            "Image provider {}: model={}, endpoint={:?}",
            name,
            model,
            endpoint_type
        );

        Ok(Self {
            name: name.to_string(),
            client: pinned_client(&config.base_url).await,
            api_key: config.api_key.clone(),
            base_url: config.base_url.clone(),
            model,
            endpoint_type,
            size: config.default_size.clone(),
            quality: config.quality.clone(),
            retry_config: RetryConfig::default(),
        })
    }

    /// Replace the adapter retry policy.
    pub fn with_retry_config(mut self, retry_config: RetryConfig) -> Self {
        self.retry_config = retry_config;
        self
    }

    /// Parse Retry-After header if present.
    fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
        headers
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
    }

    async fn post_json(
        &self,
        url: &str,
        body: &Value,
        timeout: Duration,
    ) -> Result<Value, ImageGenError> {
        let response = self
            .client
            .post(url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .timeout(timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| ImageGenError::from_reqwest(url, &e))?;

        let status = response.status();
        let retry_after = Self::parse_retry_after(response.headers());
        let text = response
            .text()
            .await
            .map_err(|e| ImageGenError::from_reqwest(url, &e))?;

        if !status.is_success() {
            return Err(ImageGenError::from_status(
                status.as_u16(),
                &format!("{} (url: {}, model: {})", text, url, self.model),
                retry_after,
            ));
        }

        serde_json::from_str(&text).map_err(|e| {
            let preview: String = text.chars().take(1000).collect();
            ImageGenError::parse(format!(
                "Response from {} is not JSON ({}); the provider may have returned a queue notice or an HTML error page: {}",
                url, e, preview
            ))
        })
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, ImageGenError> {
        let response = self
            .client
            .get(url)
            .timeout(DOWNLOAD_TIMEOUT)
            .send()
            .await
            .map_err(|e| ImageGenError::from_reqwest("Image download", &e))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = Self::parse_retry_after(response.headers());
            return Err(ImageGenError::from_status(
                status.as_u16(),
                &format!("Failed to download image from {}", url),
                retry_after,
            ));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| ImageGenError::from_reqwest("Image download", &e))?;
        if bytes.is_empty() {
            return Err(ImageGenError::missing_image(format!(
                "Downloaded image from {} is empty",
                url
            )));
        }
        Ok(bytes.to_vec())
    }

    async fn resolve_payload(&self, payload: ImagePayload) -> Result<Vec<u8>, ImageGenError> {
        match payload {
            ImagePayload::Bytes(bytes) => Ok(bytes),
            ImagePayload::Url(url) => self.download(&url).await,
        }
    }

    /// Execute a single request without retry.
    async fn execute_request(&self, request: &GenerateRequest) -> Result<Vec<u8>, ImageGenError> {
        let prompt = prompt_text(request);
        match self.endpoint_type {
            EndpointType::Images => {
                if request.reference_image.is_some() || !request.context_images.is_empty() {
                    tracing::debug!(
                        "Provider {} uses the images endpoint; reference images are not sent",
                        self.name
                    );
                }
                let url = endpoint_url(&self.base_url, "images/generations");
                let body = images_body(&self.model, &prompt, &self.size, &self.quality);
                let result = self.post_json(&url, &body, IMAGES_TIMEOUT).await?;
                let payload = extract_images_payload(&result)?;
                self.resolve_payload(payload).await
            }
            EndpointType::Chat => {
                let url = endpoint_url(&self.base_url, "chat/completions");
                let body = chat_body(&self.model, &prompt, &self.size, request);
                let result = self.post_json(&url, &body, CHAT_TIMEOUT).await?;
                let payload = extract_chat_payload(&result)?;
                self.resolve_payload(payload).await
            }
        }
    }

    /// Execute a request with automatic retry for transient errors.
    async fn execute_with_retry(
        &self,
        request: &GenerateRequest,
    ) -> Result<Vec<u8>, ImageGenError> {
        let start = Instant::now();
        let mut attempt = 0;

        loop {
            match self.execute_request(request).await {
                Ok(bytes) => {
                    if attempt > 0 {
                        tracing::info!(
                            "Image request succeeded after {} retries (total time: {:?})",
                            attempt,
                            start.elapsed()
                        );
                    }
                    return Ok(bytes);
                }
                Err(error) => {
                    if !self.retry_config.should_retry(&error) {
                        tracing::error!("Image request failed (non-retryable): {}", error);
                        return Err(error);
                    }

                    if attempt + 1 >= self.retry_config.max_attempts {
                        tracing::error!(
                            "Image request failed after {} attempts (total time: {:?}): {}",
                            attempt + 1,
                            start.elapsed(),
                            error
                        );
                        return Err(ImageGenError::exhausted(attempt + 1, &error));
                    }

                    let delay = error.suggested_delay(attempt, &self.retry_config);
                    tracing::warn!(
                        "Image attempt {}/{} failed with {}, retrying in {:?}: {}",
                        attempt + 1,
                        self.retry_config.max_attempts,
                        error.kind,
                        delay,
                        error.message
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[async_trait]
impl ImageGenerator for OpenAiCompatibleGenerator {
    async fn generate(&self, request: &GenerateRequest) -> Result<Vec<u8>, ImageGenError> {
        tracing::debug!(
            "Sending image request to {}: model={}, endpoint={:?}",
            self.name,
            self.model,
            self.endpoint_type
        );
        self.execute_with_retry(request).await
    }
}

fn resolve_endpoint_type(config: &ProviderConfig) -> EndpointType {
    match config.endpoint_type {
        Some(endpoint) => endpoint,
        None if config.base_url.to_lowercase().contains("whisk") => {
            tracing::info!("Base URL looks like a whisk API, using the chat endpoint");
            EndpointType::Chat
        }
        None => EndpointType::Images,
    }
}

/// Build an HTTP client with the upstream host pinned to the address it
/// resolves to now. Resolution failure keeps normal hostname resolution.
async fn pinned_client(base_url: &str) -> Client {
    let mut builder = Client::builder();

    if let Ok(url) = url::Url::parse(base_url) {
        if let Some(host) = url.host_str() {
            let port = url.port_or_known_default().unwrap_or(443);
            if host.parse::<IpAddr>().is_err() {
                match tokio::net::lookup_host((host, port)).await {
                    Ok(mut addrs) => {
                        if let Some(addr) = addrs.next() {
                            tracing::info!("Resolved {} to {}", host, addr.ip());
                            builder = builder.resolve(host, addr);
                        }
                    }
                    Err(e) => {
                        tracing::warn!(
                            "DNS lookup for {} failed, using normal resolution: {}",
                            host,
                            e
                        );
                    }
                }
            }
        }
    }

    builder.build().unwrap_or_else(|e| {
        tracing::warn!("Failed to build pinned HTTP client, using defaults: {}", e);
        Client::new()
    })
}

/// Join a base URL and an API path without doubling a trailing `/v1`.
fn endpoint_url(base_url: &str, path: &str) -> String {
    let base = base_url.trim_end_matches('/');
    if base.ends_with("/v1") {
        format!("{}/{}", base, path)
    } else {
        format!("{}/v1/{}", base, path)
    }
}

fn prompt_text(request: &GenerateRequest) -> String {
    match request.negative_prompt.as_deref().map(str::trim) {
        Some(negative) if !negative.is_empty() => {
            format!("{}\n\nAvoid: {}", request.prompt, negative)
        }
        _ => request.prompt.clone(),
    }
}

fn images_body(model: &str, prompt: &str, size: &str, quality: &str) -> Value {
    let mut body = json!({
        "model": model,
        "prompt": prompt,
        "n": 1,
        "size": size,
        "response_format": "b64_json",
    });
    if !quality.is_empty() && model.starts_with("dall-e") {
        body["quality"] = json!(quality);
    }
    body
}

fn data_uri(bytes: &[u8]) -> String {
    let mime = image::guess_format(bytes)
        .map(|f| f.to_mime_type())
        .unwrap_or("image/png");
    format!("data:{};base64,{}", mime, BASE64.encode(bytes))
}

fn chat_body(model: &str, prompt: &str, size: &str, request: &GenerateRequest) -> Value {
    let images: Vec<&[u8]> = request
        .reference_image
        .iter()
        .chain(request.context_images.iter())
        .map(|img| img.as_slice())
        .collect();

    let content = if images.is_empty() {
        json!(prompt)
    } else {
        let mut parts = vec![json!({"type": "text", "text": prompt})];
        parts.extend(
            images
                .into_iter()
                .map(|img| json!({"type": "image_url", "image_url": {"url": data_uri(img)}})),
        );
        Value::Array(parts)
    };

    json!({
        "model": model,
        "messages": [{"role": "user", "content": content}],
        "max_tokens": 4096,
        "temperature": 1.0,
        "response_format": {"type": "image"},
        "size": size,
    })
}

fn decode_base64(data: &str) -> Result<Vec<u8>, ImageGenError> {
    let cleaned: String = data.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = BASE64
        .decode(cleaned.as_bytes())
        .map_err(|e| ImageGenError::parse(format!("Invalid base64 image data: {}", e)))?;
    if bytes.is_empty() {
        return Err(ImageGenError::missing_image("Decoded image data is empty"));
    }
    Ok(bytes)
}

fn preview(value: &Value) -> String {
    value.to_string().chars().take(500).collect()
}

/// `data[0].b64_json` or `data[0].url`.
fn extract_images_payload(body: &Value) -> Result<ImagePayload, ImageGenError> {
    let first = body
        .get("data")
        .and_then(Value::as_array)
        .and_then(|data| data.first())
        .ok_or_else(|| {
            ImageGenError::missing_image(format!(
                "Provider returned no image data; the prompt may have been filtered or the model cannot generate images: {}",
                preview(body)
            ))
        })?;

    if let Some(b64) = first.get("b64_json").and_then(Value::as_str) {
        return Ok(ImagePayload::Bytes(decode_base64(b64)?));
    }
    if let Some(url) = first.get("url").and_then(Value::as_str) {
        return Ok(ImagePayload::Url(url.to_string()));
    }

    Err(ImageGenError::missing_image(format!(
        "Image entry has neither b64_json nor url: {}",
        preview(first)
    )))
}

fn markdown_image_link(text: &str) -> Option<&str> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"!\[[^\]]*\]\(\s*([^)\s]+)\s*\)").ok())
        .as_ref()?
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

/// Image carried in a chat message string.
fn payload_from_text(text: &str) -> Option<ImagePayload> {
    let text = text.trim();

    if text.starts_with("data:image") {
        let (_, data) = text.split_once(',')?;
        return decode_base64(data).ok().map(ImagePayload::Bytes);
    }
    if let Some(target) = markdown_image_link(text) {
        return payload_from_text(target);
    }
    if text.starts_with("http://") || text.starts_with("https://") {
        return Some(ImagePayload::Url(text.to_string()));
    }
    if text.len() > 100 {
        return decode_base64(text).ok().map(ImagePayload::Bytes);
    }
    None
}

fn payload_from_part(part: &Value) -> Option<ImagePayload> {
    if let Some(image_url) = part.get("image_url") {
        let url = image_url
            .as_str()
            .or_else(|| image_url.get("url").and_then(Value::as_str))?;
        return payload_from_text(url);
    }
    part.get("text")
        .and_then(Value::as_str)
        .and_then(payload_from_text)
}

/// `choices[0].message`, then the images shape as a fallback.
fn extract_chat_payload(body: &Value) -> Result<ImagePayload, ImageGenError> {
    if let Some(message) = body
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|c| c.first())
        .and_then(|c| c.get("message"))
    {
        let from_content = match message.get("content") {
            Some(Value::String(text)) => payload_from_text(text),
            Some(Value::Array(parts)) => parts.iter().find_map(payload_from_part),
            _ => None,
        };
        if let Some(payload) = from_content {
            return Ok(payload);
        }

        if let Some(payload) = message
            .get("images")
            .and_then(Value::as_array)
            .and_then(|images| images.iter().find_map(payload_from_part))
        {
            return Ok(payload);
        }
    }

    extract_images_payload(body).map_err(|_| {
        ImageGenError::missing_image(format!(
            "No image found in chat response; the provider may not support image generation over chat, try endpoint_type: images: {}",
            preview(body)
        ))
    })
}
