//! Provider configuration endpoints.
//!
//! Every change here resets the image service so the next request picks up
//! the new configuration.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

use super::routes::AppState;
use crate::providers::{
    mask_api_key, test_provider_connection, ConfigError, ConnectionTestResult, CustomProvider,
    EndpointType, ProviderConfig, ServiceType,
};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/config", get(get_config).post(update_config))
        .route(
            "/api/custom-providers",
            get(list_custom_providers).post(add_custom_provider),
        )
        .route("/api/custom-providers/test", post(test_connection))
        .route("/api/custom-providers/:name", delete(delete_custom_provider))
        .route("/api/custom-providers/:name/set-active", post(set_active))
}

// ─────────────────────────────────────────────────────────────────────────────
// Request Types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct UpdateConfigBody {
    #[serde(default)]
    pub active_provider: Option<String>,
    #[serde(default)]
    pub providers: Option<BTreeMap<String, ProviderConfig>>,
}

fn default_provider_type() -> String {
    "openai_compatible".to_string()
}

#[derive(Debug, Deserialize)]
pub struct AddProviderBody {
    pub name: String,
    #[serde(rename = "type", default = "default_provider_type")]
    pub provider_type: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub service_type: String,
    #[serde(default)]
    pub endpoint_type: Option<EndpointType>,
    #[serde(default)]
    pub high_concurrency: bool,
    #[serde(default)]
    pub max_concurrent: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct SetActiveBody {
    pub service_type: String,
}

#[derive(Debug, Deserialize)]
pub struct TestConnectionBody {
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
}

fn config_error(e: ConfigError) -> (StatusCode, String) {
    tracing::error!("Provider configuration error: {}", e);
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

fn storage_error(e: anyhow::Error) -> (StatusCode, String) {
    tracing::error!("Failed to store provider overrides: {}", e);
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

fn parse_service_type(s: &str) -> Result<ServiceType, (StatusCode, String)> {
    ServiceType::parse(s).ok_or_else(|| {
        (
            StatusCode::BAD_REQUEST,
            format!("service_type must be 'text' or 'image', got '{}'", s),
        )
    })
}

fn masked_custom(provider: &CustomProvider) -> Value {
    let mut value = serde_json::to_value(provider).unwrap_or_default();
    if let Some(obj) = value.as_object_mut() {
        obj.insert("api_key".to_string(), Value::String(String::new()));
        obj.insert(
            "api_key_masked".to_string(),
            Value::String(mask_api_key(&provider.api_key)),
        );
    }
    value
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

/// GET /api/config - Image providers with masked keys.
async fn get_config(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, (StatusCode, String)> {
    let snapshot = state.providers.snapshot().await.map_err(config_error)?;
    let providers: BTreeMap<String, Value> = snapshot
        .providers
        .iter()
        .map(|(name, config)| (name.clone(), config.masked()))
        .collect();
    Ok(Json(json!({
        "success": true,
        "active_provider": snapshot.active_provider,
        "providers": providers,
        "custom_providers_storage": state.providers.overrides().storage_name(),
    })))
}

/// POST /api/config - Update `image_providers.yaml`.
///
/// An empty `api_key` keeps the stored key, so masked listings can be sent
/// back unchanged.
async fn update_config(
    State(state): State<Arc<AppState>>,
    Json(body): Json<UpdateConfigBody>,
) -> Result<Json<Value>, (StatusCode, String)> {
    let mut file = state.providers.load_providers_file().await.map_err(config_error)?;

    if let Some(providers) = body.providers {
        let custom = state.providers.overrides().load().await.custom_providers;
        let mut merged = BTreeMap::new();
        for (name, mut config) in providers {
            // Runtime overrides are managed through /api/custom-providers.
            if custom.contains_key(&name) {
                continue;
            }
            if config.api_key.is_empty() {
                if let Some(existing) = file.providers.get(&name) {
                    config.api_key = existing.api_key.clone();
                }
            }
            merged.insert(name, config);
        }
        file.providers = merged;
    }
    if let Some(active) = body.active_provider.filter(|a| !a.is_empty()) {
        file.active_provider = Some(active);
    }

    state
        .providers
        .save_providers_file(&file)
        .await
        .map_err(config_error)?;
    state.reset_image_service().await;
    Ok(Json(json!({ "success": true, "message": "Configuration saved" })))
}

/// GET /api/custom-providers - Runtime overrides with masked keys.
async fn list_custom_providers(State(state): State<Arc<AppState>>) -> Json<Value> {
    let doc = state.providers.overrides().load().await;
    let providers: BTreeMap<String, Value> = doc
        .custom_providers
        .iter()
        .map(|(name, provider)| (name.clone(), masked_custom(provider)))
        .collect();
    Json(json!({
        "success": true,
        "providers": providers,
        "active_text_provider": doc.active_text_provider,
        "active_image_provider": doc.active_image_provider,
        "storage": state.providers.overrides().storage_name(),
    }))
}

/// POST /api/custom-providers - Add or replace a runtime provider.
async fn add_custom_provider(
    State(state): State<Arc<AppState>>,
    Json(body): Json<AddProviderBody>,
) -> Result<Json<Value>, (StatusCode, String)> {
    let name = body.name.trim().to_string();
    if name.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "name is required".to_string()));
    }
    let service_type = parse_service_type(&body.service_type)?;
    if body.api_key.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            ConfigError::MissingApiKey(name).to_string(),
        ));
    }
    if body.base_url.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            ConfigError::MissingBaseUrl(name).to_string(),
        ));
    }

    let provider = CustomProvider {
        provider_type: body.provider_type,
        api_key: body.api_key,
        base_url: body.base_url,
        model: body.model,
        service_type,
        endpoint_type: body.endpoint_type,
        high_concurrency: body.high_concurrency,
        max_concurrent: body.max_concurrent,
        created_at: chrono::Utc::now(),
    };
    state
        .providers
        .overrides()
        .add(&name, provider)
        .await
        .map_err(storage_error)?;
    state.reset_image_service().await;
    Ok(Json(json!({ "success": true, "name": name })))
}

/// DELETE /api/custom-providers/:name
async fn delete_custom_provider(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<Value>, (StatusCode, String)> {
    let deleted = state
        .providers
        .overrides()
        .delete(&name)
        .await
        .map_err(storage_error)?;
    if !deleted {
        return Err((
            StatusCode::NOT_FOUND,
            format!("Custom provider {} not found", name),
        ));
    }
    state.reset_image_service().await;
    Ok(Json(json!({ "success": true })))
}

/// POST /api/custom-providers/:name/set-active
async fn set_active(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(body): Json<SetActiveBody>,
) -> Result<Json<Value>, (StatusCode, String)> {
    let service_type = parse_service_type(&body.service_type)?;
    let known = match service_type {
        ServiceType::Image => state
            .providers
            .snapshot()
            .await
            .map_err(config_error)?
            .providers
            .contains_key(&name),
        ServiceType::Text => state.providers.overrides().get(&name).await.is_some(),
    };
    if !known {
        return Err((
            StatusCode::NOT_FOUND,
            format!("Provider {} not found", name),
        ));
    }

    state
        .providers
        .overrides()
        .set_active(&name, service_type)
        .await
        .map_err(storage_error)?;
    if service_type == ServiceType::Image {
        state.reset_image_service().await;
    }
    Ok(Json(json!({ "success": true, "active": name })))
}

/// POST /api/custom-providers/test - Probe a provider's `/models` endpoint.
async fn test_connection(
    Json(body): Json<TestConnectionBody>,
) -> Result<Json<ConnectionTestResult>, (StatusCode, String)> {
    if body.base_url.is_empty() || body.api_key.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            "base_url and api_key are required".to_string(),
        ));
    }
    Ok(Json(
        test_provider_connection(&body.base_url, &body.api_key).await,
    ))
}
