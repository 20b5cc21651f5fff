//! Shared state, router assembly and the server loop.

use std::sync::Arc;
use tokio::sync::RwLock;

use axum::{extract::State, http::HeaderValue, routing::get, Json, Router};
use serde_json::json;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::generation::{GenerationError, ImageService, SharedImageService};
use crate::history::{HistoryService, HistorySync, SharedHistory};
use crate::providers::{
    CustomProviderStore, EnvDefaults, FileOverrides, OverrideBackend, ProviderResolver,
    SupabaseOverrides,
};
use crate::supabase::SupabaseClient;
use crate::tasks::{self, SharedTaskStore, TaskStore};

use super::generation;
use super::history;
use super::providers;

/// Shared application state.
pub struct AppState {
    pub config: Config,
    /// Task state, shared by every image service instance.
    pub tasks: SharedTaskStore,
    pub history: SharedHistory,
    pub providers: ProviderResolver,
    /// Built on first use, dropped whenever provider configuration changes.
    image_service: RwLock<Option<SharedImageService>>,
}

impl AppState {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        Self::with_env(config, EnvDefaults::from_env())
    }

    /// State with explicit provider defaults instead of the environment.
    pub fn with_env(config: Config, env: EnvDefaults) -> anyhow::Result<Self> {
        let supabase = config
            .supabase
            .as_ref()
            .map(SupabaseClient::from_config)
            .transpose()?;

        let overrides: Arc<dyn OverrideBackend> = match &supabase {
            Some(client) => Arc::new(SupabaseOverrides::new(client.clone())),
            None => Arc::new(FileOverrides::new(config.custom_providers_path())),
        };
        let providers = ProviderResolver::new(
            config.image_providers_path(),
            env,
            CustomProviderStore::new(overrides),
        );

        let history = Arc::new(HistoryService::new(
            config.history_dir.clone(),
            supabase,
            config.history_storage,
        ));

        Ok(Self {
            config,
            tasks: Arc::new(TaskStore::new()),
            history,
            providers,
            image_service: RwLock::new(None),
        })
    }

    /// The image service for the active provider, built on first use.
    pub async fn image_service(&self) -> Result<SharedImageService, GenerationError> {
        if let Some(service) = self.image_service.read().await.as_ref() {
            return Ok(Arc::clone(service));
        }

        let mut slot = self.image_service.write().await;
        if let Some(service) = slot.as_ref() {
            return Ok(Arc::clone(service));
        }
        let history: Arc<dyn HistorySync> = self.history.clone();
        let service = Arc::new(
            ImageService::from_resolver(
                &self.providers,
                self.config.history_dir.clone(),
                history,
                Arc::clone(&self.tasks),
            )
            .await?,
        );
        *slot = Some(Arc::clone(&service));
        Ok(service)
    }

    /// Drop the current image service; the next request builds a new one.
    /// Runs already in flight keep the old instance.
    pub async fn reset_image_service(&self) {
        if self.image_service.write().await.take().is_some() {
            tracing::info!("Image service reset after configuration change");
        }
    }
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() || origins.iter().any(|o| o == "*") {
        return CorsLayer::permissive();
    }
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match o.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!("Ignoring invalid CORS origin: {}", o);
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Build the router for `state`.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/health/storage", get(storage_health))
        .merge(generation::routes())
        .merge(history::routes())
        .merge(providers::routes())
        .layer(cors_layer(&state.config.cors_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(&config.history_dir).await?;
    let state = Arc::new(AppState::new(config.clone())?);

    let sweeper = tasks::spawn_sweeper(
        Arc::clone(&state.tasks),
        config.task_ttl,
        config.task_sweep_interval,
    );

    // Surface provider problems at startup; requests retry the build.
    if let Err(e) = state.image_service().await {
        tracing::warn!("Image service not available yet: {}", e);
    }

    let app = app(Arc::clone(&state));
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on {}", addr);
    tracing::info!("History directory: {}", config.history_dir.display());

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweeper.abort();
    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "success": true,
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn storage_health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "success": true,
        "history_storage": state.history.storage_mode().await.as_str(),
        "custom_providers_storage": state.providers.overrides().storage_name(),
        "supabase_configured": state.config.supabase.is_some(),
        "history_dir": state.config.history_dir.display().to_string(),
    }))
}
