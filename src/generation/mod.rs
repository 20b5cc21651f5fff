//! Deck image generation.
//!
//! [`ImageService`] renders the pages of one task: the cover first, then the
//! content pages either one by one or through a bounded worker pool, all of
//! them with the cover as reference image. Progress is reported as a stream
//! of [`GenerationEvent`]s.
//!
//! Each call spawns a coordinator task that owns every state update for the
//! run and pushes events into a channel; the returned stream only reads that
//! channel. Dropping the stream does not stop the run.

mod events;
mod worker;

#[cfg(test)]
mod tests;

pub use events::{FinishSummary, GenerationEvent, Phase, ProgressStatus};
pub use worker::{build_prompt, page_filename, thumbnail_filename, PageRetryPolicy};

use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::generator::{self, ImageGenError, ImageGenerator};
use crate::history::{is_safe_segment, HistorySync};
use crate::imaging;
use crate::providers::{ConfigError, ProviderConfig, ProviderResolver};
use crate::tasks::{SharedTaskStore, TaskStatus};
use worker::{GeneratedPage, PageContext, PageResult};

/// Default size of the content worker pool.
pub const DEFAULT_MAX_CONCURRENT: usize = 2;

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to initialize image provider: {0}")]
    Provider(#[from] ImageGenError),

    #[error("pages must not be empty")]
    EmptyPages,

    #[error("Invalid task id: {0}")]
    InvalidTaskId(String),
}

/// One slide. Index 0 is the cover.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Page {
    pub index: u32,
    #[serde(alias = "prompt", alias = "content", default)]
    pub image_prompt: String,
}

impl Page {
    pub fn new(index: u32, image_prompt: impl Into<String>) -> Self {
        Self {
            index,
            image_prompt: image_prompt.into(),
        }
    }
}

/// Input of [`ImageService::generate_images`].
#[derive(Debug, Clone, Default)]
pub struct GenerateImagesRequest {
    pub pages: Vec<Page>,
    pub task_id: Option<String>,
    pub full_outline: String,
    /// Raw user uploads; compressed before use.
    pub user_images: Vec<Vec<u8>>,
    pub user_topic: String,
}

/// Outcome of a single-page retry or regeneration.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SingleImageResult {
    pub success: bool,
    pub index: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
}

impl SingleImageResult {
    fn failure(index: u32, error: impl Into<String>) -> Self {
        Self {
            success: false,
            index,
            image_url: None,
            error: Some(error.into()),
            retryable: Some(true),
        }
    }
}

/// Settings of one service instance, taken from a provider config snapshot.
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    /// Root of the per-task image directories.
    pub history_root: PathBuf,
    pub provider_name: String,
    pub high_concurrency: bool,
    pub max_concurrent: usize,
    pub retry: PageRetryPolicy,
    pub negative_prompt: Option<String>,
    /// Bounding box user uploads are shrunk into.
    pub user_image_box: (u32, u32),
    pub user_image_quality: u8,
}

impl ServiceSettings {
    pub fn new(history_root: PathBuf) -> Self {
        Self {
            history_root,
            provider_name: String::new(),
            high_concurrency: false,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            retry: PageRetryPolicy::default(),
            negative_prompt: None,
            user_image_box: (2048, 2048),
            user_image_quality: 85,
        }
    }

    pub fn from_provider(name: &str, config: &ProviderConfig, history_root: PathBuf) -> Self {
        Self {
            provider_name: name.to_string(),
            high_concurrency: config.high_concurrency,
            max_concurrent: config
                .max_concurrent
                .filter(|n| *n > 0)
                .unwrap_or(DEFAULT_MAX_CONCURRENT),
            negative_prompt: config.negative_prompt.clone().filter(|n| !n.is_empty()),
            ..Self::new(history_root)
        }
    }
}

fn image_url(task_id: &str, filename: &str) -> String {
    format!("/api/images/{}/{}", task_id, filename)
}

type EventSender = mpsc::UnboundedSender<GenerationEvent>;

fn emit(tx: &EventSender, event: GenerationEvent) {
    // A closed channel means the client went away; the run continues.
    let _ = tx.send(event);
}

fn event_stream(
    mut rx: mpsc::UnboundedReceiver<GenerationEvent>,
) -> impl Stream<Item = GenerationEvent> + Send + 'static {
    async_stream::stream! {
        while let Some(event) = rx.recv().await {
            yield event;
        }
    }
}

/// Running totals of one batch.
#[derive(Default)]
struct BatchTally {
    images: Vec<String>,
    failed_indices: Vec<u32>,
}

/// Image generation service.
#[derive(Clone)]
pub struct ImageService {
    settings: Arc<ServiceSettings>,
    generator: Arc<dyn ImageGenerator>,
    history: Arc<dyn HistorySync>,
    tasks: SharedTaskStore,
}

pub type SharedImageService = Arc<ImageService>;

impl ImageService {
    pub fn new(
        settings: ServiceSettings,
        generator: Arc<dyn ImageGenerator>,
        history: Arc<dyn HistorySync>,
        tasks: SharedTaskStore,
    ) -> Self {
        Self {
            settings: Arc::new(settings),
            generator,
            history,
            tasks,
        }
    }

    /// Build a service for the active provider. Configuration problems
    /// surface here, before any task starts.
    pub async fn from_resolver(
        resolver: &ProviderResolver,
        history_root: PathBuf,
        history: Arc<dyn HistorySync>,
        tasks: SharedTaskStore,
    ) -> Result<Self, GenerationError> {
        let (name, config) = resolver.active_provider_config().await?;
        let generator = generator::create(&name, &config).await?;
        let settings = ServiceSettings::from_provider(&name, &config, history_root);
        tracing::info!(
            "Image service ready: provider={}, high_concurrency={}, max_concurrent={}",
            name,
            settings.high_concurrency,
            settings.max_concurrent
        );
        Ok(Self::new(settings, generator, history, tasks))
    }

    pub fn settings(&self) -> &ServiceSettings {
        &self.settings
    }

    fn task_dir(&self, task_id: &str) -> PathBuf {
        self.settings.history_root.join(task_id)
    }

    /// Path of an image file of a task, `None` for unsafe names.
    pub fn image_path(&self, task_id: &str, filename: &str) -> Option<PathBuf> {
        if is_safe_segment(task_id) && is_safe_segment(filename) {
            Some(self.task_dir(task_id).join(filename))
        } else {
            None
        }
    }

    pub async fn get_task_state(&self, task_id: &str) -> Option<TaskStatus> {
        self.tasks.status(task_id).await
    }

    /// Drop the in-memory state of a task. Files stay on disk.
    pub async fn cleanup_task(&self, task_id: &str) -> bool {
        self.tasks.remove(task_id).await
    }

    async fn sync_history(&self, task_id: &str) {
        match self.history.scan_and_sync_task_images(task_id).await {
            Ok(report) => tracing::debug!(
                "History sync for task {}: {} images",
                task_id,
                report.images_count
            ),
            Err(e) => tracing::warn!("History sync for task {} failed: {}", task_id, e),
        }
    }

    async fn prepare_task_dir(&self, task_id: &str) -> PathBuf {
        let dir = self.task_dir(task_id);
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            // Pages will fail on write and be reported individually.
            tracing::error!("Failed to create task directory {}: {}", dir.display(), e);
        }
        dir
    }

    /// Cover bytes from memory, else from `{task_dir}/0.png`.
    async fn reference_image(&self, task_id: &str) -> Option<Arc<Vec<u8>>> {
        if let Some(cover) = self.tasks.cover_image(task_id).await {
            return Some(cover);
        }
        let path = self.task_dir(task_id).join(page_filename(0));
        match tokio::fs::read(&path).await {
            Ok(bytes) if !bytes.is_empty() => {
                tracing::info!("Loaded cover for task {} from {}", task_id, path.display());
                Some(Arc::new(bytes))
            }
            _ => None,
        }
    }

    async fn compress_user_images(&self, images: Vec<Vec<u8>>) -> Vec<Arc<Vec<u8>>> {
        if images.is_empty() {
            return Vec::new();
        }
        let max = self.settings.user_image_box;
        let quality = self.settings.user_image_quality;
        let compressed = tokio::task::spawn_blocking(move || {
            images
                .iter()
                .enumerate()
                .filter_map(|(i, img)| match imaging::compress(img, max, Some(quality)) {
                    Some(out) => Some(Arc::new(out)),
                    None => {
                        tracing::warn!("Dropping user image {}: not a decodable image", i);
                        None
                    }
                })
                .collect::<Vec<_>>()
        })
        .await;

        compressed.unwrap_or_else(|e| {
            tracing::warn!("User image compression failed: {}", e);
            Vec::new()
        })
    }

    fn page_context(
        &self,
        task_dir: PathBuf,
        full_outline: String,
        user_topic: String,
        reference_image: Option<Arc<Vec<u8>>>,
        context_images: Vec<Arc<Vec<u8>>>,
    ) -> Arc<PageContext> {
        Arc::new(PageContext {
            generator: self.generator.clone(),
            task_dir,
            retry: self.settings.retry,
            negative_prompt: self.settings.negative_prompt.clone(),
            full_outline,
            user_topic,
            reference_image,
            context_images,
        })
    }

    /// Apply a page outcome to task state and report it.
    async fn record_outcome(
        &self,
        task_id: &str,
        index: u32,
        result: PageResult,
        phase: Option<Phase>,
        tally: &mut BatchTally,
        tx: &EventSender,
    ) {
        match result {
            Ok(GeneratedPage { filename, bytes }) => {
                self.tasks.record_success(task_id, index, &filename).await;
                if index == 0 && self.tasks.set_cover_if_absent(task_id, bytes).await {
                    tracing::debug!("Stored cover for task {}", task_id);
                }
                emit(
                    tx,
                    GenerationEvent::Complete {
                        index,
                        image_url: image_url(task_id, &filename),
                        phase,
                    },
                );
                tally.images.push(filename);
            }
            Err(message) => {
                self.tasks.record_failure(task_id, index, &message).await;
                emit(
                    tx,
                    GenerationEvent::Error {
                        index,
                        message,
                        phase,
                    },
                );
                tally.failed_indices.push(index);
            }
        }
    }

    /// Render all pages of a task.
    ///
    /// Events: cover progress and outcome, `batch_start`, per-page
    /// `generating` and outcome events, then one `finish`.
    pub fn generate_images(
        &self,
        request: GenerateImagesRequest,
    ) -> Result<impl Stream<Item = GenerationEvent> + Send + 'static, GenerationError> {
        if request.pages.is_empty() {
            return Err(GenerationError::EmptyPages);
        }
        let task_id = match request.task_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => uuid::Uuid::new_v4().to_string(),
        };
        if !is_safe_segment(&task_id) {
            return Err(GenerationError::InvalidTaskId(task_id));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let service = self.clone();
        tokio::spawn(async move {
            service.run_generation(task_id, request, tx).await;
        });
        Ok(event_stream(rx))
    }

    async fn run_generation(&self, task_id: String, request: GenerateImagesRequest, tx: EventSender) {
        let GenerateImagesRequest {
            pages,
            full_outline,
            user_images,
            user_topic,
            ..
        } = request;
        let total = pages.len();
        tracing::info!("Task {}: generating {} pages", task_id, total);

        self.tasks
            .create(&task_id, total, &full_outline, &user_topic)
            .await;
        self.tasks.set_running(&task_id, true).await;
        let task_dir = self.prepare_task_dir(&task_id).await;
        let user_images = self.compress_user_images(user_images).await;

        let mut tally = BatchTally::default();
        let (covers, content): (Vec<Page>, Vec<Page>) =
            pages.into_iter().partition(|p| p.index == 0);

        // Cover phase
        if let Some(cover) = covers.into_iter().next() {
            emit(
                &tx,
                GenerationEvent::Progress {
                    status: ProgressStatus::GeneratingCover,
                    index: Some(0),
                    message: Some("Generating cover".to_string()),
                    current: 1,
                    total,
                    phase: Phase::Cover,
                },
            );
            let ctx = self.page_context(
                task_dir.clone(),
                full_outline.clone(),
                user_topic.clone(),
                None,
                user_images.clone(),
            );
            let result = worker::run_page(ctx, cover).await;
            self.record_outcome(&task_id, 0, result, Some(Phase::Cover), &mut tally, &tx)
                .await;
        }

        // Content phase
        if !content.is_empty() {
            let reference = self.tasks.cover_image(&task_id).await;
            let ctx = self.page_context(task_dir, full_outline, user_topic, reference, user_images);
            let high_concurrency = self.settings.high_concurrency;
            let max_concurrent = self.settings.max_concurrent;

            let message = if high_concurrency {
                format!(
                    "Generating {} content pages concurrently (workers: {})",
                    content.len(),
                    max_concurrent
                )
            } else {
                format!("Generating {} content pages in order", content.len())
            };
            emit(
                &tx,
                GenerationEvent::Progress {
                    status: ProgressStatus::BatchStart,
                    index: None,
                    message: Some(message),
                    current: tally.images.len(),
                    total,
                    phase: Phase::Content,
                },
            );

            if high_concurrency {
                let current = tally.images.len() + 1;
                for page in &content {
                    emit(
                        &tx,
                        GenerationEvent::Progress {
                            status: ProgressStatus::Generating,
                            index: Some(page.index),
                            message: None,
                            current,
                            total,
                            phase: Phase::Content,
                        },
                    );
                }

                let mut pending = worker::spawn_pool(ctx, content, max_concurrent);
                while let Some((index, result)) = pending.next().await {
                    self.record_outcome(&task_id, index, result, Some(Phase::Content), &mut tally, &tx)
                        .await;
                }
            } else {
                for page in content {
                    let index = page.index;
                    emit(
                        &tx,
                        GenerationEvent::Progress {
                            status: ProgressStatus::Generating,
                            index: Some(index),
                            message: None,
                            current: tally.images.len() + 1,
                            total,
                            phase: Phase::Content,
                        },
                    );
                    let result = worker::run_page(ctx.clone(), page).await;
                    self.record_outcome(&task_id, index, result, Some(Phase::Content), &mut tally, &tx)
                        .await;
                }
            }
        }

        self.tasks.set_running(&task_id, false).await;
        tracing::info!(
            "Task {} finished: {} generated, {} failed",
            task_id,
            tally.images.len(),
            tally.failed_indices.len()
        );
        emit(
            &tx,
            GenerationEvent::Finish(FinishSummary {
                success: tally.failed_indices.is_empty(),
                task_id: task_id.clone(),
                completed: tally.images.len(),
                failed: tally.failed_indices.len(),
                images: tally.images,
                total,
                failed_indices: tally.failed_indices,
            }),
        );

        self.sync_history(&task_id).await;
    }

    /// Regenerate one page of a task.
    ///
    /// With `use_reference` the task's cover is passed as reference, read
    /// from `{task}/0.png` when the task is no longer in memory. A failure
    /// leaves the task state as it was.
    pub async fn retry_single_image(
        &self,
        task_id: &str,
        page: Page,
        use_reference: bool,
    ) -> SingleImageResult {
        let index = page.index;
        if !is_safe_segment(task_id) {
            return SingleImageResult::failure(index, format!("Invalid task id: {}", task_id));
        }

        let task_dir = self.prepare_task_dir(task_id).await;
        let reference = if use_reference && index != 0 {
            self.reference_image(task_id).await
        } else {
            None
        };
        let (full_outline, user_topic) = self.tasks.context(task_id).await;
        let ctx = self.page_context(task_dir, full_outline, user_topic, reference, Vec::new());

        let result = match worker::run_page(ctx, page).await {
            Ok(GeneratedPage { filename, bytes }) => {
                self.tasks.ensure(task_id).await;
                self.tasks.record_success(task_id, index, &filename).await;
                if index == 0 {
                    self.tasks.set_cover_if_absent(task_id, bytes).await;
                }
                SingleImageResult {
                    success: true,
                    index,
                    image_url: Some(image_url(task_id, &filename)),
                    error: None,
                    retryable: None,
                }
            }
            Err(message) => SingleImageResult::failure(index, message),
        };

        self.sync_history(task_id).await;
        result
    }

    /// Same as [`Self::retry_single_image`]; the existing file is replaced.
    pub async fn regenerate_image(
        &self,
        task_id: &str,
        page: Page,
        use_reference: bool,
    ) -> SingleImageResult {
        self.retry_single_image(task_id, page, use_reference).await
    }

    /// Retry a set of pages through the worker pool.
    ///
    /// Events: `retry_start`, one outcome per page in completion order,
    /// `retry_finish`.
    pub fn retry_failed_images(
        &self,
        task_id: &str,
        pages: Vec<Page>,
    ) -> Result<impl Stream<Item = GenerationEvent> + Send + 'static, GenerationError> {
        if pages.is_empty() {
            return Err(GenerationError::EmptyPages);
        }
        if !is_safe_segment(task_id) {
            return Err(GenerationError::InvalidTaskId(task_id.to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let service = self.clone();
        let task_id = task_id.to_string();
        tokio::spawn(async move {
            service.run_retry_batch(task_id, pages, tx).await;
        });
        Ok(event_stream(rx))
    }

    async fn run_retry_batch(&self, task_id: String, pages: Vec<Page>, tx: EventSender) {
        let total = pages.len();
        emit(
            &tx,
            GenerationEvent::RetryStart {
                total,
                message: format!("Retrying {} failed images", total),
            },
        );

        self.tasks.ensure(&task_id).await;
        self.tasks.set_running(&task_id, true).await;
        let task_dir = self.prepare_task_dir(&task_id).await;
        let reference = self.reference_image(&task_id).await;
        let (full_outline, user_topic) = self.tasks.context(&task_id).await;
        let ctx = self.page_context(task_dir, full_outline, user_topic, reference, Vec::new());

        let mut tally = BatchTally::default();
        let mut pending = worker::spawn_pool(ctx, pages, self.settings.max_concurrent);
        while let Some((index, result)) = pending.next().await {
            self.record_outcome(&task_id, index, result, None, &mut tally, &tx)
                .await;
        }

        self.tasks.set_running(&task_id, false).await;
        emit(
            &tx,
            GenerationEvent::RetryFinish {
                success: tally.failed_indices.is_empty(),
                total,
                completed: tally.images.len(),
                failed: tally.failed_indices.len(),
            },
        );

        self.sync_history(&task_id).await;
    }
}
