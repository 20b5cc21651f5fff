//! Single-page generation.
//!
//! Every page runs in its own tokio task and hands its outcome back to the
//! coordinator through the join handle; workers never touch task state.

use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::FutureExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinError;

use super::Page;
use crate::generator::{GenerateRequest, ImageGenerator};
use crate::imaging;

/// Bounded retry around each page, on top of the adapter's own retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRetryPolicy {
    /// Attempts after the first one.
    pub extra_attempts: u32,
    /// Fixed pause between attempts.
    pub delay: Duration,
}

impl Default for PageRetryPolicy {
    fn default() -> Self {
        Self {
            extra_attempts: 3,
            delay: Duration::from_secs(2),
        }
    }
}

/// Everything a worker needs, shared by all pages of one batch.
pub(crate) struct PageContext {
    pub generator: Arc<dyn ImageGenerator>,
    pub task_dir: PathBuf,
    pub retry: PageRetryPolicy,
    pub negative_prompt: Option<String>,
    pub full_outline: String,
    pub user_topic: String,
    pub reference_image: Option<Arc<Vec<u8>>>,
    pub context_images: Vec<Arc<Vec<u8>>>,
}

/// A page written to disk.
#[derive(Debug, Clone)]
pub(crate) struct GeneratedPage {
    pub filename: String,
    pub bytes: Arc<Vec<u8>>,
}

pub(crate) type PageResult = Result<GeneratedPage, String>;

/// Prompt sent for a page: its own prompt plus the deck context.
pub fn build_prompt(page_prompt: &str, full_outline: &str, user_topic: &str) -> String {
    let mut prompt = page_prompt.trim().to_string();
    if !user_topic.trim().is_empty() {
        prompt.push_str("\n\nDeck topic: ");
        prompt.push_str(user_topic.trim());
    }
    if !full_outline.trim().is_empty() {
        prompt.push_str("\n\nFull deck outline, keep the visual style consistent with it:\n");
        prompt.push_str(full_outline.trim());
    }
    prompt
}

pub fn page_filename(index: u32) -> String {
    format!("{}.png", index)
}

pub fn thumbnail_filename(filename: &str) -> String {
    format!("thumb_{}", filename)
}

/// One attempt: generate and write the page file.
async fn attempt(ctx: &PageContext, page: &Page, request: &GenerateRequest) -> PageResult {
    let bytes = ctx
        .generator
        .generate(request)
        .await
        .map_err(|e| e.to_string())?;
    if bytes.is_empty() {
        return Err("Provider returned an empty image".to_string());
    }

    let filename = page_filename(page.index);
    let path = ctx.task_dir.join(&filename);
    tokio::fs::write(&path, &bytes)
        .await
        .map_err(|e| format!("Failed to write {}: {}", path.display(), e))?;

    Ok(GeneratedPage {
        filename,
        bytes: Arc::new(bytes),
    })
}

async fn write_thumbnail(ctx: &PageContext, page: &GeneratedPage) {
    let bytes = page.bytes.clone();
    let thumb = match tokio::task::spawn_blocking(move || imaging::thumbnail(&bytes)).await {
        Ok(Ok(thumb)) => thumb,
        Ok(Err(e)) => {
            tracing::warn!("Failed to create thumbnail for {}: {}", page.filename, e);
            return;
        }
        Err(e) => {
            tracing::warn!("Thumbnail task for {} failed: {}", page.filename, e);
            return;
        }
    };

    let path = ctx.task_dir.join(thumbnail_filename(&page.filename));
    if let Err(e) = tokio::fs::write(&path, thumb).await {
        tracing::warn!("Failed to write thumbnail {}: {}", path.display(), e);
    }
}

/// Generate one page with the bounded retry loop. The error is the last
/// attempt's message.
pub(crate) async fn generate_page(ctx: Arc<PageContext>, page: Page) -> PageResult {
    let request = GenerateRequest {
        prompt: build_prompt(&page.image_prompt, &ctx.full_outline, &ctx.user_topic),
        reference_image: ctx.reference_image.clone(),
        negative_prompt: ctx.negative_prompt.clone(),
        context_images: ctx.context_images.clone(),
    };

    let attempts = ctx.retry.extra_attempts + 1;
    let mut last_error = String::new();
    for n in 1..=attempts {
        match attempt(&ctx, &page, &request).await {
            Ok(generated) => {
                if n > 1 {
                    tracing::info!("Page {} succeeded on attempt {}", page.index, n);
                }
                write_thumbnail(&ctx, &generated).await;
                return Ok(generated);
            }
            Err(e) => {
                tracing::warn!(
                    "Page {} attempt {}/{} failed: {}",
                    page.index,
                    n,
                    attempts,
                    e
                );
                last_error = e;
                if n < attempts && !ctx.retry.delay.is_zero() {
                    tokio::time::sleep(ctx.retry.delay).await;
                }
            }
        }
    }

    tracing::error!(
        "Page {} failed after {} attempts: {}",
        page.index,
        attempts,
        last_error
    );
    Err(last_error)
}

/// Turn a worker's join result into a page result. A panic becomes an
/// ordinary failure message.
pub(crate) fn flatten_join(joined: Result<PageResult, JoinError>) -> PageResult {
    match joined {
        Ok(result) => result,
        Err(e) if e.is_panic() => {
            let payload = e.into_panic();
            let detail = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(format!("Worker panicked: {}", detail))
        }
        Err(e) => Err(format!("Worker cancelled: {}", e)),
    }
}

/// Run a single page in its own task and wait for it.
pub(crate) async fn run_page(ctx: Arc<PageContext>, page: Page) -> PageResult {
    flatten_join(tokio::spawn(generate_page(ctx, page)).await)
}

/// Spawn every page, at most `max_concurrent` generating at once. Outcomes
/// are yielded in completion order.
pub(crate) fn spawn_pool(
    ctx: Arc<PageContext>,
    pages: Vec<Page>,
    max_concurrent: usize,
) -> FuturesUnordered<BoxFuture<'static, (u32, PageResult)>> {
    let semaphore = Arc::new(Semaphore::new(max_concurrent.max(1)));
    let pending = FuturesUnordered::new();

    for page in pages {
        let index = page.index;
        let ctx = ctx.clone();
        let semaphore = semaphore.clone();
        let handle = tokio::spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|e| format!("Worker pool closed: {}", e))?;
            generate_page(ctx, page).await
        });
        pending.push(async move { (index, flatten_join(handle.await)) }.boxed());
    }

    pending
}
