use super::*;
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tempfile::tempdir;

use crate::generator::GenerateRequest;
use crate::history::SyncReport;
use crate::tasks::TaskStore;

/// How the scripted generator answers for one page.
#[derive(Clone)]
enum Script {
    Succeed,
    /// Fail this many calls, then succeed.
    FailTimes(usize),
    AlwaysFail,
    Panic,
}

#[derive(Debug, Clone)]
struct Call {
    index: u32,
    reference: Option<Vec<u8>>,
    context_images: usize,
}

struct ScriptedGenerator {
    scripts: HashMap<u32, Script>,
    delays: HashMap<u32, Duration>,
    attempts: Mutex<HashMap<u32, usize>>,
    calls: Mutex<Vec<Call>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedGenerator {
    fn new() -> Self {
        Self {
            scripts: HashMap::new(),
            delays: HashMap::new(),
            attempts: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    fn script(mut self, index: u32, script: Script) -> Self {
        self.scripts.insert(index, script);
        self
    }

    fn delay(mut self, index: u32, delay: Duration) -> Self {
        self.delays.insert(index, delay);
        self
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn calls_for(&self, index: u32) -> Vec<Call> {
        self.calls().into_iter().filter(|c| c.index == index).collect()
    }
}

/// Image bytes produced for a page; distinct per index.
fn page_bytes(index: u32) -> Vec<u8> {
    imaging::test_png(8 + index, 8)
}

fn prompt_index(prompt: &str) -> u32 {
    prompt
        .strip_prefix("page-")
        .and_then(|rest| rest.split(|c: char| !c.is_ascii_digit()).next())
        .and_then(|n| n.parse().ok())
        .unwrap_or(u32::MAX)
}

#[async_trait]
impl ImageGenerator for ScriptedGenerator {
    async fn generate(&self, request: &GenerateRequest) -> Result<Vec<u8>, ImageGenError> {
        let index = prompt_index(&request.prompt);
        self.calls.lock().unwrap().push(Call {
            index,
            reference: request.reference_image.as_ref().map(|r| r.to_vec()),
            context_images: request.context_images.len(),
        });
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let n = attempts.entry(index).or_insert(0);
            *n += 1;
            *n
        };

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.delays.get(&index) {
            tokio::time::sleep(*delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match self.scripts.get(&index).cloned().unwrap_or(Script::Succeed) {
            Script::Succeed => Ok(page_bytes(index)),
            Script::FailTimes(n) if attempt <= n => Err(ImageGenError::server_error(
                503,
                format!("overloaded on attempt {}", attempt),
            )),
            Script::FailTimes(_) => Ok(page_bytes(index)),
            Script::AlwaysFail => Err(ImageGenError::client_error(
                400,
                format!("rejected on attempt {}", attempt),
            )),
            Script::Panic => panic!("generator exploded"),
        }
    }
}

#[derive(Default)]
struct RecordingHistory {
    synced: Mutex<Vec<String>>,
}

impl RecordingHistory {
    fn synced(&self) -> Vec<String> {
        self.synced.lock().unwrap().clone()
    }
}

#[async_trait]
impl HistorySync for RecordingHistory {
    async fn scan_and_sync_task_images(&self, task_id: &str) -> anyhow::Result<SyncReport> {
        self.synced.lock().unwrap().push(task_id.to_string());
        Ok(SyncReport {
            task_id: task_id.to_string(),
            record_id: None,
            images_count: 0,
            images: Vec::new(),
            status: None,
            no_record: true,
        })
    }
}

struct Harness {
    _temp: tempfile::TempDir,
    root: PathBuf,
    generator: Arc<ScriptedGenerator>,
    history: Arc<RecordingHistory>,
    tasks: SharedTaskStore,
    service: ImageService,
}

fn harness(generator: ScriptedGenerator, high_concurrency: bool, max_concurrent: usize) -> Harness {
    let temp = tempdir().unwrap();
    let root = temp.path().to_path_buf();
    let generator = Arc::new(generator);
    let history = Arc::new(RecordingHistory::default());
    let tasks: SharedTaskStore = Arc::new(TaskStore::new());

    let mut settings = ServiceSettings::new(root.clone());
    settings.high_concurrency = high_concurrency;
    settings.max_concurrent = max_concurrent;
    settings.retry = PageRetryPolicy {
        extra_attempts: 3,
        delay: Duration::ZERO,
    };
    let service = ImageService::new(settings, generator.clone(), history.clone(), tasks.clone());

    Harness {
        _temp: temp,
        root,
        generator,
        history,
        tasks,
        service,
    }
}

fn pages(n: u32) -> Vec<Page> {
    (0..n).map(|i| Page::new(i, format!("page-{}", i))).collect()
}

fn request(task_id: &str, n: u32) -> GenerateImagesRequest {
    GenerateImagesRequest {
        pages: pages(n),
        task_id: Some(task_id.to_string()),
        full_outline: "1. Intro\n2. Body".to_string(),
        user_topic: "Tides".to_string(),
        ..GenerateImagesRequest::default()
    }
}

async fn run(service: &ImageService, req: GenerateImagesRequest) -> Vec<GenerationEvent> {
    service.generate_images(req).unwrap().collect().await
}

fn names(events: &[GenerationEvent]) -> Vec<&'static str> {
    events.iter().map(|e| e.name()).collect()
}

fn finish(events: &[GenerationEvent]) -> &FinishSummary {
    match events.last() {
        Some(GenerationEvent::Finish(summary)) => summary,
        other => panic!("expected finish last, got {:?}", other),
    }
}

#[tokio::test]
async fn test_sequential_run_uses_cover_as_reference() {
    let h = harness(ScriptedGenerator::new(), false, 2);
    let events = run(&h.service, request("t1", 3)).await;

    assert_eq!(
        names(&events),
        vec![
            "progress", "complete", "progress", "progress", "complete", "progress", "complete",
            "finish"
        ]
    );
    assert_eq!(
        events[0],
        GenerationEvent::Progress {
            status: ProgressStatus::GeneratingCover,
            index: Some(0),
            message: Some("Generating cover".to_string()),
            current: 1,
            total: 3,
            phase: Phase::Cover,
        }
    );
    assert_eq!(
        events[1],
        GenerationEvent::Complete {
            index: 0,
            image_url: "/api/images/t1/0.png".to_string(),
            phase: Some(Phase::Cover),
        }
    );
    match &events[2] {
        GenerationEvent::Progress {
            status, current, ..
        } => {
            assert_eq!(*status, ProgressStatus::BatchStart);
            assert_eq!(*current, 1);
        }
        other => panic!("unexpected {:?}", other),
    }
    // Content pages go strictly in input order.
    let content: Vec<Option<u32>> = events[3..7].iter().map(|e| e.index()).collect();
    assert_eq!(content, vec![Some(1), Some(1), Some(2), Some(2)]);

    let summary = finish(&events);
    assert!(summary.success);
    assert_eq!(summary.task_id, "t1");
    assert_eq!(summary.images, vec!["0.png", "1.png", "2.png"]);
    assert_eq!((summary.total, summary.completed, summary.failed), (3, 3, 0));

    let cover = page_bytes(0);
    assert!(h.generator.calls_for(0)[0].reference.is_none());
    for index in [1, 2] {
        assert_eq!(h.generator.calls_for(index)[0].reference.as_ref(), Some(&cover));
    }

    let task_dir = h.root.join("t1");
    assert_eq!(std::fs::read(task_dir.join("0.png")).unwrap(), cover);
    assert!(task_dir.join("thumb_0.png").exists());
    assert!(task_dir.join("2.png").exists());

    let status = h.service.get_task_state("t1").await.unwrap();
    assert_eq!(status.generated.len(), 3);
    assert!(status.failed.is_empty());
    assert!(status.has_cover);
    assert!(!h.tasks.get("t1").await.unwrap().running);
    assert_eq!(h.history.synced(), vec!["t1"]);
}

#[tokio::test]
async fn test_cover_failure_continues_without_reference() {
    let generator = ScriptedGenerator::new().script(0, Script::AlwaysFail);
    let h = harness(generator, false, 2);
    let events = run(&h.service, request("t2", 3)).await;

    match &events[1] {
        GenerationEvent::Error {
            index,
            message,
            phase,
        } => {
            assert_eq!(*index, 0);
            assert_eq!(*phase, Some(Phase::Cover));
            assert!(message.contains("rejected on attempt 4"), "{}", message);
        }
        other => panic!("unexpected {:?}", other),
    }

    let summary = finish(&events);
    assert!(!summary.success);
    assert_eq!(summary.failed_indices, vec![0]);
    assert_eq!(summary.completed, 2);

    for call in h.generator.calls_for(1).iter().chain(h.generator.calls_for(2).iter()) {
        assert!(call.reference.is_none());
    }
    let status = h.service.get_task_state("t2").await.unwrap();
    assert!(!status.has_cover);
    assert!(status.failed.contains_key(&0));
}

#[tokio::test]
async fn test_pooled_run_respects_worker_limit() {
    let generator = ScriptedGenerator::new()
        .delay(1, Duration::from_millis(120))
        .delay(2, Duration::from_millis(40))
        .delay(3, Duration::from_millis(40))
        .delay(4, Duration::from_millis(40))
        .delay(5, Duration::from_millis(40));
    let h = harness(generator, true, 2);
    let events = run(&h.service, request("t3", 6)).await;

    // Every generating event precedes the first content outcome.
    let first_outcome = events
        .iter()
        .position(|e| matches!(e, GenerationEvent::Complete { phase: Some(Phase::Content), .. }))
        .unwrap();
    let generating = events
        .iter()
        .enumerate()
        .filter(|(_, e)| {
            matches!(e, GenerationEvent::Progress { status: ProgressStatus::Generating, .. })
        })
        .map(|(i, _)| i)
        .collect::<Vec<_>>();
    assert_eq!(generating.len(), 5);
    assert!(generating.iter().all(|i| *i < first_outcome));

    let summary = finish(&events);
    assert!(summary.success);
    assert_eq!(summary.completed, 6);
    // Page 1 is the slowest, so it is not the first content page to land.
    assert_ne!(summary.images[1], "1.png");

    assert!(h.generator.max_in_flight.load(Ordering::SeqCst) <= 2);
    let cover = page_bytes(0);
    for index in 1..6 {
        assert_eq!(h.generator.calls_for(index)[0].reference.as_ref(), Some(&cover));
    }
}

#[tokio::test]
async fn test_flaky_page_recovers_within_retry_budget() {
    let generator = ScriptedGenerator::new().script(1, Script::FailTimes(3));
    let h = harness(generator, false, 2);
    let events = run(&h.service, request("t4", 2)).await;

    let summary = finish(&events);
    assert!(summary.success);
    assert_eq!(h.generator.calls_for(1).len(), 4);
    assert!(!names(&events).contains(&"error"));
}

#[tokio::test]
async fn test_sequential_failure_keeps_input_order() {
    let generator = ScriptedGenerator::new().script(2, Script::AlwaysFail);
    let h = harness(generator, false, 2);
    let events = run(&h.service, request("t5s", 3)).await;

    assert_eq!(
        names(&events),
        vec![
            "progress", "complete", "progress", "progress", "complete", "progress", "error",
            "finish"
        ]
    );
    let indices: Vec<Option<u32>> = events.iter().map(|e| e.index()).collect();
    assert_eq!(
        indices,
        vec![Some(0), Some(0), None, Some(1), Some(1), Some(2), Some(2), None]
    );
    assert!(matches!(
        events[6],
        GenerationEvent::Error {
            index: 2,
            phase: Some(Phase::Content),
            ..
        }
    ));

    let summary = finish(&events);
    assert!(!summary.success);
    assert_eq!(summary.completed, 2);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.failed_indices, vec![2]);
    assert_eq!(summary.images, vec!["0.png", "1.png"]);
}

#[tokio::test]
async fn test_permanent_failure_reports_last_error() {
    let generator = ScriptedGenerator::new().script(2, Script::AlwaysFail);
    let h = harness(generator, true, 3);
    let events = run(&h.service, request("t5", 3)).await;

    let error = events
        .iter()
        .find_map(|e| match e {
            GenerationEvent::Error { index: 2, message, phase } => Some((message.clone(), *phase)),
            _ => None,
        })
        .unwrap();
    assert!(error.0.contains("rejected on attempt 4"), "{}", error.0);
    assert_eq!(error.1, Some(Phase::Content));
    assert_eq!(h.generator.calls_for(2).len(), 4);

    let summary = finish(&events);
    assert_eq!(summary.failed_indices, vec![2]);
    assert_eq!(summary.completed, 2);

    let status = h.service.get_task_state("t5").await.unwrap();
    assert!(status.failed.get(&2).unwrap().contains("rejected on attempt 4"));
    assert!(!status.generated.contains_key(&2));
}

#[tokio::test]
async fn test_panicking_worker_becomes_page_error() {
    let generator = ScriptedGenerator::new().script(1, Script::Panic);
    let h = harness(generator, true, 2);
    let events = run(&h.service, request("t6", 3)).await;

    let message = events
        .iter()
        .find_map(|e| match e {
            GenerationEvent::Error { index: 1, message, .. } => Some(message.clone()),
            _ => None,
        })
        .unwrap();
    assert!(message.starts_with("Worker panicked"), "{}", message);

    let summary = finish(&events);
    assert_eq!(summary.failed_indices, vec![1]);
    assert_eq!(summary.completed, 2);
}

#[tokio::test]
async fn test_every_page_lands_in_exactly_one_set() {
    let generator = ScriptedGenerator::new()
        .script(1, Script::AlwaysFail)
        .script(3, Script::FailTimes(1))
        .script(4, Script::Panic);
    let h = harness(generator, true, 2);
    run(&h.service, request("t7", 6)).await;

    let status = h.service.get_task_state("t7").await.unwrap();
    let mut all: Vec<u32> = status
        .generated
        .keys()
        .chain(status.failed.keys())
        .copied()
        .collect();
    all.sort_unstable();
    assert_eq!(all, vec![0, 1, 2, 3, 4, 5]);
    assert!(status.generated.keys().all(|k| !status.failed.contains_key(k)));
}

#[tokio::test]
async fn test_user_images_reach_every_page() {
    for high_concurrency in [false, true] {
        let h = harness(ScriptedGenerator::new(), high_concurrency, 2);
        let mut req = request("t8", 3);
        req.user_images = vec![imaging::test_png(64, 64), b"not an image".to_vec()];
        run(&h.service, req).await;

        let cover = page_bytes(0);
        assert_eq!(h.generator.calls_for(0)[0].context_images, 1);
        assert!(h.generator.calls_for(0)[0].reference.is_none());
        for index in 1..3 {
            let call = &h.generator.calls_for(index)[0];
            assert_eq!(call.context_images, 1, "page {}", index);
            assert_eq!(call.reference.as_ref(), Some(&cover));
        }
    }
}

#[tokio::test]
async fn test_missing_task_id_gets_generated() {
    let h = harness(ScriptedGenerator::new(), false, 2);
    let mut req = request("", 1);
    req.task_id = None;
    let events = run(&h.service, req).await;

    let task_id = finish(&events).task_id.clone();
    assert!(uuid::Uuid::parse_str(&task_id).is_ok());
    assert!(h.root.join(&task_id).join("0.png").exists());
}

#[tokio::test]
async fn test_rejects_bad_requests() {
    let h = harness(ScriptedGenerator::new(), false, 2);
    let mut req = request("t9", 0);
    assert!(matches!(
        h.service.generate_images(req.clone()),
        Err(GenerationError::EmptyPages)
    ));

    req.pages = pages(1);
    req.task_id = Some("../escape".to_string());
    assert!(matches!(
        h.service.generate_images(req),
        Err(GenerationError::InvalidTaskId(_))
    ));

    assert!(matches!(
        h.service.retry_failed_images("t9", Vec::new()),
        Err(GenerationError::EmptyPages)
    ));
}

#[tokio::test]
async fn test_dropped_stream_still_completes() {
    let generator = ScriptedGenerator::new().delay(1, Duration::from_millis(30));
    let h = harness(generator, false, 2);
    let stream = h.service.generate_images(request("t10", 3)).unwrap();
    drop(stream);

    for _ in 0..100 {
        if !h.history.synced().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(h.history.synced(), vec!["t10"]);
    let status = h.service.get_task_state("t10").await.unwrap();
    assert_eq!(status.generated.len(), 3);
}

#[tokio::test]
async fn test_retry_single_reads_cover_from_disk() {
    let h = harness(ScriptedGenerator::new(), false, 2);
    let task_dir = h.root.join("old-task");
    std::fs::create_dir_all(&task_dir).unwrap();
    let disk_cover = imaging::test_png(30, 30);
    std::fs::write(task_dir.join("0.png"), &disk_cover).unwrap();

    let result = h
        .service
        .retry_single_image("old-task", Page::new(2, "page-2"), true)
        .await;
    assert_eq!(
        result,
        SingleImageResult {
            success: true,
            index: 2,
            image_url: Some("/api/images/old-task/2.png".to_string()),
            error: None,
            retryable: None,
        }
    );
    assert_eq!(h.generator.calls_for(2)[0].reference.as_ref(), Some(&disk_cover));

    let status = h.service.get_task_state("old-task").await.unwrap();
    assert_eq!(status.generated.get(&2).map(String::as_str), Some("2.png"));
    assert_eq!(h.history.synced(), vec!["old-task"]);

    // Without the flag no reference is sent.
    h.service
        .regenerate_image("old-task", Page::new(3, "page-3"), false)
        .await;
    assert!(h.generator.calls_for(3)[0].reference.is_none());
}

#[tokio::test]
async fn test_retry_single_failure_keeps_state() {
    let generator = ScriptedGenerator::new().script(1, Script::AlwaysFail);
    let h = harness(generator, false, 2);
    h.tasks.create("t11", 2, "", "").await;
    h.tasks.record_success("t11", 0, "0.png").await;

    let result = h
        .service
        .retry_single_image("t11", Page::new(1, "page-1"), true)
        .await;
    assert!(!result.success);
    assert_eq!(result.retryable, Some(true));
    assert!(result.error.unwrap().contains("rejected"));

    let status = h.service.get_task_state("t11").await.unwrap();
    assert_eq!(status.generated.len(), 1);
    assert!(status.failed.is_empty());
}

#[tokio::test]
async fn test_retry_single_cover_sets_missing_cover() {
    let h = harness(ScriptedGenerator::new(), false, 2);
    let result = h
        .service
        .retry_single_image("t12", Page::new(0, "page-0"), true)
        .await;
    assert!(result.success);
    assert!(h.generator.calls_for(0)[0].reference.is_none());
    assert_eq!(
        h.tasks.cover_image("t12").await.unwrap().as_slice(),
        page_bytes(0).as_slice()
    );
}

#[tokio::test]
async fn test_retry_failed_moves_pages_to_generated() {
    let generator = ScriptedGenerator::new().script(2, Script::FailTimes(4));
    let h = harness(generator, true, 2);
    let events = run(&h.service, request("t13", 3)).await;
    assert_eq!(finish(&events).failed_indices, vec![2]);

    let events: Vec<GenerationEvent> = h
        .service
        .retry_failed_images("t13", vec![Page::new(2, "page-2")])
        .unwrap()
        .collect()
        .await;
    assert_eq!(names(&events), vec!["retry_start", "complete", "retry_finish"]);
    assert_eq!(
        events[1],
        GenerationEvent::Complete {
            index: 2,
            image_url: "/api/images/t13/2.png".to_string(),
            phase: None,
        }
    );
    assert_eq!(
        events[2],
        GenerationEvent::RetryFinish {
            success: true,
            total: 1,
            completed: 1,
            failed: 0,
        }
    );
    assert_eq!(h.generator.calls_for(2).last().unwrap().reference.as_ref(), Some(&page_bytes(0)));

    let status = h.service.get_task_state("t13").await.unwrap();
    assert!(status.failed.is_empty());
    assert_eq!(status.generated.len(), 3);
    assert_eq!(h.history.synced(), vec!["t13", "t13"]);
}

#[tokio::test]
async fn test_retry_failed_reports_failures() {
    let generator = ScriptedGenerator::new().script(1, Script::AlwaysFail);
    let h = harness(generator, true, 2);
    let events: Vec<GenerationEvent> = h
        .service
        .retry_failed_images("t14", vec![Page::new(1, "page-1"), Page::new(2, "page-2")])
        .unwrap()
        .collect()
        .await;

    assert_eq!(events.len(), 4);
    assert_eq!(
        events.last(),
        Some(&GenerationEvent::RetryFinish {
            success: false,
            total: 2,
            completed: 1,
            failed: 1,
        })
    );
    let status = h.service.get_task_state("t14").await.unwrap();
    assert!(status.failed.contains_key(&1));
    assert!(status.generated.contains_key(&2));
}

#[tokio::test]
async fn test_cleanup_and_image_path() {
    let h = harness(ScriptedGenerator::new(), false, 2);
    run(&h.service, request("t15", 1)).await;

    assert_eq!(
        h.service.image_path("t15", "0.png"),
        Some(h.root.join("t15").join("0.png"))
    );
    assert_eq!(h.service.image_path("..", "0.png"), None);
    assert_eq!(h.service.image_path("t15", "../secret"), None);

    assert!(h.service.cleanup_task("t15").await);
    assert!(h.service.get_task_state("t15").await.is_none());
    assert!(!h.service.cleanup_task("t15").await);
    assert!(h.root.join("t15").join("0.png").exists());
}

#[test]
fn test_settings_from_provider() {
    let config = ProviderConfig {
        high_concurrency: true,
        max_concurrent: Some(0),
        negative_prompt: Some("blurry".to_string()),
        ..ProviderConfig::default()
    };
    let settings = ServiceSettings::from_provider("img", &config, PathBuf::from("/tmp/h"));
    assert_eq!(settings.provider_name, "img");
    assert!(settings.high_concurrency);
    assert_eq!(settings.max_concurrent, DEFAULT_MAX_CONCURRENT);
    assert_eq!(settings.negative_prompt.as_deref(), Some("blurry"));
    assert_eq!(settings.retry, PageRetryPolicy::default());
}

#[test]
fn test_page_accepts_prompt_aliases() {
    let page: Page = serde_json::from_str(r#"{"index": 2, "content": "a beach"}"#).unwrap();
    assert_eq!(page, Page::new(2, "a beach"));
}
