use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use fluxgate_core::{GenerationRequest, LoadedModel, ModelLike, SafetyChecker};
use fluxgate_server::{
    router, AppState, ImageUploader, Orchestrator, PoolConfig, ServerError, WorkerFactory,
    WorkerPool,
};
use http_body_util::BodyExt;
use image::{DynamicImage, Rgb, RgbImage};
use serde_json::{json, Value};
use tower::ServiceExt;

const UPLOAD_BASE: &str = "https://res.cloudinary.com/demo/image/upload";

#[derive(Default)]
struct Recorder {
    activations: AtomicUsize,
    activating: AtomicUsize,
    peak_activating: AtomicUsize,
    warm_ups: AtomicUsize,
    generations: Mutex<Vec<GenerationRequest>>,
    safety_checks: AtomicUsize,
    uploads: Mutex<Vec<String>>,
}

struct FakePipeline {
    recorder: Arc<Recorder>,
    delay: Duration,
}

impl ModelLike for FakePipeline {
    fn run(&mut self, request: &GenerationRequest) -> anyhow::Result<DynamicImage> {
        std::thread::sleep(self.delay);
        self.recorder.generations.lock().unwrap().push(request.clone());
        let width = request.width.unwrap_or(256) as u32;
        let height = request.height.unwrap_or(256) as u32;
        Ok(DynamicImage::ImageRgb8(RgbImage::from_pixel(
            width,
            height,
            Rgb([10, 200, 30]),
        )))
    }
}

struct FakeSafety {
    recorder: Arc<Recorder>,
    unsafe_images: bool,
}

impl SafetyChecker for FakeSafety {
    fn is_unsafe(&mut self, _image: &DynamicImage) -> anyhow::Result<bool> {
        self.recorder.safety_checks.fetch_add(1, Ordering::SeqCst);
        Ok(self.unsafe_images)
    }
}

struct FakeFactory {
    recorder: Arc<Recorder>,
    unsafe_images: bool,
    delay: Duration,
    activation_delay: Duration,
    fail: bool,
}

impl WorkerFactory for FakeFactory {
    fn activate(&self, compile: bool) -> anyhow::Result<LoadedModel> {
        if self.fail {
            anyhow::bail!("CUDA driver unavailable");
        }
        let activating = self.recorder.activating.fetch_add(1, Ordering::SeqCst) + 1;
        self.recorder
            .peak_activating
            .fetch_max(activating, Ordering::SeqCst);
        std::thread::sleep(self.activation_delay);
        self.recorder.activating.fetch_sub(1, Ordering::SeqCst);

        self.recorder.activations.fetch_add(1, Ordering::SeqCst);
        let mut pipeline = FakePipeline {
            recorder: Arc::clone(&self.recorder),
            delay: Duration::ZERO,
        };
        if compile {
            fluxgate_core::warm_up(&mut pipeline)?;
            self.recorder.warm_ups.fetch_add(1, Ordering::SeqCst);
            // Warm-up generations are not request traffic.
            self.recorder.generations.lock().unwrap().clear();
        }
        pipeline.delay = self.delay;
        Ok(LoadedModel {
            pipeline: Box::new(pipeline),
            safety: Box::new(FakeSafety {
                recorder: Arc::clone(&self.recorder),
                unsafe_images: self.unsafe_images,
            }),
        })
    }
}

struct FakeUploader(Arc<Recorder>);

#[async_trait]
impl ImageUploader for FakeUploader {
    async fn upload(&self, jpeg: Vec<u8>, public_id: &str) -> fluxgate_server::Result<String> {
        if jpeg.get(..2) != Some(&[0xFF, 0xD8][..]) {
            return Err(ServerError::Upload("not a jpeg".into()));
        }
        self.0.uploads.lock().unwrap().push(public_id.to_string());
        Ok(format!("{UPLOAD_BASE}/{public_id}.jpg"))
    }
}

struct Harness {
    app: Router,
    pool: Arc<WorkerPool>,
    recorder: Arc<Recorder>,
    _scratch: tempfile::TempDir,
}

struct HarnessBuilder {
    unsafe_images: bool,
    delay: Duration,
    activation_delay: Duration,
    fail: bool,
    request_timeout: Duration,
}

impl Default for HarnessBuilder {
    fn default() -> Self {
        Self {
            unsafe_images: false,
            delay: Duration::ZERO,
            activation_delay: Duration::ZERO,
            fail: false,
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl HarnessBuilder {
    fn build(self) -> Harness {
        let recorder = Arc::new(Recorder::default());
        let factory = Arc::new(FakeFactory {
            recorder: Arc::clone(&recorder),
            unsafe_images: self.unsafe_images,
            delay: self.delay,
            activation_delay: self.activation_delay,
            fail: self.fail,
        });
        let pool = Arc::new(WorkerPool::new(factory, PoolConfig::default()));
        let scratch = tempfile::tempdir().unwrap();
        let orchestrator =
            Orchestrator::new(Arc::new(FakeUploader(Arc::clone(&recorder))), scratch.path());
        let state = Arc::new(AppState::new(
            Arc::clone(&pool),
            orchestrator,
            self.request_timeout,
        ));

        Harness {
            app: router(state),
            pool,
            recorder,
            _scratch: scratch,
        }
    }
}

impl Harness {
    async fn post(&self, path: &str, body: Value) -> (StatusCode, Value) {
        self.post_raw(path, body.to_string()).await
    }

    async fn post_raw(&self, path: &str, body: String) -> (StatusCode, Value) {
        let request = Request::builder()
            .method("POST")
            .uri(path)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .unwrap();
        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }
}

fn legacy_body(prompt: &str, compile: &str, h: &str, w: &str, override_safety: &str) -> Value {
    json!({
        "prompt": prompt,
        "compile": compile,
        "h": h,
        "w": w,
        "override": override_safety,
    })
}

#[tokio::test]
async fn safe_prompt_returns_uploaded_url() {
    let harness = HarnessBuilder::default().build();

    let (status, body) = harness
        .post("/", legacy_body("a cat", "False", "", "", "False"))
        .await;

    assert_eq!(status, StatusCode::OK);
    let uploads = harness.recorder.uploads.lock().unwrap().clone();
    assert_eq!(uploads.len(), 1);
    assert_eq!(body, json!({ "img": format!("{UPLOAD_BASE}/{}.jpg", uploads[0]) }));

    let generations = harness.recorder.generations.lock().unwrap().clone();
    assert_eq!(generations.len(), 1);
    assert_eq!(generations[0].prompt, "a cat");
    assert_eq!(generations[0].width, Some(256));
    assert_eq!(generations[0].height, Some(256));
    assert_eq!(harness.recorder.warm_ups.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unsafe_image_returns_sentinel_without_upload() {
    let harness = HarnessBuilder {
        unsafe_images: true,
        ..HarnessBuilder::default()
    }
    .build();

    let (status, body) = harness
        .post("/", legacy_body("a cat", "False", "512", "512", "False"))
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "img": "420" }));
    assert!(harness.recorder.uploads.lock().unwrap().is_empty());
}

#[tokio::test]
async fn override_publishes_flagged_image() {
    let harness = HarnessBuilder {
        unsafe_images: true,
        ..HarnessBuilder::default()
    }
    .build();

    let (status, body) = harness
        .post("/", legacy_body("a cat", "False", "512", "768", "True"))
        .await;

    assert_eq!(status, StatusCode::OK);
    assert!(body["img"].as_str().unwrap().starts_with(UPLOAD_BASE));
    assert_eq!(harness.recorder.safety_checks.load(Ordering::SeqCst), 0);

    let generations = harness.recorder.generations.lock().unwrap().clone();
    assert_eq!(generations[0].height, Some(512));
    assert_eq!(generations[0].width, Some(768));
}

#[tokio::test]
async fn compile_request_is_served_by_warmed_instance() {
    let harness = HarnessBuilder::default().build();

    let (status, _) = harness
        .post("/inference", legacy_body("a cat", "True", "", "", "False"))
        .await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = harness
        .post("/inference", legacy_body("a dog", "True", "", "", "False"))
        .await;
    assert_eq!(status, StatusCode::OK);

    assert_eq!(harness.recorder.activations.load(Ordering::SeqCst), 1);
    assert_eq!(harness.recorder.warm_ups.load(Ordering::SeqCst), 1);
    assert_eq!(harness.recorder.generations.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn empty_prompt_is_rejected_before_generation() {
    let harness = HarnessBuilder::default().build();

    let (status, body) = harness
        .post("/", legacy_body("", "False", "", "", "False"))
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["type"], "invalid_request_error");
    assert!(harness.recorder.generations.lock().unwrap().is_empty());
    assert_eq!(harness.recorder.activations.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn malformed_json_is_a_bad_request() {
    let harness = HarnessBuilder::default().build();

    let (status, body) = harness.post_raw("/", "{\"prompt\": ".to_string()).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], 400);
}

#[tokio::test]
async fn non_numeric_dimension_is_a_bad_request() {
    let harness = HarnessBuilder::default().build();

    let (status, _) = harness
        .post("/", legacy_body("a cat", "False", "tall", "", "False"))
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(harness.recorder.generations.lock().unwrap().is_empty());
}

#[tokio::test]
async fn activation_failure_is_service_unavailable() {
    let harness = HarnessBuilder {
        fail: true,
        ..HarnessBuilder::default()
    }
    .build();

    let (status, body) = harness
        .post("/", legacy_body("a cat", "False", "", "", "False"))
        .await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"]["type"], "activation_error");
}

#[tokio::test]
async fn slow_generation_times_out() {
    let harness = HarnessBuilder {
        delay: Duration::from_millis(500),
        request_timeout: Duration::from_millis(50),
        ..HarnessBuilder::default()
    }
    .build();

    let (status, body) = harness
        .post("/", legacy_body("a cat", "False", "", "", "False"))
        .await;

    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(body["error"]["type"], "timeout_error");
    assert!(harness.recorder.uploads.lock().unwrap().is_empty());
}

#[tokio::test]
async fn timed_out_activation_still_counts_against_the_instance_limit() {
    let harness = HarnessBuilder {
        activation_delay: Duration::from_millis(400),
        request_timeout: Duration::from_millis(50),
        ..HarnessBuilder::default()
    }
    .build();

    for _ in 0..2 {
        let (status, _) = harness
            .post("/", legacy_body("a cat", "False", "", "", "False"))
            .await;
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    }

    // Let the abandoned activation finish and park its instance.
    tokio::time::sleep(Duration::from_millis(600)).await;

    assert_eq!(harness.recorder.peak_activating.load(Ordering::SeqCst), 1);
    assert_eq!(harness.recorder.activations.load(Ordering::SeqCst), 1);
    assert_eq!(harness.pool.idle_count(false), 1);
    assert!(harness.recorder.uploads.lock().unwrap().is_empty());
}

#[tokio::test]
async fn health_check() {
    let harness = HarnessBuilder::default().build();
    let request = Request::builder()
        .uri("/health")
        .body(Body::empty())
        .unwrap();

    let response = harness.app.clone().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&bytes[..], b"ok");
}
