use std::{
    path::PathBuf,
    sync::{Arc, PoisonError},
    time::Instant,
};

use fluxgate_core::{encode_jpeg, GenerationRequest};

use crate::{
    boundary::InferenceRequest,
    error::{Result, ServerError},
    ids,
    upload::ImageUploader,
    worker::WorkerInstance,
};

pub const SCRATCH_FILE: &str = "output.jpg";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InferenceOutcome {
    /// Public URL of the stored image
    Uploaded(String),
    /// The safety gate suppressed the image; nothing was stored
    Rejected,
}

/// Drives one request through generate, gate, encode and upload.
pub struct Orchestrator {
    uploader: Arc<dyn ImageUploader>,
    scratch_dir: PathBuf,
}

impl Orchestrator {
    pub fn new(uploader: Arc<dyn ImageUploader>, scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            uploader,
            scratch_dir: scratch_dir.into(),
        }
    }

    pub fn scratch_path(&self) -> PathBuf {
        self.scratch_dir.join(SCRATCH_FILE)
    }

    pub async fn infer(
        &self,
        worker: &WorkerInstance,
        request: &InferenceRequest,
    ) -> Result<InferenceOutcome> {
        if request.prompt.trim().is_empty() {
            return Err(ServerError::InvalidRequest(
                "prompt must not be empty".to_string(),
            ));
        }

        tracing::info!(
            instance = worker.id(),
            compile = worker.compile(),
            height = request.height,
            width = request.width,
            "generating image"
        );

        let pipeline = worker.pipeline();
        let safety = worker.safety();
        let generation = GenerationRequest::new(request.prompt.clone(), request.width, request.height);
        let check_safety = !request.override_safety;
        let started = Instant::now();

        let encoded = tokio::task::spawn_blocking(move || -> anyhow::Result<Option<Vec<u8>>> {
            let image = pipeline
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .run(&generation)?;
            tracing::info!(
                latency_secs = started.elapsed().as_secs_f64(),
                "inference latency (without pipeline loading)"
            );

            if check_safety
                && safety
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .is_unsafe(&image)?
            {
                return Ok(None);
            }
            encode_jpeg(&image).map(Some)
        })
        .await
        .map_err(|e| ServerError::Internal(format!("inference task failed: {e}")))?
        .map_err(|e| ServerError::Generation(format!("{e:#}")))?;

        let Some(jpeg) = encoded else {
            tracing::info!(instance = worker.id(), "image rejected by safety gate");
            return Ok(InferenceOutcome::Rejected);
        };

        self.write_scratch(&jpeg).await;

        let public_id = ids::public_id();
        tracing::info!(%public_id, "uploading image");
        let url = self.uploader.upload(jpeg, &public_id).await?;
        tracing::info!(%url, "image uploaded");

        Ok(InferenceOutcome::Uploaded(url))
    }

    /// Keeps the latest image on local disk for debugging; never fails the request.
    async fn write_scratch(&self, jpeg: &[u8]) {
        let path = self.scratch_path();
        let result = async {
            tokio::fs::create_dir_all(&self.scratch_dir).await?;
            tokio::fs::write(&path, jpeg).await
        }
        .await;
        match result {
            Ok(()) => tracing::info!(path = %path.display(), "saved output"),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to save output"),
        }
    }
}
