use std::{
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Instant,
};

use anyhow::{Context, Result};
use fluxgate_core::{
    fetch_model, load_model, warm_up, DeviceMap, LoadedModel, ModelLike, ModelWeights,
    SafetyChecker,
};
use hf_hub::api::sync::{Api, ApiBuilder};

/// Produces activated workers. `activate` blocks for as long as loading and,
/// when `compile` is set, the warm-up pass take; callers run it off the async
/// executor.
pub trait WorkerFactory: Send + Sync + 'static {
    fn activate(&self, compile: bool) -> Result<LoadedModel>;
}

/// One warm execution context bound to a compile flag.
pub struct WorkerInstance {
    id: u64,
    compile: bool,
    pipeline: Arc<Mutex<Box<dyn ModelLike>>>,
    safety: Arc<Mutex<Box<dyn SafetyChecker>>>,
    activated_at: Instant,
    pub(crate) last_used: Instant,
}

impl WorkerInstance {
    pub fn new(id: u64, compile: bool, model: LoadedModel) -> Self {
        let now = Instant::now();
        Self {
            id,
            compile,
            pipeline: Arc::new(Mutex::new(model.pipeline)),
            safety: Arc::new(Mutex::new(model.safety)),
            activated_at: now,
            last_used: now,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Fixed at construction.
    pub fn compile(&self) -> bool {
        self.compile
    }

    pub fn activated_at(&self) -> Instant {
        self.activated_at
    }

    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    pub(crate) fn pipeline(&self) -> Arc<Mutex<Box<dyn ModelLike>>> {
        Arc::clone(&self.pipeline)
    }

    pub(crate) fn safety(&self) -> Arc<Mutex<Box<dyn SafetyChecker>>> {
        Arc::clone(&self.safety)
    }
}

/// Loads FLUX pipelines from the hub cache onto the configured device.
pub struct FluxWorkerFactory {
    model: String,
    device_map: DeviceMap,
    cache_dir: Option<PathBuf>,
}

impl FluxWorkerFactory {
    pub fn new(model: impl Into<String>, device_map: DeviceMap, cache_dir: Option<PathBuf>) -> Self {
        Self {
            model: model.into(),
            device_map,
            cache_dir,
        }
    }
}

impl WorkerFactory for FluxWorkerFactory {
    fn activate(&self, compile: bool) -> Result<LoadedModel> {
        let api = hub_api(self.cache_dir.clone())?;
        // Cache hits only, unless the build step never ran on this host.
        let weights = fetch_model(&self.model, &api)?;
        let mut model = load_model(&weights, self.device_map)?;
        if compile {
            warm_up(model.pipeline.as_mut()).context("warm-up pass failed")?;
        }
        Ok(model)
    }
}

pub fn hub_api(cache_dir: Option<PathBuf>) -> Result<Api> {
    let builder = ApiBuilder::from_env();
    let builder = match cache_dir {
        Some(dir) => builder.with_cache_dir(dir),
        None => builder,
    };
    builder.build().context("failed to create hf hub API")
}

/// Build step: populate the cache for `model` without loading anything.
pub fn build(model: &str, cache_dir: Option<PathBuf>) -> Result<ModelWeights> {
    let api = hub_api(cache_dir)?;
    let started = Instant::now();
    let weights = fetch_model(model, &api)?;
    tracing::info!(
        model,
        elapsed_secs = started.elapsed().as_secs_f64(),
        "model weights cached"
    );
    Ok(weights)
}
