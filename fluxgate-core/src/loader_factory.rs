use anyhow::{anyhow, Context, Result};
use hf_hub::api::sync::Api;

use crate::{
    select_best_device, ClipSafetyLoader, ClipWeights, DeviceMap, FluxLoader, FluxVariant,
    FluxWeights, Loader, ModelLike, SafetyChecker,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelVariant {
    Flux(FluxVariant),
}

impl ModelVariant {
    /// Detect model variant from model name
    pub fn from_name(model_name: &str) -> Option<Self> {
        let name_upper = model_name.to_uppercase();

        if name_upper.contains("FLUX") {
            Some(ModelVariant::Flux(if name_upper.contains("DEV") {
                FluxVariant::Dev
            } else {
                // Schnell is also the fallback when no variant is named.
                FluxVariant::Schnell
            }))
        } else {
            None
        }
    }
}

/// Everything the build step caches for one model name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelWeights {
    pub variant: ModelVariant,
    pub pipeline: FluxWeights,
    pub safety: ClipWeights,
}

/// A pipeline and its safety gate, bound to one device.
pub struct LoadedModel {
    pub pipeline: Box<dyn ModelLike>,
    pub safety: Box<dyn SafetyChecker>,
}

/// Build step: download (or confirm cached) every file `model_name` needs.
pub fn fetch_model(model_name: &str, api: &Api) -> Result<ModelWeights> {
    let variant = ModelVariant::from_name(model_name)
        .ok_or_else(|| anyhow!("Unsupported model variant: {}", model_name))?;

    tracing::info!(model = model_name, ?variant, "fetching model weights");

    let pipeline = match variant {
        ModelVariant::Flux(flux_variant) => FluxLoader::fetch(flux_variant, api)?,
    };
    let safety = ClipSafetyLoader::fetch((), api)?;

    Ok(ModelWeights {
        variant,
        pipeline,
        safety,
    })
}

/// Activation step: map fetched weights onto the selected device.
pub fn load_model(weights: &ModelWeights, device_map: DeviceMap) -> Result<LoadedModel> {
    let device = select_best_device(device_map).context("failed to set up device")?;

    tracing::info!(variant = ?weights.variant, %device_map, "loading model");

    let pipeline: Box<dyn ModelLike> = match weights.variant {
        ModelVariant::Flux(_) => Box::new(FluxLoader::load(&weights.pipeline, &device)?),
    };
    let safety = Box::new(ClipSafetyLoader::load(&weights.safety, &device)?);

    Ok(LoadedModel { pipeline, safety })
}
