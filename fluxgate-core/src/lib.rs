pub mod device_map;
pub mod loader;
mod loader_factory;
mod util;

mod flux;
mod safety;

pub use device_map::*;
pub use flux::{FluxLoader, FluxModel, FluxVariant, FluxWeights};
use image::DynamicImage;
pub use loader::*;
pub use loader_factory::*;
pub use safety::{ClipSafetyChecker, ClipSafetyLoader, ClipWeights, NSFW_THRESHOLD};
use serde::{Deserialize, Serialize};
pub use util::{encode_jpeg, select_best_device};
pub(crate) use util::{clip_pixel_values, tensor_to_image};

/// Prompt used by the warm-up pass that runs during activation.
pub const WARM_UP_PROMPT: &str = "dummy prompt to trigger compilation";

/// Edge length of the warm-up image.
///
/// Only this shape is specialized during activation. It is the size a request
/// gets when `h` and `w` are left empty; any other size pays its kernel
/// specialization cost on the first request that uses it.
pub const WARM_UP_SIZE: usize = 256;

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, PartialOrd)]
pub struct GenerationRequest {
    pub prompt: String,
    pub width: Option<usize>,
    pub height: Option<usize>,
    /// Falls back to the variant's fixed step count.
    pub steps: Option<usize>,
    pub guidance: Option<f64>,
    pub seed: Option<u64>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>, width: usize, height: usize) -> Self {
        Self {
            prompt: prompt.into(),
            width: Some(width),
            height: Some(height),
            steps: None,
            guidance: None,
            seed: None,
        }
    }

    /// Fixed input used to specialize kernels before a worker takes traffic.
    pub fn warm_up() -> Self {
        Self::new(WARM_UP_PROMPT, WARM_UP_SIZE, WARM_UP_SIZE)
    }
}

/// A loaded generation pipeline. Not safe for concurrent mutation; callers
/// serialize access to a single handle.
pub trait ModelLike: Send {
    fn run(&mut self, request: &GenerationRequest) -> anyhow::Result<DynamicImage>;
}

/// Image safety gate loaded once per worker.
pub trait SafetyChecker: Send {
    /// Returns `true` when the image should be suppressed.
    fn is_unsafe(&mut self, image: &DynamicImage) -> anyhow::Result<bool>;
}

/// Runs one throwaway generation so every kernel the pipeline needs is
/// specialized before a real request arrives.
pub fn warm_up(model: &mut dyn ModelLike) -> anyhow::Result<()> {
    tracing::info!("running warm-up compilation pass (this may take a while)");
    let started = std::time::Instant::now();
    model.run(&GenerationRequest::warm_up())?;
    tracing::info!(
        elapsed_secs = started.elapsed().as_secs_f64(),
        "finished warm-up compilation pass"
    );
    Ok(())
}
