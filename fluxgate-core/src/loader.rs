use anyhow::Result;
use candle_core::Device;
use hf_hub::api::sync::Api;

/// Two-phase model loading.
///
/// `fetch` is the build step: it resolves every file the model needs through
/// the hub cache and never touches the accelerator. Files already cached are
/// returned as-is, so repeated calls are cheap and yield the same paths.
///
/// `load` is the activation step: it maps the fetched files onto `device`.
pub trait Loader {
    type Variant;
    type Weights;
    type Model;

    fn fetch(variant: Self::Variant, api: &Api) -> Result<Self::Weights>;

    fn load(weights: &Self::Weights, device: &Device) -> Result<Self::Model>;
}
