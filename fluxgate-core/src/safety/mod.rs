//! Zero-shot NSFW gate built on CLIP image/text similarity.
//!
//! The generated image is scored against the two labels in [`LABELS`]; the
//! softmax probability of the first label decides the verdict.

use std::path::PathBuf;

use anyhow::{Context, Error, Result};
use candle_core::{DType, Device, Tensor};
use candle_transformers::models::clip::{
    text_model::{Activation, ClipTextConfig},
    vision_model::ClipVisionConfig,
    ClipConfig, ClipModel,
};
use hf_hub::api::sync::Api;
use image::DynamicImage;
use tokenizers::Tokenizer;

use crate::{clip_pixel_values, Loader, SafetyChecker};

const REPO: &str = "openai/clip-vit-large-patch14";
const PAD_TOKEN: &str = "<|endoftext|>";
const IMAGE_SIZE: usize = 224;

/// Label order matters: index 0 is the unsafe concept.
pub const LABELS: [&str; 2] = ["NSFW", "SFW"];

/// Images whose unsafe probability exceeds this are suppressed.
pub const NSFW_THRESHOLD: f32 = 0.5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClipWeights {
    pub model: PathBuf,
    pub tokenizer: PathBuf,
}

fn vit_large_patch14() -> ClipConfig {
    let text_config = ClipTextConfig {
        vocab_size: 49408,
        projection_dim: 768,
        activation: Activation::QuickGelu,
        intermediate_size: 3072,
        embed_dim: 768,
        max_position_embeddings: 77,
        pad_with: None,
        num_hidden_layers: 12,
        num_attention_heads: 12,
    };
    let vision_config = ClipVisionConfig {
        embed_dim: 1024,
        activation: Activation::QuickGelu,
        intermediate_size: 4096,
        num_hidden_layers: 24,
        num_attention_heads: 16,
        projection_dim: 768,
        num_channels: 3,
        image_size: IMAGE_SIZE,
        patch_size: 14,
    };
    ClipConfig {
        text_config,
        vision_config,
        logit_scale_init_value: 2.6592,
        image_size: IMAGE_SIZE,
    }
}

/// Softmax over the label axis, returning the unsafe-label probability of the
/// first image in the batch.
pub(crate) fn nsfw_probability(logits_per_image: &Tensor) -> Result<f32> {
    let probs = candle_nn::ops::softmax(&logits_per_image.to_dtype(DType::F32)?, 1)?;
    let probs = probs.to_vec2::<f32>()?;
    probs
        .first()
        .and_then(|row| row.first())
        .copied()
        .context("classifier returned no scores")
}

pub struct ClipSafetyChecker {
    device: Device,
    model: ClipModel,
    label_ids: Tensor,
}

impl ClipSafetyChecker {
    /// Unsafe-label probability for `image`.
    pub fn score(&self, image: &DynamicImage) -> Result<f32> {
        let pixel_values = clip_pixel_values(image, IMAGE_SIZE, &self.device)?;
        let (_logits_per_text, logits_per_image) =
            self.model.forward(&pixel_values, &self.label_ids)?;
        nsfw_probability(&logits_per_image)
    }
}

impl SafetyChecker for ClipSafetyChecker {
    fn is_unsafe(&mut self, image: &DynamicImage) -> Result<bool> {
        let probability = self.score(image)?;
        tracing::debug!(probability, "safety score");
        Ok(probability > NSFW_THRESHOLD)
    }
}

fn tokenize_labels(tokenizer: &Tokenizer, device: &Device) -> Result<Tensor> {
    let pad_id = *tokenizer
        .get_vocab(true)
        .get(PAD_TOKEN)
        .context("CLIP tokenizer has no pad token")?;

    let mut tokens = LABELS
        .iter()
        .map(|label| {
            tokenizer
                .encode(*label, true)
                .map(|encoding| encoding.get_ids().to_vec())
                .map_err(Error::msg)
        })
        .collect::<Result<Vec<_>>>()?;
    let max_len = tokens.iter().map(Vec::len).max().unwrap_or(0);
    for ids in &mut tokens {
        ids.resize(max_len, pad_id);
    }
    let rows = tokens.len();
    let flat = tokens.into_iter().flatten().collect::<Vec<u32>>();
    Ok(Tensor::from_vec(flat, (rows, max_len), device)?)
}

pub struct ClipSafetyLoader;

impl Loader for ClipSafetyLoader {
    type Variant = ();
    type Weights = ClipWeights;
    type Model = ClipSafetyChecker;

    fn fetch(_variant: (), api: &Api) -> Result<ClipWeights> {
        let repo = api.model(REPO.to_string());
        let model = repo
            .get("model.safetensors")
            .context("failed to fetch safety model file")?;
        let tokenizer = repo
            .get("tokenizer.json")
            .context("failed to fetch safety tokenizer")?;
        Ok(ClipWeights { model, tokenizer })
    }

    fn load(weights: &ClipWeights, device: &Device) -> Result<ClipSafetyChecker> {
        let vb = unsafe {
            candle_nn::VarBuilder::from_mmaped_safetensors(&[&weights.model], DType::F32, device)
                .context("failed to build safety var builder")?
        };
        let model = ClipModel::new(vb, &vit_large_patch14()).context("failed to load safety model")?;
        let tokenizer = Tokenizer::from_file(&weights.tokenizer)
            .map_err(Error::msg)
            .context("failed to load safety tokenizer")?;
        let label_ids = tokenize_labels(&tokenizer, device)?;

        tracing::info!("loaded safety classifier");
        Ok(ClipSafetyChecker {
            device: device.clone(),
            model,
            label_ids,
        })
    }
}
