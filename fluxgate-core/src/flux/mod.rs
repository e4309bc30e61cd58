use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Error, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::Module;
use candle_transformers::models::{
    clip::text_model::{Activation, ClipTextConfig, ClipTextTransformer},
    flux::{
        autoencoder::{self, AutoEncoder},
        model::{self, Flux},
        sampling,
    },
    t5::{self, T5EncoderModel},
};
use hf_hub::api::sync::Api;
use image::DynamicImage;
use tokenizers::Tokenizer;

use crate::{tensor_to_image, GenerationRequest, Loader, ModelLike};

const T5_REPO: &str = "google/t5-v1_1-xxl";
const T5_REVISION: &str = "refs/pr/2";
const T5_TOKENIZER_REPO: &str = "lmz/mt5-tokenizers";
const T5_TOKENIZER_FILE: &str = "t5-v1_1-xxl.tokenizer.json";
const T5_MAX_TOKENS: usize = 256;
const CLIP_TEXT_REPO: &str = "openai/clip-vit-large-patch14";
const CLIP_MAX_TOKENS: usize = 77;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FluxVariant {
    Schnell,
    Dev,
}

impl FluxVariant {
    pub fn repo(&self) -> &'static str {
        match self {
            Self::Schnell => "black-forest-labs/FLUX.1-schnell",
            Self::Dev => "black-forest-labs/FLUX.1-dev",
        }
    }

    fn weights_file(&self) -> &'static str {
        match self {
            Self::Schnell => "flux1-schnell.safetensors",
            Self::Dev => "flux1-dev.safetensors",
        }
    }

    /// Fixed sampling step count the variant is distilled for.
    pub fn default_steps(&self) -> usize {
        match self {
            Self::Schnell => 4,
            Self::Dev => 50,
        }
    }

    pub fn default_guidance(&self) -> f64 {
        match self {
            Self::Schnell => 0.0,
            Self::Dev => 3.5,
        }
    }

    fn model_config(&self) -> model::Config {
        match self {
            Self::Schnell => model::Config::schnell(),
            Self::Dev => model::Config::dev(),
        }
    }

    fn autoencoder_config(&self) -> autoencoder::Config {
        match self {
            Self::Schnell => autoencoder::Config::schnell(),
            Self::Dev => autoencoder::Config::dev(),
        }
    }
}

/// Local paths of every file a FLUX pipeline needs, resolved through the hub cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FluxWeights {
    pub variant: FluxVariant,
    pub t5_model: PathBuf,
    pub t5_config: PathBuf,
    pub t5_tokenizer: PathBuf,
    pub clip_model: PathBuf,
    pub clip_tokenizer: PathBuf,
    pub autoencoder: PathBuf,
    pub flux: PathBuf,
}

pub struct FluxModel {
    variant: FluxVariant,
    device: Device,
    dtype: DType,
    t5_model: T5EncoderModel,
    t5_tokenizer: Tokenizer,
    clip_model: ClipTextTransformer,
    clip_tokenizer: Tokenizer,
    autoencoder: AutoEncoder,
    flux_model: Flux,
}

impl FluxModel {
    fn encode_t5(&mut self, prompt: &str) -> Result<Tensor> {
        let mut tokens = self
            .t5_tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        tokens.resize(T5_MAX_TOKENS, 0);
        let input_ids = Tensor::new(&*tokens, &self.device)?.unsqueeze(0)?;
        Ok(self.t5_model.forward(&input_ids)?)
    }

    fn encode_clip(&self, prompt: &str) -> Result<Tensor> {
        let tokens = self
            .clip_tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        let tokens = truncate_clip_tokens(tokens);
        let input_ids = Tensor::new(&*tokens, &self.device)?.unsqueeze(0)?;
        Ok(self.clip_model.forward(&input_ids)?)
    }
}

/// Cuts the sequence to the text encoder's context while keeping the final
/// end-of-text token, whose position is where the pooled output is read.
fn truncate_clip_tokens(mut tokens: Vec<u32>) -> Vec<u32> {
    if tokens.len() > CLIP_MAX_TOKENS {
        let end_of_text = tokens[tokens.len() - 1];
        tokens.truncate(CLIP_MAX_TOKENS);
        tokens[CLIP_MAX_TOKENS - 1] = end_of_text;
    }
    tokens
}

impl ModelLike for FluxModel {
    fn run(&mut self, request: &GenerationRequest) -> Result<DynamicImage> {
        let width = request.width.unwrap_or(crate::WARM_UP_SIZE);
        let height = request.height.unwrap_or(crate::WARM_UP_SIZE);
        let steps = request.steps.unwrap_or_else(|| self.variant.default_steps());
        let guidance = request
            .guidance
            .unwrap_or_else(|| self.variant.default_guidance());

        if let Some(seed) = request.seed {
            self.device.set_seed(seed)?;
        }

        let started = Instant::now();
        let noise_img = sampling::get_noise(1, height, width, &self.device)?.to_dtype(self.dtype)?;
        let t5_emb = self.encode_t5(&request.prompt)?;
        let clip_emb = self.encode_clip(&request.prompt)?;

        let state = sampling::State::new(&t5_emb, &clip_emb, &noise_img)?;
        let timesteps = match self.variant {
            FluxVariant::Schnell => sampling::get_schedule(steps, None),
            FluxVariant::Dev => sampling::get_schedule(steps, Some((state.img.dim(1)?, 0.5, 1.15))),
        };

        let latent_img = sampling::denoise(
            &self.flux_model,
            &state.img,
            &state.img_ids,
            &state.txt,
            &state.txt_ids,
            &state.vec,
            &timesteps,
            guidance,
        )?;
        let unpacked = sampling::unpack(&latent_img, height, width)?;
        tracing::debug!(steps, "denoised latent image");

        let decoded = self.autoencoder.decode(&unpacked)?;
        let img = ((decoded.clamp(-1f32, 1f32)? + 1.0)? * 127.5)?.to_dtype(DType::U8)?;
        let img = tensor_to_image(&img.i(0)?)?;

        tracing::info!(
            width,
            height,
            steps,
            latency_secs = started.elapsed().as_secs_f64(),
            "generated image"
        );
        Ok(img)
    }
}

pub struct FluxLoader;

impl Loader for FluxLoader {
    type Variant = FluxVariant;
    type Weights = FluxWeights;
    type Model = FluxModel;

    fn fetch(variant: FluxVariant, api: &Api) -> Result<FluxWeights> {
        let t5_repo = api.repo(hf_hub::Repo::with_revision(
            T5_REPO.to_string(),
            hf_hub::RepoType::Model,
            T5_REVISION.to_string(),
        ));
        let t5_model = t5_repo
            .get("model.safetensors")
            .context("failed to fetch T5 model file")?;
        let t5_config = t5_repo
            .get("config.json")
            .context("failed to fetch T5 config")?;
        let t5_tokenizer = api
            .model(T5_TOKENIZER_REPO.to_string())
            .get(T5_TOKENIZER_FILE)
            .context("failed to fetch T5 tokenizer")?;

        let clip_repo = api.model(CLIP_TEXT_REPO.to_string());
        let clip_model = clip_repo
            .get("model.safetensors")
            .context("failed to fetch CLIP model file")?;
        let clip_tokenizer = clip_repo
            .get("tokenizer.json")
            .context("failed to fetch CLIP tokenizer")?;

        let bf_repo = api.model(variant.repo().to_string());
        let autoencoder = bf_repo
            .get("ae.safetensors")
            .context("failed to fetch autoencoder model file")?;
        let flux = bf_repo
            .get(variant.weights_file())
            .context("failed to fetch flux model file")?;

        Ok(FluxWeights {
            variant,
            t5_model,
            t5_config,
            t5_tokenizer,
            clip_model,
            clip_tokenizer,
            autoencoder,
            flux,
        })
    }

    fn load(weights: &FluxWeights, device: &Device) -> Result<FluxModel> {
        let device = device.clone();
        let dtype = device.bf16_default_to_f32();
        let variant = weights.variant;

        // --- T5 encoder ---
        let t5_vb = unsafe {
            candle_nn::VarBuilder::from_mmaped_safetensors(&[&weights.t5_model], dtype, &device)
                .context("failed to build T5 var builder")?
        };
        let config_str =
            std::fs::read_to_string(&weights.t5_config).context("failed to read T5 config")?;
        let t5_config: t5::Config =
            serde_json::from_str(&config_str).context("failed to parse T5 config")?;
        let t5_model =
            T5EncoderModel::load(t5_vb, &t5_config).context("failed to load T5 model")?;
        let t5_tokenizer = Tokenizer::from_file(&weights.t5_tokenizer)
            .map_err(Error::msg)
            .context("failed to load T5 tokenizer")?;

        // --- CLIP text encoder ---
        let clip_vb = unsafe {
            candle_nn::VarBuilder::from_mmaped_safetensors(&[&weights.clip_model], dtype, &device)
                .context("failed to build CLIP var builder")?
        };
        let clip_config = ClipTextConfig {
            vocab_size: 49408,
            projection_dim: 768,
            activation: Activation::QuickGelu,
            intermediate_size: 3072,
            embed_dim: 768,
            max_position_embeddings: CLIP_MAX_TOKENS,
            pad_with: None,
            num_hidden_layers: 12,
            num_attention_heads: 12,
        };
        let clip_model = ClipTextTransformer::new(clip_vb.pp("text_model"), &clip_config)
            .context("failed to load CLIP model")?;
        let clip_tokenizer = Tokenizer::from_file(&weights.clip_tokenizer)
            .map_err(Error::msg)
            .context("failed to load CLIP tokenizer")?;

        // --- Autoencoder ---
        let autoencoder_vb = unsafe {
            candle_nn::VarBuilder::from_mmaped_safetensors(&[&weights.autoencoder], dtype, &device)
                .context("failed to build autoencoder var builder")?
        };
        let autoencoder = AutoEncoder::new(&variant.autoencoder_config(), autoencoder_vb)
            .context("failed to load autoencoder")?;

        // --- Transformer (non-quantized, fused qkv projections) ---
        let flux_vb = unsafe {
            candle_nn::VarBuilder::from_mmaped_safetensors(&[&weights.flux], dtype, &device)
                .context("failed to build flux var builder")?
        };
        let flux_model =
            Flux::new(&variant.model_config(), flux_vb).context("failed to load flux model")?;

        tracing::info!(?variant, ?dtype, "loaded flux pipeline");

        Ok(FluxModel {
            variant,
            device,
            dtype,
            t5_model,
            t5_tokenizer,
            clip_model,
            clip_tokenizer,
            autoencoder,
            flux_model,
        })
    }
}
