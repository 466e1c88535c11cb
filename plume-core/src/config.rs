use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::assets::AssetSource;
use crate::error::{PipelineError, PipelineResult};
use crate::PromptPair;

/// Edge length of the generated image.
pub const IMAGE_SIZE: usize = 512;
pub const IMAGE_CHANNELS: usize = 3;
pub const LATENT_CHANNELS: usize = 4;
/// Spatial downscale between pixel space and latent space.
pub const LATENT_SCALE: usize = 8;
pub const LATENT_SIZE: usize = IMAGE_SIZE / LATENT_SCALE;

/// Everything `Pipeline::load` needs besides the asset source itself.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub vocabulary_path: String,
    pub diffusion_model_path: String,
    pub text_encoder_path: String,
    pub decoder_path: String,
    pub default_prompts: PromptPair,
    pub text_encoder: TextEncoderConfig,
    pub denoiser: DenoiserConfig,
    pub decoder: DecoderConfig,
    pub scheduler: SchedulerConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            vocabulary_path: "vocab.json".to_string(),
            diffusion_model_path: "unet.safetensors".to_string(),
            text_encoder_path: "text_encoder.safetensors".to_string(),
            decoder_path: "decoder.safetensors".to_string(),
            default_prompts: PromptPair::default(),
            text_encoder: TextEncoderConfig::default(),
            denoiser: DenoiserConfig::default(),
            decoder: DecoderConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_json_str(json: &str) -> PipelineResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| PipelineError::invalid_config(format!("malformed config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> PipelineResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))
            .map_err(|e| PipelineError::invalid_config(format!("{e:#}")))?;
        Self::from_json_str(&json)
    }

    /// Reads the config from the same place the weights come from.
    pub fn from_assets(assets: &dyn AssetSource, path: &str) -> PipelineResult<Self> {
        let bytes = assets
            .read(path)
            .map_err(|e| PipelineError::invalid_config(format!("{e:#}")))?;
        let json = std::str::from_utf8(&bytes)
            .map_err(|e| PipelineError::invalid_config(format!("{path} is not utf-8: {e}")))?;
        Self::from_json_str(json)
    }

    /// Replaces the two caller-named resources, keeping everything else.
    pub fn with_paths(mut self, vocabulary_path: &str, diffusion_model_path: &str) -> Self {
        self.vocabulary_path = vocabulary_path.to_string();
        self.diffusion_model_path = diffusion_model_path.to_string();
        self
    }

    /// Checks that the stage configurations fit together.
    pub fn validate(&self) -> PipelineResult<()> {
        let text = &self.text_encoder;
        if text.num_attention_heads == 0 || text.embed_dim % text.num_attention_heads != 0 {
            return Err(PipelineError::invalid_config(format!(
                "text encoder width {} is not divisible into {} heads",
                text.embed_dim, text.num_attention_heads
            )));
        }
        if text.max_position_embeddings < 2 {
            return Err(PipelineError::invalid_config(
                "text encoder needs room for at least the begin and end tokens",
            ));
        }

        let denoiser = &self.denoiser;
        if denoiser.context_dim != text.embed_dim {
            return Err(PipelineError::invalid_config(format!(
                "denoiser context size {} does not match text encoder width {}",
                denoiser.context_dim, text.embed_dim
            )));
        }
        check_groups("denoiser", denoiser.model_channels, denoiser.norm_groups)?;
        if denoiser.num_heads == 0 || denoiser.model_channels % denoiser.num_heads != 0 {
            return Err(PipelineError::invalid_config(format!(
                "denoiser width {} is not divisible into {} heads",
                denoiser.model_channels, denoiser.num_heads
            )));
        }
        if denoiser.time_proj_dim == 0 || denoiser.time_proj_dim % 2 != 0 {
            return Err(PipelineError::invalid_config(
                "denoiser timestep projection must have an even, non-zero size",
            ));
        }

        let decoder = &self.decoder;
        check_groups("decoder", decoder.block_channels, decoder.norm_groups)?;
        let scale = u32::try_from(decoder.up_blocks)
            .ok()
            .and_then(|n| 1usize.checked_shl(n));
        if scale != Some(LATENT_SCALE) {
            return Err(PipelineError::invalid_config(format!(
                "decoder with {} up blocks does not upscale latents by {LATENT_SCALE}",
                decoder.up_blocks
            )));
        }
        if !(decoder.scaling_factor.is_finite() && decoder.scaling_factor > 0.0) {
            return Err(PipelineError::invalid_config(
                "decoder scaling factor must be positive",
            ));
        }

        let scheduler = &self.scheduler;
        if scheduler.train_timesteps < 2 {
            return Err(PipelineError::invalid_config(
                "scheduler needs at least two training timesteps",
            ));
        }
        if !(0.0 < scheduler.beta_start
            && scheduler.beta_start < scheduler.beta_end
            && scheduler.beta_end < 1.0)
        {
            return Err(PipelineError::invalid_config(format!(
                "beta range {}..{} is not increasing within (0, 1)",
                scheduler.beta_start, scheduler.beta_end
            )));
        }
        if !scheduler.guidance_scale.is_finite() {
            return Err(PipelineError::invalid_config("guidance scale must be finite"));
        }
        Ok(())
    }
}

fn check_groups(stage: &str, channels: usize, groups: usize) -> PipelineResult<()> {
    if groups == 0 || channels == 0 || channels % groups != 0 {
        return Err(PipelineError::invalid_config(format!(
            "{stage} has {channels} channels, not divisible into {groups} norm groups"
        )));
    }
    Ok(())
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct TextEncoderConfig {
    pub vocab_size: usize,
    pub embed_dim: usize,
    pub intermediate_size: usize,
    /// Fixed token length every prompt is padded or truncated to.
    pub max_position_embeddings: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub bos_token: String,
    pub eos_token: String,
    /// Defaults to the end token.
    pub pad_token: Option<String>,
}

impl Default for TextEncoderConfig {
    fn default() -> Self {
        Self {
            vocab_size: 49408,
            embed_dim: 768,
            intermediate_size: 3072,
            max_position_embeddings: 77,
            num_hidden_layers: 12,
            num_attention_heads: 12,
            bos_token: "<|startoftext|>".to_string(),
            eos_token: "<|endoftext|>".to_string(),
            pad_token: None,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct DenoiserConfig {
    pub model_channels: usize,
    pub time_proj_dim: usize,
    pub context_dim: usize,
    pub num_heads: usize,
    pub norm_groups: usize,
}

impl Default for DenoiserConfig {
    fn default() -> Self {
        Self {
            model_channels: 320,
            time_proj_dim: 320,
            context_dim: 768,
            num_heads: 8,
            norm_groups: 32,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct DecoderConfig {
    pub block_channels: usize,
    pub up_blocks: usize,
    pub norm_groups: usize,
    pub scaling_factor: f64,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            block_channels: 128,
            up_blocks: 3,
            norm_groups: 32,
            scaling_factor: 0.18215,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SamplerKind {
    Euler,
    #[default]
    EulerAncestral,
}

serde_plain::derive_display_from_serialize!(SamplerKind);
serde_plain::derive_fromstr_from_deserialize!(SamplerKind);

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerConfig {
    pub sampler: SamplerKind,
    pub guidance_scale: f64,
    pub train_timesteps: usize,
    pub beta_start: f64,
    pub beta_end: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sampler: SamplerKind::default(),
            guidance_scale: 7.5,
            train_timesteps: 1000,
            beta_start: 0.00085,
            beta_end: 0.012,
        }
    }
}
