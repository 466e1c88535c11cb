//! Tiny randomly initialised models for exercising the pipeline on CPU.

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use serde_json::{json, Map, Value};

use crate::config::{DecoderConfig, DenoiserConfig, SchedulerConfig, TextEncoderConfig};
use crate::decoder::DecoderNet;
use crate::sampler::NoisePredictor;
use crate::text_encoder::TextTransformer;
use crate::{MemoryAssets, PipelineConfig, PromptPair};

const WORDS: &[&str] = &[
    "<|startoftext|>",
    "<|endoftext|>",
    "<|unk|>",
    "a",
    "red",
    "circle",
    "blurry",
    "blue",
    "square",
    "lowres",
    "scenic",
    "mountain",
    "landscape",
    "at",
    "golden",
    "hour",
    "detailed",
    "out",
    "of",
    "focus",
    ",",
];

pub(crate) const UNK_ID: u32 = 2;

/// A lowercasing, whitespace-split word-level vocabulary.
pub(crate) fn tokenizer_json() -> String {
    let vocab: Map<String, Value> = WORDS
        .iter()
        .enumerate()
        .map(|(id, word)| (word.to_string(), json!(id)))
        .collect();
    json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [],
        "normalizer": { "type": "Lowercase" },
        "pre_tokenizer": { "type": "Whitespace" },
        "post_processor": null,
        "decoder": null,
        "model": {
            "type": "WordLevel",
            "vocab": vocab,
            "unk_token": "<|unk|>"
        }
    })
    .to_string()
}

pub(crate) fn tiny_config() -> PipelineConfig {
    PipelineConfig {
        vocabulary_path: "vocab.bin".to_string(),
        diffusion_model_path: "model.bin".to_string(),
        text_encoder_path: "text_encoder.safetensors".to_string(),
        decoder_path: "decoder.safetensors".to_string(),
        default_prompts: PromptPair::default(),
        text_encoder: TextEncoderConfig {
            vocab_size: 32,
            embed_dim: 16,
            intermediate_size: 32,
            max_position_embeddings: 8,
            num_hidden_layers: 1,
            num_attention_heads: 2,
            ..Default::default()
        },
        denoiser: DenoiserConfig {
            model_channels: 8,
            time_proj_dim: 8,
            context_dim: 16,
            num_heads: 2,
            norm_groups: 4,
        },
        decoder: DecoderConfig {
            block_channels: 8,
            up_blocks: 3,
            norm_groups: 4,
            scaling_factor: 0.18215,
        },
        scheduler: SchedulerConfig::default(),
    }
}

fn random_weights(build: impl FnOnce(VarBuilder) -> candle_core::Result<()>) -> Vec<u8> {
    let varmap = VarMap::new();
    build(VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu)).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("weights.safetensors");
    varmap.save(&path).unwrap();
    std::fs::read(&path).unwrap()
}

pub(crate) fn text_encoder_weights(config: &PipelineConfig) -> Vec<u8> {
    random_weights(|vb| TextTransformer::new(vb, &config.text_encoder).map(drop))
}

pub(crate) fn denoiser_weights(config: &PipelineConfig) -> Vec<u8> {
    random_weights(|vb| NoisePredictor::new(vb, &config.denoiser).map(drop))
}

pub(crate) fn decoder_weights(config: &PipelineConfig) -> Vec<u8> {
    random_weights(|vb| DecoderNet::new(vb, &config.decoder).map(drop))
}

/// The tiny config plus every asset it names.
pub(crate) fn tiny_assets() -> (PipelineConfig, MemoryAssets) {
    let config = tiny_config();
    let mut assets = MemoryAssets::new();
    assets
        .insert(config.vocabulary_path.clone(), tokenizer_json())
        .insert(config.text_encoder_path.clone(), text_encoder_weights(&config))
        .insert(config.diffusion_model_path.clone(), denoiser_weights(&config))
        .insert(config.decoder_path.clone(), decoder_weights(&config));
    (config, assets)
}

pub(crate) fn to_vec(tensor: &Tensor) -> Vec<f32> {
    tensor
        .flatten_all()
        .unwrap()
        .to_dtype(DType::F32)
        .unwrap()
        .to_vec1::<f32>()
        .unwrap()
}
