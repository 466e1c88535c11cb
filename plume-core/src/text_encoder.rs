use anyhow::{anyhow, bail, Context};
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{embedding, layer_norm, linear, Embedding, LayerNorm, Linear, VarBuilder};
use tokenizers::Tokenizer;

use crate::assets::AssetSource;
use crate::attention::Attention;
use crate::config::TextEncoderConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::loader::{read_resource, weights_var_builder, Loader};
use crate::{PipelineConfig, Resource, ResourceEnvironment};

const LAYER_NORM_EPS: f64 = 1e-5;

/// Text conditioning of shape (1, max_position_embeddings, embed_dim).
#[derive(Debug, Clone)]
pub struct Conditioning(pub(crate) Tensor);

impl Conditioning {
    pub fn tensor(&self) -> &Tensor {
        &self.0
    }

    pub fn dims(&self) -> &[usize] {
        self.0.dims()
    }
}

#[derive(Debug)]
struct Mlp {
    fc1: Linear,
    fc2: Linear,
}

impl Mlp {
    fn new(vb: VarBuilder, config: &TextEncoderConfig) -> candle_core::Result<Self> {
        let fc1 = linear(config.embed_dim, config.intermediate_size, vb.pp("fc1"))?;
        let fc2 = linear(config.intermediate_size, config.embed_dim, vb.pp("fc2"))?;
        Ok(Self { fc1, fc2 })
    }
}

impl Module for Mlp {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        self.fc2.forward(&self.fc1.forward(xs)?.gelu()?)
    }
}

#[derive(Debug)]
struct EncoderLayer {
    self_attn: Attention,
    layer_norm1: LayerNorm,
    mlp: Mlp,
    layer_norm2: LayerNorm,
}

impl EncoderLayer {
    fn new(vb: VarBuilder, config: &TextEncoderConfig) -> candle_core::Result<Self> {
        let dim = config.embed_dim;
        let self_attn = Attention::new(
            vb.pp("self_attn"),
            dim,
            dim,
            config.num_attention_heads,
            true,
        )?;
        let layer_norm1 = layer_norm(dim, LAYER_NORM_EPS, vb.pp("layer_norm1"))?;
        let mlp = Mlp::new(vb.pp("mlp"), config)?;
        let layer_norm2 = layer_norm(dim, LAYER_NORM_EPS, vb.pp("layer_norm2"))?;
        Ok(Self {
            self_attn,
            layer_norm1,
            mlp,
            layer_norm2,
        })
    }

    fn forward(&self, xs: &Tensor, causal_mask: &Tensor) -> candle_core::Result<Tensor> {
        let residual = xs;
        let xs = self.layer_norm1.forward(xs)?;
        let xs = (self.self_attn.forward(&xs, None, Some(causal_mask))? + residual)?;
        let residual = &xs;
        let out = self.mlp.forward(&self.layer_norm2.forward(&xs)?)?;
        out + residual
    }
}

/// CLIP-style causal text transformer.
#[derive(Debug)]
pub(crate) struct TextTransformer {
    token_embedding: Embedding,
    position_embedding: Embedding,
    layers: Vec<EncoderLayer>,
    final_layer_norm: LayerNorm,
}

impl TextTransformer {
    pub(crate) fn new(vb: VarBuilder, config: &TextEncoderConfig) -> candle_core::Result<Self> {
        let embeddings = vb.pp("embeddings");
        let token_embedding = embedding(
            config.vocab_size,
            config.embed_dim,
            embeddings.pp("token_embedding"),
        )?;
        let position_embedding = embedding(
            config.max_position_embeddings,
            config.embed_dim,
            embeddings.pp("position_embedding"),
        )?;
        let layers = (0..config.num_hidden_layers)
            .map(|index| EncoderLayer::new(vb.pp(format!("encoder.layers.{index}")), config))
            .collect::<candle_core::Result<Vec<_>>>()?;
        let final_layer_norm =
            layer_norm(config.embed_dim, LAYER_NORM_EPS, vb.pp("final_layer_norm"))?;
        Ok(Self {
            token_embedding,
            position_embedding,
            layers,
            final_layer_norm,
        })
    }

    fn forward(
        &self,
        input_ids: &Tensor,
        position_ids: &Tensor,
        causal_mask: &Tensor,
    ) -> candle_core::Result<Tensor> {
        let tokens = self.token_embedding.forward(input_ids)?;
        let positions = self.position_embedding.forward(position_ids)?;
        let mut xs = tokens.broadcast_add(&positions)?;
        for layer in &self.layers {
            xs = layer.forward(&xs, causal_mask)?;
        }
        self.final_layer_norm.forward(&xs)
    }
}

fn causal_mask(seq_len: usize, dtype: DType, device: &Device) -> candle_core::Result<Tensor> {
    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| (0..seq_len).map(move |j| if j > i { f32::NEG_INFINITY } else { 0.0 }))
        .collect();
    Tensor::from_vec(mask, (seq_len, seq_len), device)?.to_dtype(dtype)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SpecialTokens {
    bos: u32,
    eos: u32,
    pad: u32,
}

fn load_tokenizer(
    vocabulary: &[u8],
    config: &TextEncoderConfig,
) -> anyhow::Result<(Tokenizer, SpecialTokens)> {
    let mut tokenizer = Tokenizer::from_bytes(vocabulary)
        .map_err(anyhow::Error::msg)
        .context("failed to parse vocabulary")?;
    tokenizer
        .with_truncation(None)
        .map_err(anyhow::Error::msg)
        .context("failed to disable tokenizer truncation")?;
    tokenizer.with_padding(None);

    let vocab_size = tokenizer.get_vocab_size(true);
    if vocab_size == 0 {
        bail!("vocabulary is empty");
    }
    if vocab_size > config.vocab_size {
        bail!(
            "vocabulary has {vocab_size} entries but the encoder embeds only {}",
            config.vocab_size
        );
    }
    let lookup = |token: &str| {
        tokenizer
            .token_to_id(token)
            .ok_or_else(|| anyhow!("vocabulary has no {token:?} token"))
    };
    let special = SpecialTokens {
        bos: lookup(&config.bos_token)?,
        eos: lookup(&config.eos_token)?,
        pad: lookup(config.pad_token.as_deref().unwrap_or(&config.eos_token))?,
    };
    Ok((tokenizer, special))
}

/// Maps prompts to fixed-shape conditioning tensors.
#[derive(Debug)]
pub struct TextEncoder {
    tokenizer: Tokenizer,
    special: SpecialTokens,
    model: TextTransformer,
    max_len: usize,
    embed_dim: usize,
    position_ids: Tensor,
    causal_mask: Tensor,
    device: Device,
}

impl Loader for TextEncoder {
    fn load(
        assets: &dyn AssetSource,
        config: &PipelineConfig,
        env: &ResourceEnvironment,
    ) -> PipelineResult<Self> {
        let vocabulary = read_resource(assets, &config.vocabulary_path, Resource::Vocabulary)?;
        let weights = read_resource(
            assets,
            &config.text_encoder_path,
            Resource::TextEncoderWeights,
        )?;
        Self::from_bytes(&vocabulary, weights, &config.text_encoder, env)
    }
}

impl TextEncoder {
    pub fn from_bytes(
        vocabulary: &[u8],
        weights: Vec<u8>,
        config: &TextEncoderConfig,
        env: &ResourceEnvironment,
    ) -> PipelineResult<Self> {
        if config.max_position_embeddings < 2 {
            return Err(PipelineError::invalid_config(format!(
                "text encoder needs room for start and end tokens, got {} positions",
                config.max_position_embeddings
            )));
        }
        let (tokenizer, special) = load_tokenizer(vocabulary, config)
            .map_err(|e| PipelineError::resource_load(Resource::Vocabulary, e))?;
        let model = weights_var_builder(weights, env)
            .and_then(|vb| {
                TextTransformer::new(vb, config).context("failed to load text encoder")
            })
            .map_err(|e| PipelineError::resource_load(Resource::TextEncoderWeights, e))?;

        let max_len = config.max_position_embeddings;
        let position_ids =
            Tensor::arange(0u32, max_len as u32, env.device())?.unsqueeze(0)?;
        let causal_mask = causal_mask(max_len, env.dtype(), env.device())?;
        tracing::info!(
            vocab_size = tokenizer.get_vocab_size(true),
            max_len,
            layers = config.num_hidden_layers,
            "loaded text encoder"
        );
        Ok(Self {
            tokenizer,
            special,
            model,
            max_len,
            embed_dim: config.embed_dim,
            position_ids,
            causal_mask,
            device: env.device().clone(),
        })
    }

    /// `[bos, tokens.., eos, pad..]`, exactly `max_len` long. Long prompts lose their tail.
    pub fn token_ids(&self, prompt: &str) -> PipelineResult<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(prompt, false)
            .map_err(|e| PipelineError::contract(format!("tokenizer failed: {e}")))?;
        let body = self.max_len - 2;
        let ids = encoding.get_ids();
        if ids.len() > body {
            tracing::debug!(tokens = ids.len(), kept = body, "truncating prompt");
        }
        let mut tokens = Vec::with_capacity(self.max_len);
        tokens.push(self.special.bos);
        tokens.extend(ids.iter().take(body));
        tokens.push(self.special.eos);
        tokens.resize(self.max_len, self.special.pad);
        Ok(tokens)
    }

    pub fn encode(&self, prompt: &str) -> PipelineResult<Conditioning> {
        let tokens = self.token_ids(prompt)?;
        let input_ids = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
        let hidden = self
            .model
            .forward(&input_ids, &self.position_ids, &self.causal_mask)?;
        if hidden.dims() != self.output_shape() {
            return Err(PipelineError::contract(format!(
                "text encoder produced {:?}, expected {:?}",
                hidden.dims(),
                self.output_shape()
            )));
        }
        Ok(Conditioning(hidden))
    }

    pub fn output_shape(&self) -> [usize; 3] {
        [1, self.max_len, self.embed_dim]
    }
}
