use anyhow::Context;
use candle_core::{DType, Module, Tensor};
use candle_nn::{conv2d, group_norm, Conv2d, Conv2dConfig, GroupNorm, VarBuilder};
use image::RgbImage;

use crate::assets::AssetSource;
use crate::config::{DecoderConfig, IMAGE_CHANNELS, IMAGE_SIZE, LATENT_CHANNELS};
use crate::error::{PipelineError, PipelineResult};
use crate::loader::{read_resource, weights_var_builder, Loader};
use crate::{Latent, PipelineConfig, Resource, ResourceEnvironment};

const NORM_EPS: f64 = 1e-6;

/// Decoded pixels: `u8` of shape (512, 512, 3), RGB, row-major.
#[derive(Debug, Clone)]
pub struct ImageTensor(Tensor);

impl ImageTensor {
    pub fn tensor(&self) -> &Tensor {
        &self.0
    }

    pub fn dims(&self) -> &[usize] {
        self.0.dims()
    }

    pub fn expected_dims() -> [usize; 3] {
        [IMAGE_SIZE, IMAGE_SIZE, IMAGE_CHANNELS]
    }

    /// Interleaved RGB bytes.
    pub fn to_bytes(&self) -> PipelineResult<Vec<u8>> {
        Ok(self.0.flatten_all()?.to_vec1::<u8>()?)
    }

    pub fn to_rgb_image(&self) -> PipelineResult<RgbImage> {
        let (height, width, channels) = self.0.dims3()?;
        if channels != IMAGE_CHANNELS {
            return Err(PipelineError::contract(format!(
                "image has {channels} channels, expected {IMAGE_CHANNELS}"
            )));
        }
        RgbImage::from_raw(width as u32, height as u32, self.to_bytes()?)
            .ok_or_else(|| PipelineError::contract("error converting tensor to image buffer"))
    }
}

fn conv3x3(in_channels: usize, out_channels: usize, vb: VarBuilder) -> candle_core::Result<Conv2d> {
    let config = Conv2dConfig {
        padding: 1,
        ..Default::default()
    };
    conv2d(in_channels, out_channels, 3, config, vb)
}

#[derive(Debug)]
struct MidBlock {
    norm1: GroupNorm,
    conv1: Conv2d,
    norm2: GroupNorm,
    conv2: Conv2d,
}

impl MidBlock {
    fn new(vb: VarBuilder, config: &DecoderConfig) -> candle_core::Result<Self> {
        let (channels, groups) = (config.block_channels, config.norm_groups);
        Ok(Self {
            norm1: group_norm(groups, channels, NORM_EPS, vb.pp("norm1"))?,
            conv1: conv3x3(channels, channels, vb.pp("conv1"))?,
            norm2: group_norm(groups, channels, NORM_EPS, vb.pp("norm2"))?,
            conv2: conv3x3(channels, channels, vb.pp("conv2"))?,
        })
    }
}

impl Module for MidBlock {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let h = self
            .conv1
            .forward(&candle_nn::ops::silu(&self.norm1.forward(xs)?)?)?;
        let h = self
            .conv2
            .forward(&candle_nn::ops::silu(&self.norm2.forward(&h)?)?)?;
        xs + h
    }
}

/// Nearest-neighbour x2 upsample followed by a conv.
#[derive(Debug)]
struct UpBlock {
    conv: Conv2d,
}

impl Module for UpBlock {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let (_, _, height, width) = xs.dims4()?;
        let xs = xs.upsample_nearest2d(height * 2, width * 2)?;
        candle_nn::ops::silu(&self.conv.forward(&xs)?)
    }
}

/// Latent-to-pixel network.
#[derive(Debug)]
pub(crate) struct DecoderNet {
    conv_in: Conv2d,
    mid: MidBlock,
    up_blocks: Vec<UpBlock>,
    norm_out: GroupNorm,
    conv_out: Conv2d,
}

impl DecoderNet {
    pub(crate) fn new(vb: VarBuilder, config: &DecoderConfig) -> candle_core::Result<Self> {
        let channels = config.block_channels;
        let up_blocks = (0..config.up_blocks)
            .map(|index| {
                conv3x3(channels, channels, vb.pp(format!("up_blocks.{index}.conv")))
                    .map(|conv| UpBlock { conv })
            })
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Self {
            conv_in: conv3x3(LATENT_CHANNELS, channels, vb.pp("conv_in"))?,
            mid: MidBlock::new(vb.pp("mid"), config)?,
            up_blocks,
            norm_out: group_norm(config.norm_groups, channels, NORM_EPS, vb.pp("norm_out"))?,
            conv_out: conv3x3(channels, IMAGE_CHANNELS, vb.pp("conv_out"))?,
        })
    }
}

impl Module for DecoderNet {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let mut xs = self.mid.forward(&self.conv_in.forward(xs)?)?;
        for block in &self.up_blocks {
            xs = block.forward(&xs)?;
        }
        let xs = candle_nn::ops::silu(&self.norm_out.forward(&xs)?)?;
        self.conv_out.forward(&xs)
    }
}

/// Maps latents to pixel-space images.
#[derive(Debug)]
pub struct LatentDecoder {
    model: DecoderNet,
    scaling_factor: f64,
}

impl Loader for LatentDecoder {
    fn load(
        assets: &dyn AssetSource,
        config: &PipelineConfig,
        env: &ResourceEnvironment,
    ) -> PipelineResult<Self> {
        let weights = read_resource(assets, &config.decoder_path, Resource::DecoderWeights)?;
        Self::from_bytes(weights, &config.decoder, env)
    }
}

impl LatentDecoder {
    pub fn from_bytes(
        weights: Vec<u8>,
        config: &DecoderConfig,
        env: &ResourceEnvironment,
    ) -> PipelineResult<Self> {
        let model = weights_var_builder(weights, env)
            .and_then(|vb| DecoderNet::new(vb, config).context("failed to load decoder"))
            .map_err(|e| PipelineError::resource_load(Resource::DecoderWeights, e))?;
        tracing::info!(channels = config.block_channels, "loaded latent decoder");
        Ok(Self {
            model,
            scaling_factor: config.scaling_factor,
        })
    }

    /// Decodes a latent into `u8` pixels in `[0, 255]`.
    ///
    /// A latent of the wrong shape means an upstream stage broke its contract.
    pub fn decode(&self, latent: &Latent) -> PipelineResult<ImageTensor> {
        if latent.dims() != Latent::expected_dims() {
            return Err(PipelineError::contract(format!(
                "decoder expects a latent of shape {:?}, got {:?}",
                Latent::expected_dims(),
                latent.dims()
            )));
        }
        let decoded = self
            .model
            .forward(&(latent.tensor() / self.scaling_factor)?)?;

        let img = ((decoded.to_dtype(DType::F32)?.clamp(-1f32, 1f32)? + 1.0)? * 127.5)?
            .to_dtype(DType::U8)?;
        let img = img.squeeze(0)?.permute((1, 2, 0))?.contiguous()?;
        if img.dims() != ImageTensor::expected_dims() {
            return Err(PipelineError::contract(format!(
                "decoder produced {:?}, expected {:?}",
                img.dims(),
                ImageTensor::expected_dims()
            )));
        }
        tracing::debug!("decoded image");
        Ok(ImageTensor(img))
    }
}
