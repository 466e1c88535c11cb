use candle_core::{Module, Result, Tensor};
use candle_nn::{conv2d, group_norm, linear, Conv2d, Conv2dConfig, GroupNorm, Linear, VarBuilder};
use candle_transformers::models::stable_diffusion::embeddings::{TimestepEmbedding, Timesteps};

use crate::attention::Attention;
use crate::config::{DenoiserConfig, LATENT_CHANNELS};

const NORM_EPS: f64 = 1e-5;

fn conv3x3(in_channels: usize, out_channels: usize, vb: VarBuilder) -> Result<Conv2d> {
    let config = Conv2dConfig {
        padding: 1,
        ..Default::default()
    };
    conv2d(in_channels, out_channels, 3, config, vb)
}

#[derive(Debug)]
struct ResBlock {
    norm1: GroupNorm,
    conv1: Conv2d,
    time_emb_proj: Linear,
    norm2: GroupNorm,
    conv2: Conv2d,
}

impl ResBlock {
    fn new(vb: VarBuilder, channels: usize, groups: usize) -> Result<Self> {
        Ok(Self {
            norm1: group_norm(groups, channels, NORM_EPS, vb.pp("norm1"))?,
            conv1: conv3x3(channels, channels, vb.pp("conv1"))?,
            time_emb_proj: linear(channels, channels, vb.pp("time_emb_proj"))?,
            norm2: group_norm(groups, channels, NORM_EPS, vb.pp("norm2"))?,
            conv2: conv3x3(channels, channels, vb.pp("conv2"))?,
        })
    }

    fn forward(&self, xs: &Tensor, temb: &Tensor) -> Result<Tensor> {
        let h = candle_nn::ops::silu(&self.norm1.forward(xs)?)?;
        let h = self.conv1.forward(&h)?;
        let t = self
            .time_emb_proj
            .forward(&candle_nn::ops::silu(temb)?)?
            .unsqueeze(2)?
            .unsqueeze(3)?;
        let h = h.broadcast_add(&t)?;
        let h = candle_nn::ops::silu(&self.norm2.forward(&h)?)?;
        xs + self.conv2.forward(&h)?
    }
}

/// Lets every latent position attend to the text tokens.
#[derive(Debug)]
struct CrossAttnBlock {
    norm: GroupNorm,
    attn: Attention,
}

impl CrossAttnBlock {
    fn new(vb: VarBuilder, config: &DenoiserConfig) -> Result<Self> {
        Ok(Self {
            norm: group_norm(
                config.norm_groups,
                config.model_channels,
                NORM_EPS,
                vb.pp("norm"),
            )?,
            attn: Attention::new(
                vb.pp("attn"),
                config.model_channels,
                config.context_dim,
                config.num_heads,
                false,
            )?,
        })
    }

    fn forward(&self, xs: &Tensor, context: &Tensor) -> Result<Tensor> {
        let (batch, channels, height, width) = xs.dims4()?;
        let h = self
            .norm
            .forward(xs)?
            .reshape((batch, channels, height * width))?
            .transpose(1, 2)?
            .contiguous()?;
        let h = self.attn.forward(&h, Some(context), None)?;
        let h = h
            .transpose(1, 2)?
            .reshape((batch, channels, height, width))?;
        xs + h
    }
}

/// Predicts the noise in a latent given a timestep and text conditioning.
#[derive(Debug)]
pub(crate) struct NoisePredictor {
    time_proj: Timesteps,
    time_embedding: TimestepEmbedding,
    conv_in: Conv2d,
    res_in: ResBlock,
    cross_attn: CrossAttnBlock,
    res_out: ResBlock,
    norm_out: GroupNorm,
    conv_out: Conv2d,
}

impl NoisePredictor {
    pub(crate) fn new(vb: VarBuilder, config: &DenoiserConfig) -> Result<Self> {
        let channels = config.model_channels;
        let groups = config.norm_groups;
        Ok(Self {
            time_proj: Timesteps::new(config.time_proj_dim, true, 0.0),
            time_embedding: TimestepEmbedding::new(
                vb.pp("time_embedding"),
                config.time_proj_dim,
                channels,
            )?,
            conv_in: conv3x3(LATENT_CHANNELS, channels, vb.pp("conv_in"))?,
            res_in: ResBlock::new(vb.pp("res_in"), channels, groups)?,
            cross_attn: CrossAttnBlock::new(vb.pp("cross_attn"), config)?,
            res_out: ResBlock::new(vb.pp("res_out"), channels, groups)?,
            norm_out: group_norm(groups, channels, NORM_EPS, vb.pp("norm_out"))?,
            conv_out: conv3x3(channels, LATENT_CHANNELS, vb.pp("conv_out"))?,
        })
    }

    /// `latent`: (batch, 4, h, w), already scaled for the current noise level.
    /// `context`: (batch, seq, context_dim).
    pub(crate) fn forward(&self, latent: &Tensor, timestep: f64, context: &Tensor) -> Result<Tensor> {
        let batch = latent.dim(0)?;
        let t = Tensor::full(timestep as f32, batch, latent.device())?;
        let temb = self.time_proj.forward(&t)?.to_dtype(latent.dtype())?;
        let temb = self.time_embedding.forward(&temb)?;

        let xs = self.conv_in.forward(latent)?;
        let xs = self.res_in.forward(&xs, &temb)?;
        let xs = self.cross_attn.forward(&xs, context)?;
        let xs = self.res_out.forward(&xs, &temb)?;
        let xs = candle_nn::ops::silu(&self.norm_out.forward(&xs)?)?;
        self.conv_out.forward(&xs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn prediction_matches_latent_shape() {
        let config = testing::tiny_config();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = NoisePredictor::new(vb, &config.denoiser).unwrap();
        let latent = Tensor::randn(0f32, 1., (2, LATENT_CHANNELS, 16, 16), &Device::Cpu).unwrap();
        let context = Tensor::randn(
            0f32,
            1.,
            (2, config.text_encoder.max_position_embeddings, config.denoiser.context_dim),
            &Device::Cpu,
        )
        .unwrap();
        let eps = model.forward(&latent, 999.0, &context).unwrap();
        assert_eq!(eps.dims(), latent.dims());
    }
}
