use anyhow::Context;
use candle_core::{DType, Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

mod denoiser;
mod schedule;

pub(crate) use denoiser::NoisePredictor;
use schedule::{ancestral_split, NoiseSchedule};

use crate::assets::AssetSource;
use crate::config::{
    DenoiserConfig, SamplerKind, SchedulerConfig, LATENT_CHANNELS, LATENT_SIZE,
};
use crate::error::{PipelineError, PipelineResult};
use crate::loader::{read_resource, weights_var_builder, Loader};
use crate::{Conditioning, PipelineConfig, Resource, ResourceEnvironment, MAX_STEPS};

const LATENT_SHAPE: (usize, usize, usize, usize) = (1, LATENT_CHANNELS, LATENT_SIZE, LATENT_SIZE);

/// A latent image of shape (1, 4, 64, 64).
#[derive(Debug, Clone)]
pub struct Latent(Tensor);

impl Latent {
    pub fn from_tensor(tensor: Tensor) -> Self {
        Self(tensor)
    }

    pub fn tensor(&self) -> &Tensor {
        &self.0
    }

    pub fn dims(&self) -> &[usize] {
        self.0.dims()
    }

    pub fn expected_dims() -> [usize; 4] {
        let (b, c, h, w) = LATENT_SHAPE;
        [b, c, h, w]
    }
}

/// Standard normal samples drawn from the seeded stream.
fn gaussian_noise(
    rng: &mut StdRng,
    dtype: DType,
    device: &Device,
) -> candle_core::Result<Tensor> {
    let (b, c, h, w) = LATENT_SHAPE;
    let values: Vec<f32> = (&mut *rng)
        .sample_iter(StandardNormal)
        .take(b * c * h * w)
        .collect();
    Tensor::from_vec(values, LATENT_SHAPE, device)?.to_dtype(dtype)
}

fn ensure_finite(latent: &Tensor, step: usize) -> PipelineResult<()> {
    let values = latent.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?;
    if values.iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(PipelineError::NonFinite {
            stage: "sampler",
            step,
        })
    }
}

/// Runs the guided denoising loop over a seeded latent.
#[derive(Debug)]
pub struct DenoisingSampler {
    model: NoisePredictor,
    schedule: NoiseSchedule,
    sampler: SamplerKind,
    guidance_scale: f64,
    context_dim: usize,
    device: Device,
    dtype: DType,
}

impl Loader for DenoisingSampler {
    fn load(
        assets: &dyn AssetSource,
        config: &PipelineConfig,
        env: &ResourceEnvironment,
    ) -> PipelineResult<Self> {
        let weights = read_resource(
            assets,
            &config.diffusion_model_path,
            Resource::DiffusionWeights,
        )?;
        Self::from_bytes(weights, &config.denoiser, &config.scheduler, env)
    }
}

impl DenoisingSampler {
    pub fn from_bytes(
        weights: Vec<u8>,
        config: &DenoiserConfig,
        scheduler: &SchedulerConfig,
        env: &ResourceEnvironment,
    ) -> PipelineResult<Self> {
        let model = weights_var_builder(weights, env)
            .and_then(|vb| NoisePredictor::new(vb, config).context("failed to load denoiser"))
            .map_err(|e| PipelineError::resource_load(Resource::DiffusionWeights, e))?;
        tracing::info!(
            channels = config.model_channels,
            sampler = %scheduler.sampler,
            guidance_scale = scheduler.guidance_scale,
            "loaded denoising sampler"
        );
        Ok(Self {
            model,
            schedule: NoiseSchedule::scaled_linear(scheduler),
            sampler: scheduler.sampler,
            guidance_scale: scheduler.guidance_scale,
            context_dim: config.context_dim,
            device: env.device().clone(),
            dtype: env.dtype(),
        })
    }

    fn check_conditioning(
        &self,
        positive: &Conditioning,
        negative: &Conditioning,
    ) -> PipelineResult<()> {
        let dims = positive.dims();
        if dims != negative.dims() {
            return Err(PipelineError::contract(format!(
                "positive conditioning {:?} and negative conditioning {:?} differ",
                dims,
                negative.dims()
            )));
        }
        match dims {
            [1, _, width] if *width == self.context_dim => Ok(()),
            _ => Err(PipelineError::contract(format!(
                "conditioning {dims:?} does not fit a context of width {}",
                self.context_dim
            ))),
        }
    }

    /// Refines seeded noise for exactly `steps` iterations, at most `MAX_STEPS`.
    ///
    /// Every random draw, including the noise re-injected by ancestral steps, comes from
    /// one stream seeded by `seed`.
    pub fn sample(
        &self,
        seed: u64,
        steps: usize,
        positive: &Conditioning,
        negative: &Conditioning,
    ) -> PipelineResult<Latent> {
        if steps == 0 {
            return Err(PipelineError::invalid_request(
                "step count must be at least 1",
            ));
        }
        if steps > MAX_STEPS {
            return Err(PipelineError::invalid_request(format!(
                "step count {steps} exceeds the maximum of {MAX_STEPS}"
            )));
        }
        self.check_conditioning(positive, negative)?;

        let mut rng = StdRng::seed_from_u64(seed);
        let plan = self.schedule.plan(steps);
        let context = Tensor::cat(&[negative.tensor(), positive.tensor()], 0)?;
        let mut latent = (gaussian_noise(&mut rng, self.dtype, &self.device)? * plan.sigmas[0])?;

        for (step, &timestep) in plan.timesteps.iter().enumerate() {
            let sigma = plan.sigmas[step];
            let sigma_next = plan.sigmas[step + 1];

            let scaled = (&latent * (1.0 / (sigma * sigma + 1.0).sqrt()))?;
            let batch = Tensor::cat(&[&scaled, &scaled], 0)?;
            let eps = self.model.forward(&batch, timestep, &context)?;
            let eps = eps.chunk(2, 0)?;
            let (eps_negative, eps_positive) = (&eps[0], &eps[1]);
            let eps = (eps_negative + ((eps_positive - eps_negative)? * self.guidance_scale)?)?;

            latent = match self.sampler {
                SamplerKind::Euler => (&latent + (eps * (sigma_next - sigma))?)?,
                SamplerKind::EulerAncestral => {
                    let (sigma_down, sigma_up) = ancestral_split(sigma, sigma_next);
                    let stepped = (&latent + (eps * (sigma_down - sigma))?)?;
                    if sigma_up > 0.0 {
                        let noise = gaussian_noise(&mut rng, self.dtype, &self.device)?;
                        (stepped + (noise * sigma_up)?)?
                    } else {
                        stepped
                    }
                }
            };
            ensure_finite(&latent, step)?;
            tracing::trace!(step, timestep, sigma, "sampling step");
        }
        tracing::debug!(seed, steps, "sampled latent");
        Ok(Latent(latent))
    }
}
