use crate::config::SchedulerConfig;

/// Training noise levels of a scaled-linear beta schedule, kept in log-sigma space so
/// fractional timesteps can be interpolated.
#[derive(Debug, Clone)]
pub(crate) struct NoiseSchedule {
    log_sigmas: Vec<f64>,
}

/// The timesteps and noise levels one sampling run walks through.
///
/// `sigmas` has one more entry than `timesteps`; the last one is always `0.0`.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SamplingPlan {
    pub timesteps: Vec<f64>,
    pub sigmas: Vec<f64>,
}

impl NoiseSchedule {
    pub fn scaled_linear(config: &SchedulerConfig) -> Self {
        let n = config.train_timesteps;
        let start = config.beta_start.sqrt();
        let end = config.beta_end.sqrt();
        let mut alphas_cumprod = 1.0;
        let log_sigmas = (0..n)
            .map(|i| {
                let beta = (start + (end - start) * i as f64 / (n - 1) as f64).powi(2);
                alphas_cumprod *= 1.0 - beta;
                ((1.0 - alphas_cumprod) / alphas_cumprod).sqrt().ln()
            })
            .collect();
        Self { log_sigmas }
    }

    fn sigma_at(&self, timestep: f64) -> f64 {
        let last = self.log_sigmas.len() - 1;
        let timestep = timestep.clamp(0.0, last as f64);
        let low = timestep.floor() as usize;
        let high = (low + 1).min(last);
        let w = timestep - low as f64;
        ((1.0 - w) * self.log_sigmas[low] + w * self.log_sigmas[high]).exp()
    }

    /// Evenly spaced timesteps from the noisiest training step down to zero.
    pub fn plan(&self, steps: usize) -> SamplingPlan {
        let last = (self.log_sigmas.len() - 1) as f64;
        let timesteps: Vec<f64> = match steps {
            0 => Vec::new(),
            1 => vec![last],
            _ => (0..steps)
                .map(|i| last - last * i as f64 / (steps - 1) as f64)
                .collect(),
        };
        let mut sigmas: Vec<f64> = timesteps.iter().map(|&t| self.sigma_at(t)).collect();
        sigmas.push(0.0);
        SamplingPlan { timesteps, sigmas }
    }
}

/// Splits a step from `sigma_from` to `sigma_to` into a deterministic part and the amount
/// of fresh noise to add back. Returns `(sigma_down, sigma_up)`.
pub(crate) fn ancestral_split(sigma_from: f64, sigma_to: f64) -> (f64, f64) {
    if sigma_to <= 0.0 {
        return (0.0, 0.0);
    }
    let from2 = sigma_from * sigma_from;
    let to2 = sigma_to * sigma_to;
    let sigma_up = (to2 * (from2 - to2) / from2).max(0.0).sqrt().min(sigma_to);
    let sigma_down = (to2 - sigma_up * sigma_up).max(0.0).sqrt();
    (sigma_down, sigma_up)
}
