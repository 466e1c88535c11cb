#[cfg(feature = "accelerate")]
extern crate accelerate_src;
#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

pub mod assets;
pub mod config;
pub mod device_map;
pub mod environment;
pub mod error;
pub mod host;
pub mod loader;
pub mod pixels;

mod attention;
mod decoder;
mod pipeline;
mod prompt;
mod sampler;
mod text_encoder;

#[cfg(test)]
mod testing;

pub use assets::{AssetLocation, AssetSource, DirAssets, HubAssets, MemoryAssets};
pub use config::{PipelineConfig, SamplerKind};
pub use decoder::{ImageTensor, LatentDecoder};
pub use device_map::*;
pub use environment::ResourceEnvironment;
pub use error::{PipelineError, PipelineResult, Resource};
pub use loader::Loader;
pub use pipeline::{Pipeline, PipelineState, Stage};
pub use pixels::{PixelBuffer, PixelFormat, PixelTarget};
pub use prompt::PromptPair;
pub use sampler::{DenoisingSampler, Latent};
pub use text_encoder::{Conditioning, TextEncoder};

use serde::{Deserialize, Serialize};

const DEFAULT_STEPS: i64 = 15;
const DEFAULT_SEED: u64 = 42;

/// Upper bound on denoising steps, one per training timestep of the default schedule.
pub const MAX_STEPS: usize = 1000;

/// One generation request. Unset steps and seed take their defaults.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: String,
    pub steps: Option<i64>,
    pub seed: Option<u64>,
}

impl GenerationRequest {
    pub fn new(
        prompt: impl Into<String>,
        negative_prompt: impl Into<String>,
        steps: i64,
        seed: u64,
    ) -> Self {
        Self {
            prompt: prompt.into(),
            negative_prompt: negative_prompt.into(),
            steps: Some(steps),
            seed: Some(seed),
        }
    }

    pub fn steps(&self) -> i64 {
        self.steps.unwrap_or(DEFAULT_STEPS)
    }

    pub fn seed(&self) -> u64 {
        self.seed.unwrap_or(DEFAULT_SEED)
    }

    /// Step count as the sampler takes it. Anything outside `1..=MAX_STEPS` is refused,
    /// never clamped.
    pub fn validated_steps(&self) -> PipelineResult<usize> {
        let steps = self.steps();
        if steps < 1 {
            return Err(PipelineError::invalid_request(format!(
                "step count must be positive, got {steps}"
            )));
        }
        match usize::try_from(steps) {
            Ok(steps) if steps <= MAX_STEPS => Ok(steps),
            _ => Err(PipelineError::invalid_request(format!(
                "step count {steps} exceeds the maximum of {MAX_STEPS}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_defaults_apply_when_unset() {
        let request: GenerationRequest =
            serde_json::from_str(r#"{ "prompt": "a red circle" }"#).unwrap();
        assert_eq!(request.negative_prompt, "");
        assert_eq!(request.steps(), 15);
        assert_eq!(request.seed(), 42);
        assert_eq!(request.validated_steps().unwrap(), 15);
    }

    #[test]
    fn non_positive_steps_are_invalid() {
        for steps in [0, -1, i64::MIN] {
            let err = GenerationRequest::new("a", "b", steps, 0)
                .validated_steps()
                .unwrap_err();
            assert!(matches!(err, PipelineError::InvalidRequest(_)));
        }
    }

    #[test]
    fn step_count_is_bounded_above() {
        let at_max = GenerationRequest::new("a", "b", MAX_STEPS as i64, 0);
        assert_eq!(at_max.validated_steps().unwrap(), MAX_STEPS);
        for steps in [MAX_STEPS as i64 + 1, i64::from(i32::MAX), i64::MAX] {
            let err = GenerationRequest::new("a", "b", steps, 0)
                .validated_steps()
                .unwrap_err();
            assert!(matches!(err, PipelineError::InvalidRequest(_)), "{steps}");
        }
    }
}
