//! Boolean entry points for hosts that only understand success or failure.
//!
//! Every failure is logged here and collapsed to `false`; nothing structured crosses this
//! boundary.

use crate::assets::AssetSource;
use crate::pixels::PixelTarget;
use crate::{GenerationRequest, Pipeline, PipelineConfig};

/// Host text (UTF-16 code units) to a Rust string. A missing string becomes empty, and
/// unpaired surrogates are replaced.
pub fn text_from_utf16(units: Option<&[u16]>) -> String {
    units.map(String::from_utf16_lossy).unwrap_or_default()
}

/// Loads `pipeline` from `assets`, taking the vocabulary and diffusion model from the two
/// named paths and everything else from `base`.
pub fn load(
    pipeline: &mut Pipeline,
    assets: &dyn AssetSource,
    vocabulary_path: &str,
    diffusion_model_path: &str,
    base: &PipelineConfig,
) -> bool {
    let config = base.clone().with_paths(vocabulary_path, diffusion_model_path);
    match pipeline.load(assets, &config) {
        Ok(()) => true,
        Err(err) => {
            tracing::error!(%err, "load failed");
            false
        }
    }
}

/// Fills `target` with a generated image. A negative `seed` is used as its unsigned
/// bit pattern.
pub fn generate<T: PixelTarget + ?Sized>(
    pipeline: &mut Pipeline,
    target: &mut T,
    steps: i32,
    seed: i32,
    positive_prompt: &str,
    negative_prompt: &str,
) -> bool {
    let request = GenerationRequest::new(
        positive_prompt,
        negative_prompt,
        i64::from(steps),
        u64::from(seed as u32),
    );
    match pipeline.generate_into(target, &request) {
        Ok(()) => true,
        Err(err) => {
            tracing::error!(%err, "generate failed");
            false
        }
    }
}
