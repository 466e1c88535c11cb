use anyhow::{bail, Context, Result};
use candle_nn::VarBuilder;
use safetensors::SafeTensors;

use crate::assets::AssetSource;
use crate::error::{PipelineError, PipelineResult};
use crate::{PipelineConfig, Resource, ResourceEnvironment};

/// A pipeline stage that can be built from assets.
///
/// Loading is all-or-nothing: a stage value only exists once every resource it owns has
/// been read and validated.
pub trait Loader: Sized {
    fn load(
        assets: &dyn AssetSource,
        config: &PipelineConfig,
        env: &ResourceEnvironment,
    ) -> PipelineResult<Self>;
}

pub(crate) fn read_resource(
    assets: &dyn AssetSource,
    path: &str,
    resource: Resource,
) -> PipelineResult<Vec<u8>> {
    tracing::debug!(%resource, path, "reading resource");
    assets
        .read(path)
        .map_err(|e| PipelineError::resource_load(resource, e))
}

/// Validates a safetensors payload and exposes it as a var builder on the environment.
pub(crate) fn weights_var_builder(
    bytes: Vec<u8>,
    env: &ResourceEnvironment,
) -> Result<VarBuilder<'static>> {
    let (tensors, parameters) = {
        let st = SafeTensors::deserialize(&bytes).context("malformed safetensors payload")?;
        let parameters: usize = st
            .tensors()
            .iter()
            .map(|(_, view)| view.shape().iter().product::<usize>())
            .sum();
        (st.names().len(), parameters)
    };
    if tensors == 0 {
        bail!("weights file contains no tensors");
    }
    tracing::debug!(tensors, parameters, "inspected weights");
    VarBuilder::from_buffered_safetensors(bytes, env.dtype(), env.device())
        .context("failed to build var builder")
}
