use serde::{Deserialize, Serialize};

use crate::PipelineState;

pub type PipelineResult<T> = Result<T, PipelineError>;

/// The loaded resources a pipeline depends on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Resource {
    Vocabulary,
    TextEncoderWeights,
    DiffusionWeights,
    DecoderWeights,
}

serde_plain::derive_display_from_serialize!(Resource);
serde_plain::derive_fromstr_from_deserialize!(Resource);

#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error("failed to load {resource}: {reason}")]
    ResourceLoad { resource: Resource, reason: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("stage contract violated: {0}")]
    ContractViolation(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("pipeline is not ready (state: {0:?})")]
    NotReady(PipelineState),

    #[error("non-finite values in {stage} output at step {step}")]
    NonFinite { stage: &'static str, step: usize },

    #[error(transparent)]
    Tensor(#[from] candle_core::Error),
}

impl PipelineError {
    /// Wraps a loader failure, keeping the whole context chain in the message.
    pub fn resource_load(resource: Resource, err: anyhow::Error) -> Self {
        Self::ResourceLoad {
            resource,
            reason: format!("{err:#}"),
        }
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    pub fn contract(msg: impl Into<String>) -> Self {
        Self::ContractViolation(msg.into())
    }

    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_names_round_trip_through_plain_strings() {
        assert_eq!(Resource::DiffusionWeights.to_string(), "diffusion-weights");
        assert_eq!(
            "vocabulary".parse::<Resource>().unwrap(),
            Resource::Vocabulary
        );
        assert!("weights".parse::<Resource>().is_err());
    }

    #[test]
    fn resource_load_keeps_context_chain() {
        let err = anyhow::anyhow!("unexpected end of file").context("failed to parse vocabulary");
        let err = PipelineError::resource_load(Resource::Vocabulary, err);
        let msg = err.to_string();
        assert!(msg.starts_with("failed to load vocabulary:"));
        assert!(msg.contains("failed to parse vocabulary"));
        assert!(msg.contains("unexpected end of file"));
    }

    #[test]
    fn not_ready_reports_state() {
        let msg = PipelineError::NotReady(PipelineState::Failed).to_string();
        assert!(msg.contains("Failed"));
    }
}
