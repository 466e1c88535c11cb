use std::sync::Arc;

use crate::assets::AssetSource;
use crate::error::{PipelineError, PipelineResult};
use crate::loader::Loader;
use crate::pixels::{check_target, write_image, PixelTarget};
use crate::{
    DenoisingSampler, GenerationRequest, ImageTensor, LatentDecoder, PipelineConfig, PromptPair,
    ResourceEnvironment, TextEncoder,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
    Unloaded,
    Loading,
    Ready,
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    TextEncoder,
    Sampler,
    Decoder,
}

/// Owns the three stages and sequences them into one generation request.
///
/// `generate` takes `&mut self`: a pipeline serves one request at a time, and hosts that
/// share one must serialize access themselves.
#[derive(Debug)]
pub struct Pipeline {
    state: PipelineState,
    default_prompts: PromptPair,
    text_encoder: Option<TextEncoder>,
    sampler: Option<DenoisingSampler>,
    decoder: Option<LatentDecoder>,
    // Declared last: the stages hold tensors on this environment's device.
    env: Arc<ResourceEnvironment>,
}

impl Pipeline {
    pub fn new(env: Arc<ResourceEnvironment>) -> Self {
        Self {
            state: PipelineState::Unloaded,
            default_prompts: PromptPair::default(),
            text_encoder: None,
            sampler: None,
            decoder: None,
            env,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn environment(&self) -> &Arc<ResourceEnvironment> {
        &self.env
    }

    pub fn is_loaded(&self, stage: Stage) -> bool {
        match stage {
            Stage::TextEncoder => self.text_encoder.is_some(),
            Stage::Sampler => self.sampler.is_some(),
            Stage::Decoder => self.decoder.is_some(),
        }
    }

    /// Loads the text encoder, sampler and decoder in that order.
    ///
    /// Stops at the first stage that fails; later stages stay unloaded and the pipeline
    /// refuses to generate until a later `load` succeeds. Any previously loaded stages are
    /// dropped first.
    #[tracing::instrument(
        skip_all,
        fields(vocabulary = %config.vocabulary_path, model = %config.diffusion_model_path)
    )]
    pub fn load(&mut self, assets: &dyn AssetSource, config: &PipelineConfig) -> PipelineResult<()> {
        self.state = PipelineState::Loading;
        self.unload_stages();

        let result = self.load_stages(assets, config);
        self.state = match &result {
            Ok(()) => {
                tracing::info!("pipeline ready");
                PipelineState::Ready
            }
            Err(err) => {
                tracing::error!(%err, "pipeline load failed");
                PipelineState::Failed
            }
        };
        result
    }

    fn load_stages(&mut self, assets: &dyn AssetSource, config: &PipelineConfig) -> PipelineResult<()> {
        config.validate()?;
        let env = &*self.env;
        self.text_encoder = Some(TextEncoder::load(assets, config, env)?);
        self.sampler = Some(DenoisingSampler::load(assets, config, env)?);
        self.decoder = Some(LatentDecoder::load(assets, config, env)?);
        self.default_prompts = config.default_prompts.clone();
        Ok(())
    }

    fn ready_stages(&self) -> PipelineResult<(&TextEncoder, &DenoisingSampler, &LatentDecoder)> {
        if self.state != PipelineState::Ready {
            return Err(PipelineError::NotReady(self.state));
        }
        match (&self.text_encoder, &self.sampler, &self.decoder) {
            (Some(text_encoder), Some(sampler), Some(decoder)) => {
                Ok((text_encoder, sampler, decoder))
            }
            _ => Err(PipelineError::contract("pipeline is ready with a stage missing")),
        }
    }

    /// Runs encode, sample and decode strictly in sequence.
    #[tracing::instrument(skip_all, fields(seed = request.seed(), steps = request.steps()))]
    pub fn generate(&mut self, request: &GenerationRequest) -> PipelineResult<ImageTensor> {
        let (text_encoder, sampler, decoder) = self.ready_stages()?;
        let steps = request.validated_steps()?;
        let (positive, negative) = PromptPair::resolve(
            &request.prompt,
            &request.negative_prompt,
            &self.default_prompts,
        );
        if request.prompt.is_empty() || request.negative_prompt.is_empty() {
            tracing::debug!("empty prompt, using the default prompt pair");
        }

        let cond = text_encoder.encode(positive)?;
        let uncond = text_encoder.encode(negative)?;
        let latent = sampler.sample(request.seed(), steps, &cond, &uncond)?;
        tracing::debug!("generated latent image");
        let image = decoder.decode(&latent)?;
        tracing::info!("generated image");
        Ok(image)
    }

    /// Generates into a host buffer.
    ///
    /// The target is checked before any stage runs and written only once the whole image
    /// exists; on error it is left as it was.
    pub fn generate_into<T: PixelTarget + ?Sized>(
        &mut self,
        target: &mut T,
        request: &GenerationRequest,
    ) -> PipelineResult<()> {
        self.ready_stages()?;
        check_target(target)?;
        let image = self.generate(request)?;
        write_image(&image, target)
    }

    /// Drops every loaded stage; true if any was loaded.
    fn unload_stages(&mut self) -> bool {
        self.text_encoder.take().is_some()
            | self.sampler.take().is_some()
            | self.decoder.take().is_some()
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if self.unload_stages() {
            tracing::info!("unloaded pipeline stages");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::MemoryAssets;
    use crate::config::IMAGE_SIZE;
    use crate::testing;
    use crate::Resource;
    use image::RgbImage;
    use std::sync::Mutex;
    use tracing_subscriber::layer::{Context, Layer};
    use tracing_subscriber::prelude::*;

    /// Records event messages in emission order.
    #[derive(Clone, Default)]
    struct Messages(Arc<Mutex<Vec<String>>>);

    struct MessageVisitor(String);

    impl tracing::field::Visit for MessageVisitor {
        fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
            if field.name() == "message" {
                self.0 = format!("{value:?}");
            }
        }
    }

    impl<S: tracing::Subscriber> Layer<S> for Messages {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
            let mut visitor = MessageVisitor(String::new());
            event.record(&mut visitor);
            self.0.lock().unwrap().push(visitor.0);
        }
    }

    fn ready_pipeline() -> Pipeline {
        let (config, assets) = testing::tiny_assets();
        let mut pipeline = Pipeline::new(ResourceEnvironment::cpu());
        pipeline.load(&assets, &config).unwrap();
        pipeline
    }

    fn image_bytes(pipeline: &mut Pipeline, request: &GenerationRequest) -> Vec<u8> {
        pipeline.generate(request).unwrap().to_bytes().unwrap()
    }

    #[test]
    fn new_pipeline_is_unloaded_and_refuses_to_generate() {
        let mut pipeline = Pipeline::new(ResourceEnvironment::cpu());
        assert_eq!(pipeline.state(), PipelineState::Unloaded);
        let err = pipeline
            .generate(&GenerationRequest::new("a red circle", "blurry", 15, 42))
            .unwrap_err();
        assert!(matches!(err, PipelineError::NotReady(PipelineState::Unloaded)));
    }

    #[test]
    fn generate_before_load_leaves_target_untouched() {
        let mut pipeline = Pipeline::new(ResourceEnvironment::cpu());
        let size = IMAGE_SIZE as u32;
        let mut target = RgbImage::from_pixel(size, size, image::Rgb([7, 8, 9]));
        let before = target.clone();
        let err = pipeline
            .generate_into(&mut target, &GenerationRequest::new("a", "b", 1, 1))
            .unwrap_err();
        assert!(matches!(err, PipelineError::NotReady(_)));
        assert_eq!(target, before);
    }

    #[test]
    fn load_sequences_stages_to_ready() {
        let pipeline = ready_pipeline();
        assert_eq!(pipeline.state(), PipelineState::Ready);
        for stage in [Stage::TextEncoder, Stage::Sampler, Stage::Decoder] {
            assert!(pipeline.is_loaded(stage), "{stage:?}");
        }
    }

    #[test]
    fn load_stops_at_first_failing_stage() {
        let (config, assets) = testing::tiny_assets();
        let mut broken = assets.clone();
        broken.insert(config.diffusion_model_path.clone(), b"garbage".to_vec());

        let mut pipeline = Pipeline::new(ResourceEnvironment::cpu());
        let err = pipeline.load(&broken, &config).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::ResourceLoad {
                resource: Resource::DiffusionWeights,
                ..
            }
        ));
        assert_eq!(pipeline.state(), PipelineState::Failed);
        assert!(pipeline.is_loaded(Stage::TextEncoder));
        assert!(!pipeline.is_loaded(Stage::Sampler));
        assert!(!pipeline.is_loaded(Stage::Decoder));

        let err = pipeline
            .generate(&GenerationRequest::new("a red circle", "blurry", 1, 1))
            .unwrap_err();
        assert!(matches!(err, PipelineError::NotReady(PipelineState::Failed)));

        pipeline.load(&assets, &config).unwrap();
        assert_eq!(pipeline.state(), PipelineState::Ready);
    }

    #[test]
    fn missing_vocabulary_loads_nothing() {
        let (config, _) = testing::tiny_assets();
        let mut pipeline = Pipeline::new(ResourceEnvironment::cpu());
        let err = pipeline.load(&MemoryAssets::new(), &config).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::ResourceLoad {
                resource: Resource::Vocabulary,
                ..
            }
        ));
        assert!(!pipeline.is_loaded(Stage::TextEncoder));
        assert_eq!(pipeline.state(), PipelineState::Failed);
    }

    #[test]
    fn inconsistent_config_fails_before_reading_assets() {
        let (mut config, assets) = testing::tiny_assets();
        config.denoiser.context_dim += 1;
        let mut pipeline = Pipeline::new(ResourceEnvironment::cpu());
        let err = pipeline.load(&assets, &config).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidConfig(_)));
        assert_eq!(pipeline.state(), PipelineState::Failed);
    }

    #[test]
    fn environment_is_released_after_failed_load() {
        let env = ResourceEnvironment::cpu();
        {
            let mut pipeline = Pipeline::new(Arc::clone(&env));
            assert_eq!(Arc::strong_count(&env), 2);
            let (config, _) = testing::tiny_assets();
            assert!(pipeline.load(&MemoryAssets::new(), &config).is_err());
        }
        assert_eq!(Arc::strong_count(&env), 1);
    }

    #[test]
    fn equivalently_loaded_pipelines_are_bit_identical() {
        let (config, assets) = testing::tiny_assets();
        let load = || {
            let mut pipeline = Pipeline::new(ResourceEnvironment::cpu());
            pipeline.load(&assets, &config).unwrap();
            pipeline
        };
        let request = GenerationRequest::new("a red circle", "blurry", 3, 42);
        let a = image_bytes(&mut load(), &request);
        let mut second = load();
        let b = image_bytes(&mut second, &request);
        let c = image_bytes(&mut second, &request);
        assert_eq!(a, b);
        assert_eq!(b, c);
    }

    #[test]
    fn one_empty_prompt_falls_back_to_the_whole_default_pair() {
        let mut pipeline = ready_pipeline();
        let half = image_bytes(&mut pipeline, &GenerationRequest::new("", "blurry", 2, 5));
        let both = image_bytes(&mut pipeline, &GenerationRequest::new("", "", 2, 5));
        let explicit = image_bytes(&mut pipeline, &GenerationRequest::new("a red circle", "blurry", 2, 5));
        assert_eq!(half, both);
        assert_ne!(half, explicit);
    }

    #[test]
    fn injected_default_prompts_are_used_for_fallback() {
        let (mut config, assets) = testing::tiny_assets();
        config.default_prompts = PromptPair::new("a blue square", "lowres");
        let mut pipeline = Pipeline::new(ResourceEnvironment::cpu());
        pipeline.load(&assets, &config).unwrap();
        let fallback = image_bytes(&mut pipeline, &GenerationRequest::new("a red circle", "", 2, 9));
        let explicit = image_bytes(&mut pipeline, &GenerationRequest::new("a blue square", "lowres", 2, 9));
        assert_eq!(fallback, explicit);
    }

    #[test]
    fn image_shape_is_fixed_for_any_prompt_or_step_count() {
        let mut pipeline = ready_pipeline();
        let long = "a red circle , ".repeat(50);
        for (prompt, steps) in [("a", 1), (long.as_str(), 2)] {
            let image = pipeline
                .generate(&GenerationRequest::new(prompt, "blurry", steps, 3))
                .unwrap();
            assert_eq!(image.dims(), ImageTensor::expected_dims());
        }
    }

    #[test]
    fn one_and_fifty_steps_are_both_valid_and_differ() {
        let mut pipeline = ready_pipeline();
        let one = image_bytes(&mut pipeline, &GenerationRequest::new("a red circle", "blurry", 1, 42));
        let fifty = image_bytes(&mut pipeline, &GenerationRequest::new("a red circle", "blurry", 50, 42));
        assert_eq!(one.len(), IMAGE_SIZE * IMAGE_SIZE * 3);
        assert_eq!(fifty.len(), one.len());
        assert_ne!(one, fifty);
    }

    #[test]
    fn non_positive_steps_are_rejected_before_any_stage_runs() {
        let mut pipeline = ready_pipeline();
        for steps in [0, -3] {
            let err = pipeline
                .generate(&GenerationRequest::new("a red circle", "blurry", steps, 42))
                .unwrap_err();
            assert!(matches!(err, PipelineError::InvalidRequest(_)), "{steps}");
        }
        assert_eq!(pipeline.state(), PipelineState::Ready);
    }

    #[test]
    fn oversized_step_counts_are_rejected_and_target_untouched() {
        let mut pipeline = ready_pipeline();
        let size = IMAGE_SIZE as u32;
        let mut target = RgbImage::from_pixel(size, size, image::Rgb([1, 2, 3]));
        let before = target.clone();
        for steps in [crate::MAX_STEPS as i64 + 1, i64::MAX] {
            let err = pipeline
                .generate_into(&mut target, &GenerationRequest::new("a red circle", "blurry", steps, 42))
                .unwrap_err();
            assert!(matches!(err, PipelineError::InvalidRequest(_)), "{steps}");
        }
        assert_eq!(target, before);
        assert_eq!(pipeline.state(), PipelineState::Ready);
    }

    #[test]
    fn stages_are_torn_down_before_the_environment_is_released() {
        let messages = Messages::default();
        let subscriber = tracing_subscriber::registry().with(messages.clone());
        tracing::subscriber::with_default(subscriber, || {
            let (config, assets) = testing::tiny_assets();
            let mut pipeline = Pipeline::new(ResourceEnvironment::cpu());
            pipeline.load(&assets, &config).unwrap();
            drop(pipeline);
        });

        let messages = messages.0.lock().unwrap();
        let position = |needle: &str| {
            messages
                .iter()
                .position(|m| m == needle)
                .unwrap_or_else(|| panic!("no {needle:?} in {messages:?}"))
        };
        assert!(position("unloaded pipeline stages") < position("released resource environment"));
    }

    #[test]
    fn unsupported_target_is_rejected_and_untouched() {
        let mut pipeline = ready_pipeline();
        let mut target = RgbImage::new(64, 64);
        let err = pipeline
            .generate_into(&mut target, &GenerationRequest::new("a", "b", 1, 1))
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidRequest(_)));
        assert!(target.as_raw().iter().all(|&b| b == 0));
    }

    #[test]
    fn rgba_targets_get_opaque_alpha() {
        let mut pipeline = ready_pipeline();
        let size = IMAGE_SIZE as u32;
        let request = GenerationRequest::new("a red circle", "blurry", 2, 11);
        let mut rgba = image::RgbaImage::new(size, size);
        pipeline.generate_into(&mut rgba, &request).unwrap();
        let rgb = pipeline.generate(&request).unwrap().to_bytes().unwrap();
        for (px, expected) in rgba.as_raw().chunks_exact(4).zip(rgb.chunks_exact(3)) {
            assert_eq!(&px[..3], expected);
            assert_eq!(px[3], 255);
        }
    }
}
