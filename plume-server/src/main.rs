use anyhow::{Context, Result};
use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Router,
};
use base64::{prelude::BASE64_STANDARD, Engine};
use clap::Parser;
use image::{DynamicImage, RgbImage};
use plume_core::{
    AssetLocation, DeviceMap, GenerationRequest, Pipeline, PipelineConfig, PipelineError,
    ResourceEnvironment,
};
use serde::Serialize;
use std::{
    io::Cursor,
    sync::{Arc, Mutex, MutexGuard},
};
use tokio::{self, net::TcpListener};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Plume image generation server")]
struct Args {
    /// Use CPU instead of GPU
    #[arg(long)]
    cpu: bool,

    /// Asset directory, or `hf://owner/name[@revision]`
    #[arg(long)]
    assets: String,

    /// Vocabulary path inside the assets
    #[arg(long)]
    vocab: Option<String>,

    /// Diffusion model path inside the assets
    #[arg(long)]
    model: Option<String>,

    /// Pipeline config (JSON) inside the assets; built-in defaults otherwise
    #[arg(long)]
    config: Option<String>,

    /// Host address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to bind the server to
    #[arg(long, default_value_t = 8000)]
    port: u16,
}

fn image_to_base64_png(image: RgbImage) -> Result<String> {
    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(image)
        .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
        .context("failed to encode png")?;
    Ok(BASE64_STANDARD.encode(&bytes))
}

#[derive(Serialize)]
struct GenerationResponse {
    image: String,
}

#[derive(Clone)]
struct AppState(Arc<Mutex<Pipeline>>);

struct ApiError(StatusCode, String);

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        let status = match err {
            PipelineError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            PipelineError::NotReady(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self(status, err.to_string())
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}"))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        tracing::error!(status = %self.0, error = %self.1, "generation failed");
        (self.0, self.1).into_response()
    }
}

async fn generate_image_handler(
    State(state): State<AppState>,
    Json(req): Json<GenerationRequest>,
) -> Result<Json<GenerationResponse>, ApiError> {
    let image = tokio::task::spawn_blocking(move || generate_image(&state, &req))
        .await
        .context("generation task panicked")??;
    Ok(Json(GenerationResponse { image }))
}

/// A request that panicked mid-generation leaves no partial state behind, so the lock is
/// taken over rather than failing every later request.
fn lock_pipeline(state: &AppState) -> MutexGuard<'_, Pipeline> {
    state.0.lock().unwrap_or_else(|poisoned| {
        tracing::warn!("recovering pipeline lock after a panicked request");
        poisoned.into_inner()
    })
}

/// Runs one request against the shared pipeline; requests queue on the lock.
fn generate_image(state: &AppState, req: &GenerationRequest) -> Result<String, ApiError> {
    let image = lock_pipeline(state).generate(req)?;
    Ok(image_to_base64_png(image.to_rgb_image()?)?)
}

fn load_pipeline(args: &Args) -> Result<Pipeline> {
    let assets = AssetLocation::parse(&args.assets)?.open()?;
    let mut config = match &args.config {
        Some(path) => PipelineConfig::from_assets(assets.as_ref(), path)?,
        None => PipelineConfig::default(),
    };
    if let Some(vocab) = &args.vocab {
        config.vocabulary_path = vocab.clone();
    }
    if let Some(model) = &args.model {
        config.diffusion_model_path = model.clone();
    }

    let env = ResourceEnvironment::acquire(DeviceMap::from_cpu_flag(args.cpu))?;
    let mut pipeline = Pipeline::new(env);
    pipeline.load(assets.as_ref(), &config)?;
    Ok(pipeline)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let (pipeline, args) =
        tokio::task::spawn_blocking(move || load_pipeline(&args).map(|p| (p, args)))
            .await
            .context("load task panicked")??;
    let state = AppState(Arc::new(Mutex::new(pipeline)));

    let app = Router::new()
        .route("/v1/images/generations", post(generate_image_handler))
        .with_state(state);

    let bind_address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("failed to bind {bind_address}"))?;
    tracing::info!(address = %listener.local_addr()?, "started server");
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}
