use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::{info, warn};

use narration_core::{
    BgmRepository, ManifestBgmLibrary, Pipeline, PipelineConfig, SilentSynthesizer, SpeechSynthesizer,
};
use server::config::{ServerConfig, SynthBackend};
use server::{build_app, metrics, AppState};
use synth_client::{HttpSynthesizer, SynthClientConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let _ = dotenv::dotenv();

    async_main().await
}

async fn async_main() -> anyhow::Result<()> {
    info!("Starting narration server...");
    metrics::init_start_time();

    let config = ServerConfig::from_env();

    let synthesizer: Arc<dyn SpeechSynthesizer> = match config.synth_backend {
        SynthBackend::Http => {
            let client_config = SynthClientConfig::from_env().context("synthesis client configuration")?;
            info!("Using HTTP synthesis backend at {}", client_config.endpoint);
            Arc::new(HttpSynthesizer::new(client_config)?)
        }
        SynthBackend::Silent => {
            warn!("SYNTH_BACKEND not set to http, narrating with the silent placeholder backend");
            Arc::new(SilentSynthesizer::default())
        }
    };

    let bgm: Arc<dyn BgmRepository> = match ManifestBgmLibrary::from_manifest(&config.bgm_manifest) {
        Ok(library) => Arc::new(library),
        Err(e) => {
            warn!(
                "Could not load {}: {e:#}, running voice-only.",
                config.bgm_manifest.display()
            );
            Arc::new(ManifestBgmLibrary::empty())
        }
    };
    info!("Loaded {} background-music assets", bgm.assets().len());

    let mut pipeline_config = match &config.pipeline_config {
        Some(path) => PipelineConfig::from_file(path)?,
        None => PipelineConfig::default(),
    };
    pipeline_config.output_dir = Some(config.output_dir.clone());
    let pipeline = Pipeline::new(synthesizer, bgm, pipeline_config)?;

    info!(
        "Server configuration loaded: port={}, rate_limit={}/min, concurrency={}",
        config.port,
        config.rate_limit_per_minute,
        pipeline.config().concurrency
    );

    let state = AppState::new(pipeline, config.clone());
    let app = build_app(state)?;

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind {addr}: {e}. Try a different PORT."))?;

    info!("Server listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}
