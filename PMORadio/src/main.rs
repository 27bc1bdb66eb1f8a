mod api;
mod logging;
mod ws;

use anyhow::Context;
use pmoconfig::Config;
use pmoradio::{
    AceStepRenderer, CommandSurface, EngineSettings, ErrorLog, OllamaParams, PlaybackSurface,
    RadioConfigExt, RadioEngine, SilentSurface, StationManager,
};
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ========== PHASE 1 : Configuration ==========
    let config = Config::load_config("").context("cannot load configuration")?;
    logging::init_logging(&config);
    info!("📁 Configuration loaded from {}", config.directory());

    // ========== PHASE 2 : Backends et moteur ==========
    let params = Arc::new(OllamaParams::new(
        &config.get_ollama_host(),
        &config.get_ollama_model(),
        config.get_ollama_timeout(),
    )?);
    let renderer = Arc::new(AceStepRenderer::new(
        &config.get_acestep_host(),
        &config.get_acestep_model(),
        config.get_track_duration_s(),
        config.get_acestep_timeout(),
    )?);
    info!(
        ollama = %config.get_ollama_host(),
        model = %params.model(),
        acestep = %config.get_acestep_host(),
        "🎛️ Backends configured"
    );

    let surface: Arc<dyn PlaybackSurface> = match config
        .get_player_command()
        .and_then(|template| CommandSurface::new(&template))
    {
        Some(surface) => {
            info!("🔈 Playing through an external player");
            Arc::new(surface)
        }
        None => {
            info!("🌐 Playback driven by the browser");
            Arc::new(SilentSurface)
        }
    };

    let settings = EngineSettings::from_config(&config);
    let min_free_mb = settings.min_free_mb;
    let stations = StationManager::new(config.get_radios_dir()?)?;
    let (engine, radio) = RadioEngine::new(
        settings,
        stations.clone(),
        params.clone(),
        renderer.clone(),
        surface,
        ErrorLog::new(&config.get_output_dir()?),
    )?;
    let engine_task = engine.spawn();

    // ========== PHASE 3 : Serveur HTTP ==========
    let app = api::router(api::AppState {
        radio: radio.clone(),
        stations,
        params,
        renderer,
        min_free_mb,
    });

    let port = config.get_http_port();
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("cannot listen on port {port}"))?;

    info!("========================================");
    info!("📻 PMORadio is ready!");
    info!("  Local:   http://localhost:{port}");
    info!("  Network: {}", config.get_base_url());
    info!("Press Ctrl+C to stop...");
    info!("========================================");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!("Cannot listen for Ctrl+C: {err}");
            }
            info!("🛑 Shutting down...");
        })
        .await?;

    if radio.shutdown().await.is_ok() {
        let _ = engine_task.await;
    }
    info!("👋 Bye");
    Ok(())
}
