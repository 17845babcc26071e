use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tracing_subscriber::EnvFilter;

use vppe::cleanup;
use vppe::config::AppConfig;
use vppe::event_bus::EventBusRegistry;
use vppe::pipeline::assembler::EpubAssembler;
use vppe::pipeline::ocr::OllamaOcrClient;
use vppe::pipeline::render::PdfiumRenderer;
use vppe::pipeline::PipelineDeps;
use vppe::registry::JobRegistry;
use vppe::routes;
use vppe::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let config = Arc::new(AppConfig::from_env()?);
    tracing::info!(
        host = %config.host,
        port = config.port,
        data_dir = %config.data_dir,
        ocr_workers = config.ocr_workers,
        "loaded vppe configuration"
    );

    let registry = Arc::new(JobRegistry::new(config.data_dir.clone()));
    registry.recover().await?;

    let buses = Arc::new(EventBusRegistry::new(config.sse_ring_buffer_size));

    let renderer = Arc::new(PdfiumRenderer::new());
    let ocr_client = Arc::new(OllamaOcrClient::new(
        config.ollama_base_url.clone(),
        config.ollama_model.clone(),
        Duration::from_secs(config.ocr_timeout_secs),
        config.ocr_retries,
    ));
    let assembler = Arc::new(EpubAssembler);

    let deps = Arc::new(PipelineDeps {
        config: config.clone(),
        registry: registry.clone(),
        buses: buses.clone(),
        renderer,
        ocr_client,
        assembler,
    });

    tokio::spawn(cleanup::run(registry, buses, config.clone()));

    let app = routes::create_router(AppState::new(deps));

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "vppe listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

/// Running jobs are abandoned on shutdown, not awaited — recovery on the
/// next startup is the registry's job (spec §5 Cancellation).
async fn shutdown_signal() {
    match signal::ctrl_c().await {
        Ok(()) => tracing::info!("received shutdown signal"),
        Err(err) => tracing::warn!(error = %err, "failed to install ctrl-c handler"),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
