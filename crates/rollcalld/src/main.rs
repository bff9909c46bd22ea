use std::sync::Arc;

use anyhow::{Context, Result};
use rollcall_core::FacePipeline;
use rollcall_gallery::{DirectoryStore, Gallery, GalleryStore};
use tracing_subscriber::EnvFilter;

mod attendance;
mod config;
mod engine;
mod server;

use attendance::AttendanceRecorder;
use config::Config;
use server::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "rollcalld starting");

    let config = Config::from_env().context("invalid configuration")?;
    let recognition = config.recognition.clone();
    tracing::info!(
        model_dir = %recognition.model_dir.display(),
        gallery_dir = %recognition.gallery_dir.display(),
        metric = recognition.metric.as_str(),
        threshold = recognition.threshold,
        margin = recognition.margin,
        "configuration loaded"
    );

    // Model loading and the initial gallery scan are blocking work.
    let (pipeline, gallery) = tokio::task::spawn_blocking(move || -> Result<_> {
        let mut pipeline =
            FacePipeline::from_config(&recognition).context("failed to load face models")?;
        let store: Box<dyn GalleryStore> = Box::new(
            DirectoryStore::open(&recognition.gallery_dir).context("failed to open gallery")?,
        );
        let (gallery, _) = Gallery::load(store, recognition.matcher(), &mut pipeline)
            .context("failed to load gallery")?;
        Ok((pipeline, gallery))
    })
    .await??;

    let engine = engine::spawn_engine(pipeline, Arc::new(gallery), config.match_timeout)?;
    let attendance = AttendanceRecorder::open(&config.db_path).context("failed to open attendance database")?;

    let state = Arc::new(AppState {
        engine,
        attendance: Arc::new(attendance),
        policy: config.recognition.matcher(),
    });
    let app = server::create_app(state, config.max_body_bytes);

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    tracing::info!(addr = %config.bind, "rollcalld ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("rollcalld shutting down");
        })
        .await?;

    Ok(())
}
