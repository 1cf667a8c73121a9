use crate::config::{generate_token, Config};
use crate::inference::{codec::ImageCodec, ort_engine::OrtEngine, Mode};
use crate::pipeline::InferencePipeline;
use crate::server::{HttpServer, SharedState};
use crate::session::SessionAuth;
use crate::telemetry::Metrics;

use std::sync::Arc;
use tokio::{signal, sync::broadcast};

pub async fn start_app(config: Config) -> anyhow::Result<()> {
    let token = match config.auth.configured_token() {
        Some(token) => token.to_string(),
        None => {
            let token = generate_token();
            tracing::info!(token = %token, "No auth token configured, generated one");
            token
        }
    };

    for mode in Mode::ALL {
        if let Err(e) = config.models.model(mode).validate(&config.models.model_dir) {
            tracing::warn!(%mode, "{}; frames in this mode will fail", e);
        }
    }

    let metrics = Arc::new(Metrics::new()?);
    let engine = Arc::new(OrtEngine::new(config.models.clone()));
    let pipeline = InferencePipeline::new(engine, Arc::new(ImageCodec), &config.pipeline);

    let state = SharedState {
        pipeline,
        auth: SessionAuth::new(token, config.auth.get_timeout()),
        metrics,
    };

    let server = HttpServer::new(state, &config.server).await?;

    let (shutdown_tx, _) = broadcast::channel(1);
    let server_handle = server.run(shutdown_tx.subscribe()).await?;

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, starting graceful shutdown.");

    let _ = shutdown_tx.send(());
    server_handle.await??;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
