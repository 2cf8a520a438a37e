#![forbid(unsafe_code)]

use anyhow::Result;
use confsig::config::ServerConfig;
use confsig::media::MediasoupEngine;
use confsig::metrics::ServerMetrics;
use confsig::recording::Recorder;
use confsig::room::{run_peer_reaper, RoomRegistry};
use confsig::signaling::SignalingServer;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const MIN_REAPER_INTERVAL: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "confsig=debug,mediasoup=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("confsig - Starting server");

    let config = ServerConfig::from_env()?;
    info!(
        "Announcing {:?} for media, RTC ports {}-{}",
        config.media.webrtc_transport_config.announced_address,
        config.media.worker_config.rtc_min_port,
        config.media.worker_config.rtc_max_port,
    );

    let receiver_capabilities = config.media.router_config.receiver_capabilities();
    let engine = Arc::new(MediasoupEngine::new(config.media.clone()).await?);
    let worker_died = engine.worker_died();

    let metrics = ServerMetrics::new();
    let registry = Arc::new(RoomRegistry::new(engine.clone(), config.room.clone(), metrics.clone()));
    let recorder = Recorder::new(
        engine,
        config.recording.clone(),
        receiver_capabilities,
        metrics.clone(),
    );

    info!("Room registry and media engine initialized");

    let reaper_cancel = CancellationToken::new();
    let reaper = match config.peer_timeout {
        Some(peer_timeout) => {
            let check_interval = (peer_timeout / 3).max(MIN_REAPER_INTERVAL);
            Some(tokio::spawn(run_peer_reaper(
                registry.clone(),
                peer_timeout,
                check_interval,
                reaper_cancel.clone(),
            )))
        }
        None => {
            info!("Peer eviction disabled (PEER_TIMEOUT_SECS=0)");
            None
        }
    };

    let signaling_server = SignalingServer::new(
        registry.clone(),
        recorder.clone(),
        metrics,
        config.max_connections,
        config.idle_timeout,
    );

    // Run server with graceful shutdown
    tokio::select! {
        result = signaling_server.serve(config.port) => {
            if let Err(e) = result {
                error!("Signaling server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        _ = worker_died.cancelled() => {
            error!("Media worker died, shutting down");
        }
    }

    reaper_cancel.cancel();
    if let Some(reaper) = reaper {
        let _ = reaper.await;
    }
    recorder.stop_all().await;
    registry.shutdown().await;

    info!("Server shutdown complete");
    Ok(())
}
