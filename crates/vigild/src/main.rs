use anyhow::Result;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing_subscriber::EnvFilter;
use vigil_core::{FrameSource, OwnerId};
use vigil_hw::{CameraSource, DirectorySource};

mod batcher;
mod buffer;
mod clock;
mod config;
mod dbus_interface;
mod engine;
mod notice;
mod replay;
mod store;
#[cfg(test)]
mod testing;

use config::{Config, SourceConfig};
use dbus_interface::{MonitorService, BUS_NAME, OBJECT_PATH};
use engine::{Adapters, DetectionLoop};
use replay::ReplayModels;
use store::SqliteStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "vigild starting");

    let config = Config::load()?;
    let owner = OwnerId::new(config.owner_id.clone());

    let store = Arc::new(SqliteStore::open(&config.db_path).await?);

    tracing::info!(script = %config.replay_script.display(), "using replay inference");
    let models = Arc::new(ReplayModels::new(config.replay_script.clone()));
    let adapters = Adapters {
        faces: models.clone(),
        objects: models.clone(),
        patterns: models,
    };

    let frames: Arc<dyn FrameSource> = match &config.source {
        SourceConfig::Camera { device } => {
            tracing::info!(device = %device, "using camera source");
            Arc::new(CameraSource::new(device.clone()))
        }
        SourceConfig::Directory { path, fps } => {
            tracing::info!(path = %path.display(), fps, "using image directory source");
            Arc::new(DirectorySource::new(path.clone(), *fps))
        }
    };

    let monitor = DetectionLoop::new(
        owner.clone(),
        config.pipeline.clone(),
        adapters,
        frames,
        store.clone(),
    );
    let predictions = monitor.subscribe_predictions();
    let mut notices = monitor.subscribe_notices();
    let monitor = Arc::new(Mutex::new(monitor));

    let service = MonitorService::new(Arc::clone(&monitor), predictions, store, owner);
    let conn = zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await?;
    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "D-Bus interface registered");

    let iface = conn
        .object_server()
        .interface::<_, MonitorService>(OBJECT_PATH)
        .await?;
    tokio::spawn(async move {
        loop {
            match notices.recv().await {
                Ok(notice) => {
                    let payload = notice.to_json();
                    if let Err(e) = MonitorService::notice(iface.signal_emitter(), &payload).await {
                        tracing::warn!(error = %e, "failed to emit notice signal");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "notice forwarder lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    if config.autostart {
        match monitor.lock().await.start().await {
            Ok(session) => tracing::info!(session = %session, "autostart complete"),
            Err(e) => tracing::warn!(error = %e, "autostart failed; waiting for Start()"),
        }
    }

    tracing::info!("vigild ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("vigild shutting down");
    monitor.lock().await.stop().await;

    Ok(())
}
