use crate::engine::{DetectionLoop, EngineError, Predictions};
use crate::store::SqliteStore;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use vigil_core::{Embedding, OwnerId};
use zbus::interface;
use zbus::object_server::SignalEmitter;

pub const BUS_NAME: &str = "org.vigil.Monitor1";
pub const OBJECT_PATH: &str = "/org/vigil/Monitor1";

/// D-Bus interface for the Vigil monitor daemon.
///
/// Bus name: org.vigil.Monitor1
/// Object path: /org/vigil/Monitor1
pub struct MonitorService {
    monitor: Arc<Mutex<DetectionLoop>>,
    store: Arc<SqliteStore>,
    owner: OwnerId,
    predictions: watch::Receiver<Predictions>,
}

impl MonitorService {
    pub fn new(
        monitor: Arc<Mutex<DetectionLoop>>,
        predictions: watch::Receiver<Predictions>,
        store: Arc<SqliteStore>,
        owner: OwnerId,
    ) -> Self {
        Self {
            monitor,
            store,
            owner,
            predictions,
        }
    }
}

fn failed(e: impl std::fmt::Display) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(e.to_string())
}

#[interface(name = "org.vigil.Monitor1")]
impl MonitorService {
    /// Start a monitoring session. Returns the session id.
    async fn start(&self) -> zbus::fdo::Result<String> {
        tracing::info!("start requested");
        let mut monitor = self.monitor.lock().await;
        match monitor.start().await {
            Ok(id) => Ok(id.to_string()),
            Err(e @ EngineError::AlreadyRunning(_)) => {
                Err(zbus::fdo::Error::AccessDenied(e.to_string()))
            }
            Err(e) => {
                tracing::error!(error = %e, "start failed");
                Err(failed(e))
            }
        }
    }

    /// Stop the running session. No-op when idle.
    async fn stop(&self) -> zbus::fdo::Result<()> {
        tracing::info!("stop requested");
        self.monitor.lock().await.stop().await;
        Ok(())
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let status = self.monitor.lock().await.status();
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "owner": self.owner.as_str(),
            "monitor": status,
        })
        .to_string())
    }

    /// Latest face and object detections as JSON.
    async fn predictions(&self) -> zbus::fdo::Result<String> {
        let predictions = self.predictions.borrow().clone();
        serde_json::to_string(&predictions).map_err(failed)
    }

    /// Most recent stored events for the owner, newest first.
    async fn list_events(&self, limit: u32) -> zbus::fdo::Result<String> {
        let events = self
            .store
            .list_events(&self.owner, limit)
            .await
            .map_err(failed)?;
        serde_json::to_string(&events).map_err(failed)
    }

    /// Enroll a known person from a JSON embedding array. Takes effect on the
    /// next session.
    async fn enroll_member(
        &self,
        first_name: &str,
        last_name: &str,
        embedding_json: &str,
    ) -> zbus::fdo::Result<i64> {
        let embedding: Embedding = serde_json::from_str(embedding_json)
            .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("embedding: {e}")))?;
        if embedding.dim() == 0 {
            return Err(zbus::fdo::Error::InvalidArgs("embedding is empty".into()));
        }

        let non_empty = |s: &str| {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        };
        let first = non_empty(first_name);
        let last = non_empty(last_name);

        let id = self
            .store
            .add_member(&self.owner, first.as_deref(), last.as_deref(), &embedding)
            .await
            .map_err(failed)?;
        Ok(id.0)
    }

    /// Emitted for gallery load failures, dropped batches and session stops.
    #[zbus(signal)]
    pub async fn notice(emitter: &SignalEmitter<'_>, payload: &str) -> zbus::Result<()>;
}
