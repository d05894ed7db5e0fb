use serde::Serialize;
use uuid::Uuid;

/// Out-of-band conditions surfaced to whoever is watching the monitor.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notice {
    /// Gallery could not be loaded; every face is reported unknown this session.
    GalleryLoadFailed { reason: String },
    /// A batch was rejected by the sink and discarded.
    FlushFailed { dropped: usize, reason: String },
    Stopped { session: Uuid },
}

impl Notice {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}
