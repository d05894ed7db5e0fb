//! Recorded-inference backend.
//!
//! Plays back per-frame model outputs from a JSON script, indexed by frame
//! sequence number modulo the script length. Lets the daemon run end to end
//! on machines without the real models:
//!
//! ```json
//! {
//!   "faces":   [[{"bbox": {"x": 0, "y": 0, "width": 80, "height": 80}, "score": 0.9, "embedding": [0.1, 0.2]}]],
//!   "objects": [[{"bbox": {"x": 5, "y": 5, "width": 40, "height": 60}, "class": "backpack", "score": 0.7}]],
//!   "fire":    [[]],
//!   "gun":     [[{"x": 300, "y": 120, "width": 50, "height": 30}]]
//! }
//! ```

use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};
use vigil_core::{
    AdapterError, BoundingBox, CascadeParams, DetectedFace, FaceDetector, Frame, GrayFrame,
    ObjectDetector, PatternClassifier, PatternKind, RawDetection,
};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ReplayScript {
    pub faces: Vec<Vec<DetectedFace>>,
    pub objects: Vec<Vec<RawDetection>>,
    pub fire: Vec<Vec<BoundingBox>>,
    pub gun: Vec<Vec<BoundingBox>>,
}

fn pick<T: Clone>(track: &[Vec<T>], sequence: u32) -> Vec<T> {
    if track.is_empty() {
        return Vec::new();
    }
    track[sequence as usize % track.len()].clone()
}

impl ReplayScript {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    fn pattern_track(&self, kind: PatternKind) -> &[Vec<BoundingBox>] {
        match kind {
            PatternKind::Fire => &self.fire,
            PatternKind::Gun => &self.gun,
        }
    }
}

/// Serves all three model contracts from one script file.
pub struct ReplayModels {
    path: PathBuf,
    script: RwLock<Option<Arc<ReplayScript>>>,
}

impl ReplayModels {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            script: RwLock::new(None),
        }
    }

    pub fn from_script(script: ReplayScript) -> Self {
        Self {
            path: PathBuf::new(),
            script: RwLock::new(Some(Arc::new(script))),
        }
    }

    /// Read and parse the script. Re-reads on every call so a fresh `start`
    /// picks up edits.
    fn load_script(&self, model: &str) -> Result<(), AdapterError> {
        if self.path.as_os_str().is_empty() {
            return Ok(());
        }

        let failed = |reason: String| AdapterError::LoadFailed {
            model: model.to_string(),
            reason,
        };
        let text = std::fs::read_to_string(&self.path)
            .map_err(|e| failed(format!("{}: {e}", self.path.display())))?;
        let script = ReplayScript::from_json(&text)
            .map_err(|e| failed(format!("{}: {e}", self.path.display())))?;

        tracing::info!(
            model,
            path = %self.path.display(),
            face_frames = script.faces.len(),
            object_frames = script.objects.len(),
            "replay script loaded"
        );
        *self.script.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(script));
        Ok(())
    }

    fn script(&self, model: &'static str) -> Result<Arc<ReplayScript>, AdapterError> {
        self.script
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(AdapterError::NotLoaded(model))
    }
}

#[async_trait]
impl FaceDetector for ReplayModels {
    async fn load(&self) -> Result<(), AdapterError> {
        self.load_script("faces")
    }

    async fn detect_faces(
        &self,
        frame: &Frame,
        min_confidence: f32,
    ) -> Result<Vec<DetectedFace>, AdapterError> {
        let script = self.script("faces")?;
        let mut faces = pick(&script.faces, frame.sequence);
        faces.retain(|f| f.score >= min_confidence);
        Ok(faces)
    }
}

#[async_trait]
impl ObjectDetector for ReplayModels {
    async fn load(&self) -> Result<(), AdapterError> {
        self.load_script("objects")
    }

    async fn detect(&self, frame: &Frame) -> Result<Vec<RawDetection>, AdapterError> {
        let script = self.script("objects")?;
        Ok(pick(&script.objects, frame.sequence))
    }
}

#[async_trait]
impl PatternClassifier for ReplayModels {
    async fn load(&self) -> Result<(), AdapterError> {
        self.load_script("patterns")
    }

    async fn detect_multi_scale(
        &self,
        pattern: PatternKind,
        frame: &GrayFrame,
        _params: CascadeParams,
    ) -> Result<Vec<BoundingBox>, AdapterError> {
        let script = self.script("patterns")?;
        Ok(pick(script.pattern_track(pattern), frame.sequence))
    }
}
