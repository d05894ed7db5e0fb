//! Contracts for the inference models and the frame source.
//!
//! The pipeline treats every model as a black box: it loads once per start,
//! then answers one call per frame. Any call may fail; callers log and move on.

use crate::types::{BoundingBox, CascadeParams, DetectedFace, Frame, GrayFrame, PatternKind, RawDetection};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AdapterError {
    #[error("model not loaded: {0}")]
    NotLoaded(&'static str),
    #[error("failed to load {model}: {reason}")]
    LoadFailed { model: String, reason: String },
    #[error("inference failed: {0}")]
    InferenceFailed(String),
}

#[derive(Error, Debug)]
pub enum FrameSourceError {
    #[error("frame source unavailable: {0}")]
    Unavailable(String),
    #[error("failed to start frame source: {0}")]
    StartFailed(String),
}

/// Face detection + recognition model.
#[async_trait]
pub trait FaceDetector: Send + Sync {
    async fn load(&self) -> Result<(), AdapterError>;

    /// Detect every face above `min_confidence`, each with its embedding.
    async fn detect_faces(
        &self,
        frame: &Frame,
        min_confidence: f32,
    ) -> Result<Vec<DetectedFace>, AdapterError>;
}

/// Generic object detector (everyday object classes).
#[async_trait]
pub trait ObjectDetector: Send + Sync {
    async fn load(&self) -> Result<(), AdapterError>;

    async fn detect(&self, frame: &Frame) -> Result<Vec<RawDetection>, AdapterError>;
}

/// Cascade classifier trained on a fixed set of patterns.
#[async_trait]
pub trait PatternClassifier: Send + Sync {
    async fn load(&self) -> Result<(), AdapterError>;

    /// Run the cascade for one pattern over a grayscale frame.
    async fn detect_multi_scale(
        &self,
        pattern: PatternKind,
        frame: &GrayFrame,
        params: CascadeParams,
    ) -> Result<Vec<BoundingBox>, AdapterError>;
}

/// Supplies the most recent video frame.
#[async_trait]
pub trait FrameSource: Send + Sync {
    /// Acquire the underlying device or stream. Idempotent.
    async fn start(&self) -> Result<(), FrameSourceError>;

    /// Latest frame, or `None` while nothing has been captured yet.
    fn current_frame(&self) -> Option<Frame>;

    /// Release capture resources. Safe to call when not started.
    async fn stop(&self);
}
