//! vigil-core — Detection data model, face gallery matching and the
//! contracts between the monitor pipeline and its collaborators.
//!
//! Models, frame sources and storage are consumed through the traits in
//! [`adapters`] and [`sink`]; this crate never runs inference itself.

pub mod adapters;
pub mod event;
pub mod gallery;
pub mod sink;
pub mod types;

pub use adapters::{AdapterError, FaceDetector, FrameSource, FrameSourceError, ObjectDetector, PatternClassifier};
pub use event::{EventKind, EventRecord, EventRow};
pub use gallery::{EuclideanMatcher, FaceGallery, GalleryError, MatchResult, Matcher, PersonRecord};
pub use sink::{PersistenceSink, SinkError};
pub use types::{
    BoundingBox, CascadeParams, DetectedFace, Detection, Embedding, Frame, GrayFrame, OwnerId,
    PatternKind, PersonId, RawDetection,
};
