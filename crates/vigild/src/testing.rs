//! Hand-written collaborators for unit tests.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use vigil_core::{
    AdapterError, BoundingBox, CascadeParams, DetectedFace, Embedding, EventRow, FaceDetector,
    Frame, FrameSource, FrameSourceError, GrayFrame, ObjectDetector, OwnerId, PatternClassifier,
    PatternKind, PersistenceSink, PersonId, PersonRecord, RawDetection, SinkError,
};

pub fn ready_frame() -> Frame {
    Frame::new(vec![128u8; 4 * 4 * 3], 4, 4, 1)
}

pub fn bbox() -> BoundingBox {
    BoundingBox::new(10.0, 20.0, 30.0, 40.0)
}

pub fn person(id: i64, first: &str, last: &str, values: Vec<f32>) -> PersonRecord {
    PersonRecord {
        person_id: PersonId(id),
        first_name: Some(first.into()),
        last_name: Some(last.into()),
        embedding: Some(Embedding::new(values)),
    }
}

/// In-memory sink. A gated sink parks its first insert until the gate is
/// notified.
#[derive(Default)]
pub struct MockSink {
    pub gallery: Mutex<Vec<PersonRecord>>,
    pub fail_gallery: AtomicBool,
    pub fail_inserts: AtomicBool,
    pub batches: Mutex<Vec<Vec<EventRow>>>,
    pub gate: Option<Arc<Notify>>,
    pub inserts: AtomicUsize,
    pub entered: Notify,
}

impl MockSink {
    pub fn gated(gate: Arc<Notify>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::default()
        }
    }

    pub fn with_gallery(records: Vec<PersonRecord>) -> Self {
        let sink = Self::default();
        *sink.gallery.lock().unwrap() = records;
        sink
    }

    pub fn batches(&self) -> Vec<Vec<EventRow>> {
        self.batches.lock().unwrap().clone()
    }

    pub fn rows(&self) -> Vec<EventRow> {
        self.batches().into_iter().flatten().collect()
    }
}

#[async_trait]
impl PersistenceSink for MockSink {
    async fn load_gallery(&self, _owner: &OwnerId) -> Result<Vec<PersonRecord>, SinkError> {
        if self.fail_gallery.load(Ordering::SeqCst) {
            return Err(SinkError::Unavailable("members table offline".into()));
        }
        Ok(self.gallery.lock().unwrap().clone())
    }

    async fn insert_events(&self, batch: &[EventRow]) -> Result<(), SinkError> {
        let call = self.inserts.fetch_add(1, Ordering::SeqCst);
        self.entered.notify_one();
        if let Some(gate) = self.gate.as_ref().filter(|_| call == 0) {
            gate.notified().await;
        }
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(SinkError::Unavailable("events table offline".into()));
        }
        self.batches.lock().unwrap().push(batch.to_vec());
        Ok(())
    }
}

/// Frame source serving one fixed frame.
pub struct MockFrames {
    frame: Mutex<Option<Frame>>,
    pub started: AtomicUsize,
    pub stopped: AtomicUsize,
    pub fail_start: AtomicBool,
}

impl MockFrames {
    pub fn new(frame: Option<Frame>) -> Self {
        Self {
            frame: Mutex::new(frame),
            started: AtomicUsize::new(0),
            stopped: AtomicUsize::new(0),
            fail_start: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl FrameSource for MockFrames {
    async fn start(&self) -> Result<(), FrameSourceError> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(FrameSourceError::StartFailed("no such device".into()));
        }
        self.started.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn current_frame(&self) -> Option<Frame> {
        self.frame.lock().unwrap().clone()
    }

    async fn stop(&self) {
        self.stopped.fetch_add(1, Ordering::SeqCst);
    }
}

/// Face detector returning a fixed answer, optionally parked on a gate.
#[derive(Default)]
pub struct MockFaces {
    pub faces: Mutex<Vec<DetectedFace>>,
    pub fail_load: AtomicBool,
    pub fail_detect: AtomicBool,
    pub gate: Option<Arc<Notify>>,
    pub calls: AtomicUsize,
    pub entered: Notify,
}

impl MockFaces {
    pub fn returning(faces: Vec<DetectedFace>) -> Self {
        let mock = Self::default();
        *mock.faces.lock().unwrap() = faces;
        mock
    }

    pub fn gated(faces: Vec<DetectedFace>, gate: Arc<Notify>) -> Self {
        let mut mock = Self::returning(faces);
        mock.gate = Some(gate);
        mock
    }
}

#[async_trait]
impl FaceDetector for MockFaces {
    async fn load(&self) -> Result<(), AdapterError> {
        if self.fail_load.load(Ordering::SeqCst) {
            return Err(AdapterError::LoadFailed {
                model: "faces".into(),
                reason: "weights missing".into(),
            });
        }
        Ok(())
    }

    async fn detect_faces(
        &self,
        _frame: &Frame,
        min_confidence: f32,
    ) -> Result<Vec<DetectedFace>, AdapterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.entered.notify_one();
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if self.fail_detect.load(Ordering::SeqCst) {
            return Err(AdapterError::InferenceFailed("tensor shape mismatch".into()));
        }
        Ok(self
            .faces
            .lock()
            .unwrap()
            .iter()
            .filter(|f| f.score >= min_confidence)
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct MockObjects {
    pub objects: Mutex<Vec<RawDetection>>,
    pub fail_detect: AtomicBool,
    pub calls: AtomicUsize,
}

impl MockObjects {
    pub fn returning(objects: Vec<RawDetection>) -> Self {
        let mock = Self::default();
        *mock.objects.lock().unwrap() = objects;
        mock
    }
}

#[async_trait]
impl ObjectDetector for MockObjects {
    async fn load(&self) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn detect(&self, _frame: &Frame) -> Result<Vec<RawDetection>, AdapterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_detect.load(Ordering::SeqCst) {
            return Err(AdapterError::InferenceFailed("detector crashed".into()));
        }
        Ok(self.objects.lock().unwrap().clone())
    }
}

/// Pattern classifier with scripted answers per pattern. Records the
/// parameters it was called with.
#[derive(Default)]
pub struct MockPatterns {
    pub hits: Mutex<Vec<(PatternKind, BoundingBox)>>,
    pub calls: Mutex<Vec<(PatternKind, CascadeParams)>>,
}

impl MockPatterns {
    pub fn returning(hits: Vec<(PatternKind, BoundingBox)>) -> Self {
        let mock = Self::default();
        *mock.hits.lock().unwrap() = hits;
        mock
    }
}

#[async_trait]
impl PatternClassifier for MockPatterns {
    async fn load(&self) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn detect_multi_scale(
        &self,
        pattern: PatternKind,
        _frame: &GrayFrame,
        params: CascadeParams,
    ) -> Result<Vec<BoundingBox>, AdapterError> {
        self.calls.lock().unwrap().push((pattern, params));
        Ok(self
            .hits
            .lock()
            .unwrap()
            .iter()
            .filter(|(kind, _)| *kind == pattern)
            .map(|(_, b)| *b)
            .collect())
    }
}
