use crate::batcher::{EventBatcher, FlushCounters, FlushStats};
use crate::buffer::DetectionBuffer;
use crate::clock::{Clock, SystemClock};
use crate::config::PipelineSettings;
use crate::notice::Notice;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;
use vigil_core::{
    AdapterError, Detection, EventRecord, FaceDetector, FaceGallery, Frame, FrameSource,
    FrameSourceError, ObjectDetector, OwnerId, PatternClassifier, PersistenceSink,
};

const NOTICE_CAPACITY: usize = 32;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("monitor already running (session {0})")]
    AlreadyRunning(Uuid),
    #[error("model load failed: {0}")]
    ModelLoad(#[source] AdapterError),
    #[error("frame source error: {0}")]
    FrameSource(#[from] FrameSourceError),
}

/// The three inference models driven by the loop.
#[derive(Clone)]
pub struct Adapters {
    pub faces: Arc<dyn FaceDetector>,
    pub objects: Arc<dyn ObjectDetector>,
    pub patterns: Arc<dyn PatternClassifier>,
}

/// Latest detections per cycle, for overlay rendering.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Predictions {
    pub faces: Vec<Detection>,
    pub objects: Vec<Detection>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopState {
    Idle,
    Running,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoopStatus {
    pub state: LoopState,
    pub session: Option<Uuid>,
    pub started_at: Option<DateTime<Utc>>,
    pub gallery_size: usize,
    pub buffered: usize,
    #[serde(flatten)]
    pub counters: FlushCounters,
}

/// Quiet-period gate for object/pattern logging.
struct Debouncer {
    window: Duration,
    last: Option<Instant>,
}

impl Debouncer {
    fn new(window: Duration) -> Self {
        Self { window, last: None }
    }

    fn ready(&self, now: Instant) -> bool {
        self.last
            .map_or(true, |last| now.saturating_duration_since(last) >= self.window)
    }

    fn mark(&mut self, now: Instant) {
        self.last = Some(now);
    }
}

/// Everything one session's cycles share.
struct CycleContext {
    owner: OwnerId,
    settings: PipelineSettings,
    adapters: Adapters,
    frames: Arc<dyn FrameSource>,
    gallery: Arc<FaceGallery>,
    buffer: Arc<DetectionBuffer>,
    clock: Arc<dyn Clock>,
    predictions: Arc<watch::Sender<Predictions>>,
}

impl CycleContext {
    fn ready_frame(&self) -> Option<Frame> {
        self.frames.current_frame().filter(Frame::is_ready)
    }

    /// One face pass. Returns the number of records appended.
    async fn face_pass(&self) -> usize {
        let Some(frame) = self.ready_frame() else {
            return 0;
        };

        let faces = match self
            .adapters
            .faces
            .detect_faces(&frame, self.settings.min_face_confidence)
            .await
        {
            Ok(faces) => faces,
            Err(e) => {
                tracing::warn!(error = %e, frame = frame.sequence, "face detection failed; pass skipped");
                return 0;
            }
        };

        if !self.buffer.is_open() {
            return 0;
        }

        let timestamp = self.clock.wall();
        let mut detections = Vec::with_capacity(faces.len());
        let mut records = Vec::with_capacity(faces.len());
        let mut known = 0;
        for face in faces {
            let result = self.gallery.best_match(&face.embedding);
            if result.is_known() {
                known += 1;
            }
            records.push(EventRecord::person(&self.owner, timestamp, &result));
            detections.push(Detection::Face {
                bbox: face.bbox,
                label: result.label,
                person_id: result.person_id,
                distance: result.distance,
            });
        }

        self.predictions.send_modify(|p| p.faces = detections);

        let count = records.len();
        if count == 0 || !self.buffer.append(records) {
            return 0;
        }
        tracing::debug!(faces = count, known, frame = frame.sequence, "face pass logged");
        count
    }

    /// Object detector plus every pattern profile, merged in call order.
    async fn detect_objects(&self, frame: &Frame) -> Result<Vec<Detection>, AdapterError> {
        let mut detections: Vec<Detection> = self
            .adapters
            .objects
            .detect(frame)
            .await?
            .into_iter()
            .map(Detection::from)
            .collect();

        let gray = frame.to_grayscale();
        for (kind, params) in self.settings.pattern_profiles() {
            let boxes = self.adapters.patterns.detect_multi_scale(kind, &gray, params).await?;
            detections.extend(boxes.into_iter().map(|bbox| Detection::Pattern {
                bbox,
                kind,
                score: 1.0,
            }));
        }

        Ok(detections)
    }

    /// One object/pattern pass. Returns the number of records appended.
    async fn object_pass(&self, debounce: &mut Debouncer) -> usize {
        let Some(frame) = self.ready_frame() else {
            return 0;
        };

        let detections = match self.detect_objects(&frame).await {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(error = %e, frame = frame.sequence, "object detection failed; pass skipped");
                return 0;
            }
        };

        if !self.buffer.is_open() {
            return 0;
        }

        let now = self.clock.now();
        let log_now = debounce.ready(now);
        let records: Vec<EventRecord> = if log_now {
            let timestamp = self.clock.wall();
            detections
                .iter()
                .filter_map(|d| EventRecord::from_detection(&self.owner, timestamp, d))
                .collect()
        } else {
            Vec::new()
        };

        self.predictions.send_modify(|p| p.objects = detections);

        let count = records.len();
        if count == 0 || !self.buffer.append(records) {
            return 0;
        }
        debounce.mark(now);
        tracing::debug!(records = count, frame = frame.sequence, "object pass logged");
        count
    }
}

async fn run_face_cycle(ctx: Arc<CycleContext>) {
    let pause = ctx.settings.face_cycle_pause();
    loop {
        ctx.face_pass().await;
        if pause.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(pause).await;
        }
    }
}

async fn run_object_cycle(ctx: Arc<CycleContext>) {
    let mut ticker = tokio::time::interval(ctx.settings.object_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut debounce = Debouncer::new(ctx.settings.log_debounce());
    loop {
        ticker.tick().await;
        ctx.object_pass(&mut debounce).await;
    }
}

struct RunningSession {
    id: Uuid,
    started_at: DateTime<Utc>,
    gallery_size: usize,
    buffer: Arc<DetectionBuffer>,
    batcher: Arc<EventBatcher>,
    cycles: [JoinHandle<()>; 2],
    flusher: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

/// Monitoring session controller: Idle until [`start`](Self::start), then
/// three tasks (face cycle, object cycle, batch flush) until [`stop`](Self::stop).
pub struct DetectionLoop {
    owner: OwnerId,
    settings: PipelineSettings,
    adapters: Adapters,
    frames: Arc<dyn FrameSource>,
    sink: Arc<dyn PersistenceSink>,
    clock: Arc<dyn Clock>,
    predictions: Arc<watch::Sender<Predictions>>,
    notices: broadcast::Sender<Notice>,
    stats: Arc<FlushStats>,
    session: Option<RunningSession>,
}

impl DetectionLoop {
    pub fn new(
        owner: OwnerId,
        settings: PipelineSettings,
        adapters: Adapters,
        frames: Arc<dyn FrameSource>,
        sink: Arc<dyn PersistenceSink>,
    ) -> Self {
        let (predictions, _) = watch::channel(Predictions::default());
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        Self {
            owner,
            settings,
            adapters,
            frames,
            sink,
            clock: Arc::new(SystemClock),
            predictions: Arc::new(predictions),
            notices,
            stats: Arc::new(FlushStats::default()),
            session: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn state(&self) -> LoopState {
        if self.session.is_some() {
            LoopState::Running
        } else {
            LoopState::Idle
        }
    }

    pub fn status(&self) -> LoopStatus {
        let session = self.session.as_ref();
        LoopStatus {
            state: self.state(),
            session: session.map(|s| s.id),
            started_at: session.map(|s| s.started_at),
            gallery_size: session.map_or(0, |s| s.gallery_size),
            buffered: session.map_or(0, |s| s.buffer.len()),
            counters: self.stats.snapshot(),
        }
    }

    pub fn subscribe_predictions(&self) -> watch::Receiver<Predictions> {
        self.predictions.subscribe()
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    /// Load models, start the frame source, load the gallery and spawn the
    /// session tasks. On error the loop stays Idle.
    pub async fn start(&mut self) -> Result<Uuid, EngineError> {
        if let Some(session) = &self.session {
            return Err(EngineError::AlreadyRunning(session.id));
        }

        tokio::try_join!(
            self.adapters.faces.load(),
            self.adapters.objects.load(),
            self.adapters.patterns.load(),
        )
        .map_err(EngineError::ModelLoad)?;
        tracing::info!("models loaded");

        self.frames.start().await?;

        let gallery = match FaceGallery::load(
            self.sink.as_ref(),
            &self.owner,
            self.settings.match_threshold,
        )
        .await
        {
            Ok(gallery) => gallery,
            Err(e) => {
                tracing::warn!(error = %e, "gallery unavailable; all faces will be reported unknown");
                let _ = self.notices.send(Notice::GalleryLoadFailed {
                    reason: e.to_string(),
                });
                FaceGallery::empty(self.settings.match_threshold)
            }
        };
        let gallery_size = gallery.len();

        let buffer = Arc::new(DetectionBuffer::new());
        let batcher = Arc::new(EventBatcher::new(
            Arc::clone(&buffer),
            Arc::clone(&self.sink),
            Arc::clone(&self.stats),
            self.notices.clone(),
        ));
        let ctx = Arc::new(CycleContext {
            owner: self.owner.clone(),
            settings: self.settings.clone(),
            adapters: self.adapters.clone(),
            frames: Arc::clone(&self.frames),
            gallery: Arc::new(gallery),
            buffer: Arc::clone(&buffer),
            clock: Arc::clone(&self.clock),
            predictions: Arc::clone(&self.predictions),
        });

        let cycles = [
            tokio::spawn(run_face_cycle(Arc::clone(&ctx))),
            tokio::spawn(run_object_cycle(ctx)),
        ];
        let (shutdown, shutdown_rx) = watch::channel(false);
        let flusher = tokio::spawn(
            Arc::clone(&batcher).run(self.settings.flush_interval(), shutdown_rx),
        );

        let id = Uuid::new_v4();
        self.session = Some(RunningSession {
            id,
            started_at: self.clock.wall(),
            gallery_size,
            buffer,
            batcher,
            cycles,
            flusher,
            shutdown,
        });

        tracing::info!(
            session = %id,
            owner = %self.owner,
            gallery = gallery_size,
            "monitor started"
        );
        Ok(id)
    }

    /// Close the buffer, cancel both cycles, let the flush task finish any
    /// write in progress, release the frame source and clear predictions.
    /// No-op when Idle.
    pub async fn stop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };

        session.buffer.close();
        for task in &session.cycles {
            task.abort();
        }
        for task in session.cycles {
            let _ = task.await;
        }

        session.shutdown.send_replace(true);
        if let Err(e) = session.flusher.await {
            tracing::error!(error = %e, "batch flush task failed");
        }

        self.frames.stop().await;
        self.predictions.send_replace(Predictions::default());

        if self.settings.flush_on_stop {
            session.batcher.flush().await;
        } else {
            let discarded = session.buffer.drain().len();
            if discarded > 0 {
                tracing::warn!(records = discarded, "discarding buffered events on stop");
            }
        }

        tracing::info!(session = %session.id, "monitor stopped");
        let _ = self.notices.send(Notice::Stopped {
            session: session.id,
        });
    }
}
