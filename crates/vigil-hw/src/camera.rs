//! V4L2 webcam feed.
//!
//! [`Camera`] is the blocking device handle; [`CameraSource`] drives it from
//! a dedicated capture thread and exposes the newest frame to the async loop.

use crate::frame::{self, FrameError};
use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use thiserror::Error;
use tokio::sync::oneshot;
use v4l::buffer::Type as BufType;
use v4l::capability::Flags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;
use vigil_core::{Frame, FrameSource, FrameSourceError};

/// Resolution requested from the driver; it may answer with another.
const REQUESTED_SIZE: (u32, u32) = (640, 480);
const MMAP_BUFFERS: u32 = 4;
const EBUSY: i32 = 16;

/// Fourcc spellings we can decode, most preferred first. Y16 shows up both
/// space- and nul-padded depending on the driver.
const FOURCC_TABLE: [(&[u8; 4], PixelFormat); 4] = [
    (b"YUYV", PixelFormat::Yuyv),
    (b"GREY", PixelFormat::Grey),
    (b"Y16 ", PixelFormat::Y16),
    (b"Y16\0", PixelFormat::Y16),
];

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("no capture device at {0}")]
    Missing(PathBuf),
    #[error("{0} is in use by another process")]
    Busy(PathBuf),
    #[error("cannot open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{0} is not a video capture device")]
    NotCapture(PathBuf),
    #[error("driver settled on {0}, which cannot be decoded")]
    Format(String),
    #[error("{stage}: {source}")]
    Io {
        stage: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("bad frame buffer: {0}")]
    Frame(#[from] FrameError),
}

/// A V4L2 node that advertises video capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureDevice {
    pub path: PathBuf,
    pub card: String,
    pub driver: String,
    pub bus: String,
}

/// Raw layouts the capture path can turn into RGB8.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Packed YUV 4:2:2.
    Yuyv,
    /// 8-bit luma.
    Grey,
    /// 16-bit little-endian luma.
    Y16,
}

impl PixelFormat {
    pub fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        FOURCC_TABLE
            .iter()
            .find(|(code, _)| **code == fourcc.repr)
            .map(|&(_, format)| format)
    }

    fn to_rgb(self, raw: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
        match self {
            PixelFormat::Yuyv => frame::yuyv_to_rgb(raw, width, height),
            PixelFormat::Grey => frame::grey_to_rgb(raw, width, height),
            PixelFormat::Y16 => frame::y16_to_rgb(raw, width, height),
        }
    }
}

fn open_error(path: &Path, source: io::Error) -> CameraError {
    if source.raw_os_error() == Some(EBUSY) {
        CameraError::Busy(path.to_path_buf())
    } else {
        CameraError::Open {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Blocking handle on one negotiated capture device.
pub struct Camera {
    device: Device,
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl Camera {
    /// Open `path` and negotiate [`REQUESTED_SIZE`] in the first decodable
    /// format the driver accepts.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CameraError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(CameraError::Missing(path.to_path_buf()));
        }

        let device = Device::with_path(path).map_err(|e| open_error(path, e))?;
        let caps = device.query_caps().map_err(|source| CameraError::Io {
            stage: "query capabilities",
            source,
        })?;
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
            return Err(CameraError::NotCapture(path.to_path_buf()));
        }

        let mut wanted = device.format().map_err(|source| CameraError::Io {
            stage: "read format",
            source,
        })?;
        (wanted.width, wanted.height) = REQUESTED_SIZE;
        wanted.fourcc = FourCC::new(FOURCC_TABLE[0].0);

        let granted = device.set_format(&wanted).map_err(|source| CameraError::Io {
            stage: "set format",
            source,
        })?;
        let format = PixelFormat::from_fourcc(granted.fourcc)
            .ok_or_else(|| CameraError::Format(granted.fourcc.to_string()))?;

        tracing::info!(
            device = %path.display(),
            card = %caps.card,
            width = granted.width,
            height = granted.height,
            ?format,
            "camera opened"
        );

        Ok(Self {
            device,
            path: path.to_path_buf(),
            width: granted.width,
            height: granted.height,
            format,
        })
    }

    /// Grab one frame on a short-lived stream.
    pub fn capture_frame(&self) -> Result<Frame, CameraError> {
        let mut stream = self.mmap_stream()?;
        self.next_frame(&mut stream)
    }

    /// Push frames into `on_frame` until `running` is cleared or a dequeue
    /// fails.
    pub fn stream(&self, running: &AtomicBool, mut on_frame: impl FnMut(Frame)) -> Result<(), CameraError> {
        let mut stream = self.mmap_stream()?;
        while running.load(Ordering::Acquire) {
            on_frame(self.next_frame(&mut stream)?);
        }
        Ok(())
    }

    fn mmap_stream(&self) -> Result<MmapStream<'_>, CameraError> {
        MmapStream::with_buffers(&self.device, BufType::VideoCapture, MMAP_BUFFERS)
            .map_err(|source| CameraError::Io {
                stage: "map buffers",
                source,
            })
    }

    fn next_frame(&self, stream: &mut MmapStream<'_>) -> Result<Frame, CameraError> {
        let (raw, meta) = stream.next().map_err(|source| CameraError::Io {
            stage: "dequeue buffer",
            source,
        })?;
        let rgb = self.format.to_rgb(raw, self.width, self.height)?;
        Ok(Frame::new(rgb, self.width, self.height, meta.sequence))
    }

    /// Every `/dev/video*` node that reports video capture, sorted by path.
    pub fn list_devices() -> Vec<CaptureDevice> {
        let Ok(dir) = std::fs::read_dir("/dev") else {
            return Vec::new();
        };

        let mut found: Vec<CaptureDevice> = dir
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("video"))
            })
            .filter_map(|path| {
                let caps = Device::with_path(&path).ok()?.query_caps().ok()?;
                caps.capabilities
                    .contains(Flags::VIDEO_CAPTURE)
                    .then(|| CaptureDevice {
                        path,
                        card: caps.card,
                        driver: caps.driver,
                        bus: caps.bus,
                    })
            })
            .collect();
        found.sort_by(|a, b| a.path.cmp(&b.path));
        found
    }
}

/// Live webcam feed: a capture thread keeps the latest frame in a shared slot.
pub struct CameraSource {
    path: PathBuf,
    latest: Arc<Mutex<Option<Frame>>>,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CameraSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            latest: Arc::new(Mutex::new(None)),
            running: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn spawn_capture(
        &self,
        opened: oneshot::Sender<Result<(), CameraError>>,
    ) -> io::Result<JoinHandle<()>> {
        let path = self.path.clone();
        let latest = Arc::clone(&self.latest);
        let running = Arc::clone(&self.running);

        std::thread::Builder::new().name("vigil-capture".into()).spawn(move || {
            let camera = match Camera::open(&path) {
                Ok(camera) => camera,
                Err(e) => {
                    let _ = opened.send(Err(e));
                    return;
                }
            };
            if opened.send(Ok(())).is_err() {
                return;
            }

            let publish = |frame| *latest.lock().unwrap_or_else(PoisonError::into_inner) = Some(frame);
            if let Err(e) = camera.stream(&running, publish) {
                tracing::warn!(device = %path.display(), error = %e, "capture ended");
            }
            *latest.lock().unwrap_or_else(PoisonError::into_inner) = None;
            tracing::debug!(device = %path.display(), "capture thread exiting");
        })
    }

    fn take_worker(&self) -> Option<JoinHandle<()>> {
        self.worker.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

/// Join a capture thread off the async worker threads.
async fn join_capture(handle: JoinHandle<()>) -> bool {
    tokio::task::spawn_blocking(move || handle.join().is_ok())
        .await
        .unwrap_or(false)
}

#[async_trait]
impl FrameSource for CameraSource {
    async fn start(&self) -> Result<(), FrameSourceError> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let (opened_tx, opened_rx) = oneshot::channel();
        let handle = match self.spawn_capture(opened_tx) {
            Ok(handle) => handle,
            Err(e) => {
                self.running.store(false, Ordering::Release);
                return Err(FrameSourceError::StartFailed(format!("cannot spawn capture thread: {e}")));
            }
        };

        let opened = match opened_rx.await {
            Ok(result) => result.map_err(|e| FrameSourceError::StartFailed(e.to_string())),
            Err(_) => Err(FrameSourceError::StartFailed("capture thread exited".into())),
        };
        if let Err(e) = opened {
            self.running.store(false, Ordering::Release);
            join_capture(handle).await;
            return Err(e);
        }

        *self.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    fn current_frame(&self) -> Option<Frame> {
        self.latest.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.take_worker() {
            if !join_capture(handle).await {
                tracing::warn!(device = %self.path.display(), "capture thread panicked");
            }
        }
        *self.latest.lock().unwrap_or_else(PoisonError::into_inner) = None;
        tracing::info!(device = %self.path.display(), "camera released");
    }
}
