//! Still-image feed: cycles the images of a directory at a fixed frame rate.
//!
//! Stands in for a remote stream when replaying captured footage.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use vigil_core::{Frame, FrameSource, FrameSourceError};

const IMAGE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "bmp"];

struct Playback {
    frames: Vec<Frame>,
    started: Instant,
}

pub struct DirectorySource {
    dir: PathBuf,
    frame_interval: Duration,
    playback: Mutex<Option<Playback>>,
}

impl DirectorySource {
    pub fn new(dir: impl Into<PathBuf>, fps: u32) -> Self {
        let fps = fps.max(1);
        Self {
            dir: dir.into(),
            frame_interval: Duration::from_secs(1) / fps,
            playback: Mutex::new(None),
        }
    }

    fn load_frames(dir: &Path) -> Result<Vec<Frame>, FrameSourceError> {
        let entries = std::fs::read_dir(dir)
            .map_err(|e| FrameSourceError::Unavailable(format!("{}: {e}", dir.display())))?;

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                    .unwrap_or(false)
            })
            .collect();
        paths.sort();

        let mut frames = Vec::with_capacity(paths.len());
        for (i, path) in paths.iter().enumerate() {
            let image = image::open(path).map_err(|e| {
                FrameSourceError::StartFailed(format!("{}: {e}", path.display()))
            })?;
            let rgb = image.to_rgb8();
            let (width, height) = rgb.dimensions();
            frames.push(Frame::new(rgb.into_raw(), width, height, i as u32));
        }

        if frames.is_empty() {
            return Err(FrameSourceError::Unavailable(format!(
                "no images in {}",
                dir.display()
            )));
        }
        Ok(frames)
    }
}

#[async_trait]
impl FrameSource for DirectorySource {
    async fn start(&self) -> Result<(), FrameSourceError> {
        let mut playback = self.playback.lock().unwrap_or_else(PoisonError::into_inner);
        if playback.is_some() {
            return Ok(());
        }

        let frames = Self::load_frames(&self.dir)?;
        tracing::info!(dir = %self.dir.display(), frames = frames.len(), "image feed loaded");
        *playback = Some(Playback {
            frames,
            started: Instant::now(),
        });
        Ok(())
    }

    fn current_frame(&self) -> Option<Frame> {
        let playback = self.playback.lock().unwrap_or_else(PoisonError::into_inner);
        let playback = playback.as_ref()?;

        let tick = playback.started.elapsed().as_nanos() / self.frame_interval.as_nanos().max(1);
        let idx = (tick % playback.frames.len() as u128) as usize;

        let mut frame = playback.frames[idx].clone();
        frame.sequence = tick as u32;
        frame.timestamp = Instant::now();
        Some(frame)
    }

    async fn stop(&self) {
        *self.playback.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("vigil-hw-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn test_plays_images_from_directory() {
        let dir = scratch_dir();
        image::RgbImage::from_pixel(4, 3, image::Rgb([10, 20, 30]))
            .save(dir.join("a.png"))
            .unwrap();
        image::RgbImage::from_pixel(4, 3, image::Rgb([40, 50, 60]))
            .save(dir.join("b.png"))
            .unwrap();
        std::fs::write(dir.join("notes.txt"), "not an image").unwrap();

        let source = DirectorySource::new(&dir, 30);
        assert!(source.current_frame().is_none());

        source.start().await.unwrap();
        let frame = source.current_frame().expect("frame after start");
        assert!(frame.is_ready());
        assert_eq!((frame.width, frame.height), (4, 3));
        assert_eq!(frame.data.len(), 4 * 3 * 3);

        source.stop().await;
        assert!(source.current_frame().is_none());

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn test_empty_directory_fails() {
        let dir = scratch_dir();
        let source = DirectorySource::new(&dir, 30);
        let err = source.start().await.unwrap_err();
        assert!(matches!(err, FrameSourceError::Unavailable(_)));
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
