//! vigil-hw — Frame sources for the monitor pipeline.
//!
//! Provides V4L2 webcam capture and a still-image directory feed, both
//! producing RGB8 frames through [`vigil_core::FrameSource`].

pub mod camera;
pub mod directory;
pub mod frame;

pub use camera::{Camera, CameraError, CameraSource, CaptureDevice, PixelFormat};
pub use directory::DirectorySource;
