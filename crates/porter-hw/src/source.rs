//! Frame source contract and its V4L2 implementation.

use crate::camera::{Camera, CameraError};
use crate::frame::Frame;

/// A live camera stream that hands out the current frame on demand.
///
/// Only one source may hold a device at a time; `stop` releases it and may
/// be called any number of times.
pub trait FrameSource: Send {
    /// Acquire the device and begin streaming.
    fn start(&mut self) -> Result<(), CameraError>;
    /// Return the current frame from the live stream.
    fn capture(&mut self) -> Result<Frame, CameraError>;
    /// Release the device.
    fn stop(&mut self);
    fn is_active(&self) -> bool;
}

/// Frame source over a V4L2 device path.
pub struct V4lFrameSource {
    device_path: String,
    warmup_frames: usize,
    camera: Option<Camera>,
}

impl V4lFrameSource {
    pub fn new(device_path: impl Into<String>) -> Self {
        Self {
            device_path: device_path.into(),
            warmup_frames: 0,
            camera: None,
        }
    }

    /// Discard `count` frames after opening so auto-exposure can settle.
    pub fn with_warmup(mut self, count: usize) -> Self {
        self.warmup_frames = count;
        self
    }

    pub fn device_path(&self) -> &str {
        &self.device_path
    }
}

impl FrameSource for V4lFrameSource {
    fn start(&mut self) -> Result<(), CameraError> {
        if self.camera.is_some() {
            return Ok(());
        }
        let camera = Camera::open(&self.device_path)?;

        if self.warmup_frames > 0 {
            tracing::info!(count = self.warmup_frames, "discarding warmup frames");
            for _ in 0..self.warmup_frames {
                let _ = camera.capture_frame();
            }
        }

        self.camera = Some(camera);
        Ok(())
    }

    fn capture(&mut self) -> Result<Frame, CameraError> {
        self.camera
            .as_ref()
            .ok_or(CameraError::NotStarted)?
            .capture_frame()
    }

    fn stop(&mut self) {
        if self.camera.take().is_some() {
            tracing::info!(device = %self.device_path, "camera released");
        }
    }

    fn is_active(&self) -> bool {
        self.camera.is_some()
    }
}

impl Drop for V4lFrameSource {
    fn drop(&mut self) {
        self.stop();
    }
}
