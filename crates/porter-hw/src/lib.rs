//! porter-hw: camera access and frame-level image processing.
//!
//! Provides the V4L2-backed frame source, RGB conversion and lighting
//! normalisation for captured frames, and the frame-difference motion
//! detector that gates the recognition pipeline.

pub mod camera;
pub mod frame;
pub mod motion;
pub mod source;

pub use camera::{Camera, CameraError, DeviceInfo, PixelFormat};
pub use frame::{Frame, FrameError};
pub use motion::{MotionConfig, MotionDetector};
pub use source::{FrameSource, V4lFrameSource};
