//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, Frame};
use std::io;
use std::path::Path;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const REQUESTED_WIDTH: u32 = 640;
const REQUESTED_HEIGHT: u32 = 480;
const STREAM_BUFFERS: u32 = 4;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("camera access denied: {0}")]
    Permission(String),
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
    #[error("frame source not started")]
    NotStarted,
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Pixel layouts the gate can convert to RGB8.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Yuyv,
    Rgb24,
    /// Monochrome, as delivered by IR-only sensors.
    Grey,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"YUYV" => Some(Self::Yuyv),
            b"RGB3" => Some(Self::Rgb24),
            b"GREY" => Some(Self::Grey),
            _ => None,
        }
    }

    fn to_rgb(self, raw: &[u8], width: u32, height: u32) -> Result<Vec<u8>, CameraError> {
        let converted = match self {
            Self::Yuyv => frame::yuyv_to_rgb(raw, width, height),
            Self::Grey => frame::grey_to_rgb(raw, width, height),
            Self::Rgb24 => {
                let len = (width * height) as usize * frame::RGB_CHANNELS;
                return raw.get(..len).map(<[u8]>::to_vec).ok_or_else(|| {
                    CameraError::CaptureFailed(format!(
                        "short RGB3 buffer: {} of {len} bytes",
                        raw.len()
                    ))
                });
            }
        };
        converted.map_err(|e| CameraError::CaptureFailed(format!("{self:?} frame: {e}")))
    }
}

/// An open V4L2 capture device with a negotiated format.
pub struct Camera {
    device: Device,
    width: u32,
    height: u32,
    format: PixelFormat,
}

impl Camera {
    pub fn open(device_path: &str) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }
        let device = Device::with_path(device_path).map_err(|e| open_error(device_path, e))?;

        let caps = capture_caps(&device).ok_or(CameraError::StreamingNotSupported)?;
        let (width, height, format) = negotiate(&device)?;

        tracing::info!(
            device = device_path,
            card = %caps.card,
            driver = %caps.driver,
            width,
            height,
            ?format,
            "camera opened"
        );

        Ok(Self {
            device,
            width,
            height,
            format,
        })
    }

    /// Grab the newest frame as RGB8.
    ///
    /// A fresh mmap stream per call means the frame is current even when
    /// the caller polls far slower than the sensor's frame rate.
    pub fn capture_frame(&self) -> Result<Frame, CameraError> {
        let mut stream =
            MmapStream::with_buffers(&self.device, BufType::VideoCapture, STREAM_BUFFERS)
                .map_err(|e| CameraError::CaptureFailed(format!("mmap stream: {e}")))?;
        let (raw, meta) = stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("dequeue: {e}")))?;

        Ok(Frame {
            data: self.format.to_rgb(raw, self.width, self.height)?,
            width: self.width,
            height: self.height,
            timestamp: std::time::Instant::now(),
            sequence: meta.sequence,
        })
    }

    /// Capture-capable devices among `/dev/video0` .. `/dev/video15`.
    pub fn list_devices() -> Vec<DeviceInfo> {
        (0..16)
            .map(|i| format!("/dev/video{i}"))
            .filter(|path| Path::new(path).exists())
            .filter_map(|path| {
                let device = Device::with_path(&path).ok()?;
                let caps = capture_caps(&device)?;
                Some(DeviceInfo {
                    path,
                    name: caps.card,
                    driver: caps.driver,
                    bus: caps.bus,
                })
            })
            .collect()
    }
}

/// Device capabilities, if the device can capture video.
fn capture_caps(device: &Device) -> Option<v4l::capability::Capabilities> {
    device
        .query_caps()
        .ok()
        .filter(|caps| caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE))
}

/// Request YUYV at the preferred size and accept whatever convertible
/// layout the driver settles on.
fn negotiate(device: &Device) -> Result<(u32, u32, PixelFormat), CameraError> {
    let mut wanted = device
        .format()
        .map_err(|e| CameraError::FormatNegotiationFailed(format!("get format: {e}")))?;
    wanted.fourcc = FourCC::new(b"YUYV");
    wanted.width = REQUESTED_WIDTH;
    wanted.height = REQUESTED_HEIGHT;

    let got = device
        .set_format(&wanted)
        .map_err(|e| CameraError::FormatNegotiationFailed(format!("set format: {e}")))?;
    let format = PixelFormat::from_fourcc(got.fourcc).ok_or_else(|| {
        CameraError::FormatNegotiationFailed(format!(
            "driver chose {}, expected YUYV, RGB3 or GREY",
            got.fourcc
        ))
    })?;
    Ok((got.width, got.height, format))
}

/// Denied or busy devices are reported as permission problems: the
/// operator has to free or grant the camera before the gate can run.
fn open_error(device_path: &str, e: io::Error) -> CameraError {
    let busy = e.raw_os_error() == Some(16) || e.to_string().contains("busy");
    if e.kind() == io::ErrorKind::PermissionDenied || busy {
        CameraError::Permission(format!("{device_path}: {e}"))
    } else {
        CameraError::DeviceNotFound(format!("{device_path}: {e}"))
    }
}
