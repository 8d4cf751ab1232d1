use crate::camera::CaptureSource;
use crate::common::config::CameraConfig;
use crate::common::{RegistrationError, Result};
use crate::core::events::Frame;
use image::{DynamicImage, ImageBuffer, ImageOutputFormat, Luma};
use std::io::Cursor;
use std::time::Duration;
use v4l::buffer::Type;
use v4l::io::traits::CaptureStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

pub struct Camera {
    device: Device,
    config: CameraConfig,
    index: u32,
}

impl Camera {
    pub fn new(config: &CameraConfig) -> Result<Self> {
        let index = config.device_index;
        tracing::info!("Opening camera device {}...", index);

        let device = Device::new(index as usize)
            .map_err(|e| RegistrationError::Camera(format!("Failed to open camera {}: {}", index, e)))?;

        let caps = device.query_caps()
            .map_err(|e| RegistrationError::Camera(format!("Failed to query capabilities: {}", e)))?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            tracing::warn!("Device {} ({}) may not support standard video capture", index, caps.card);
        }

        let mut fmt = device.format()
            .map_err(|e| RegistrationError::Camera(format!("Failed to get format: {}", e)))?;
        fmt.width = config.width;
        fmt.height = config.height;
        // Keep GREY for IR sensors, everything else is asked for MJPG
        if fmt.fourcc != FourCC::new(b"GREY") {
            fmt.fourcc = FourCC::new(b"MJPG");
        }

        if let Err(e) = device.set_format(&fmt) {
            tracing::warn!("Could not set exact format: {}. Using device defaults.", e);
        }

        let actual = device.format()
            .map_err(|e| RegistrationError::Camera(format!("Failed to get final format: {}", e)))?;
        tracing::info!("Camera {} ready: {}x{} {}", index, actual.width, actual.height,
                       actual.fourcc.str().unwrap_or("????"));

        Ok(Self { device, config: config.clone(), index })
    }

    /// Grab the newest frame. The warmup reads also flush whatever the
    /// driver had queued, so the returned frame is current.
    pub fn capture_frame(&mut self) -> Result<Frame> {
        let fmt = self.device.format()
            .map_err(|e| RegistrationError::Camera(format!("Failed to get format: {}", e)))?;

        let raw = {
            let mut stream = v4l::io::mmap::Stream::with_buffers(&mut self.device, Type::VideoCapture, 4)
                .map_err(|e| RegistrationError::Camera(format!("Failed to create stream: {}", e)))?;

            for _ in 0..self.config.warmup_frames {
                stream.next()
                    .map_err(|e| RegistrationError::Camera(format!("Failed to capture warmup frame: {}", e)))?;
                std::thread::sleep(Duration::from_millis(self.config.warmup_delay_ms));
            }

            let (buf, meta) = stream.next()
                .map_err(|e| RegistrationError::Camera(format!("Failed to capture: {}", e)))?;
            let used = (meta.bytesused as usize).min(buf.len());
            buf[..used].to_vec()
        };

        match &fmt.fourcc.repr {
            b"MJPG" => Ok(Frame::new(raw)),
            b"GREY" => grey_to_png(raw, fmt.width, fmt.height),
            other => Err(RegistrationError::Camera(format!(
                "Unsupported pixel format {}", String::from_utf8_lossy(other)
            ))),
        }
    }
}

impl CaptureSource for Camera {
    fn capture_once(&mut self) -> Option<Frame> {
        match self.capture_frame() {
            Ok(frame) if !frame.is_empty() => Some(frame),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!("Camera {} returned no frame: {}", self.index, e);
                None
            }
        }
    }
}

/// Opens the device on first use and again after it drops out, so an
/// unplugged camera reads as "no frame" instead of an error.
pub struct CameraSource {
    config: CameraConfig,
    camera: Option<Camera>,
}

impl CameraSource {
    pub fn new(config: &CameraConfig) -> Self {
        Self { config: config.clone(), camera: None }
    }
}

impl CaptureSource for CameraSource {
    fn capture_once(&mut self) -> Option<Frame> {
        if self.camera.is_none() {
            match Camera::new(&self.config) {
                Ok(camera) => self.camera = Some(camera),
                Err(e) => {
                    tracing::warn!("No camera available: {}", e);
                    return None;
                }
            }
        }

        let frame = self.camera.as_mut().and_then(|camera| camera.capture_once());
        if frame.is_none() {
            // Reopen on the next request
            self.camera = None;
        }
        frame
    }
}

fn grey_to_png(data: Vec<u8>, width: u32, height: u32) -> Result<Frame> {
    let buffer = ImageBuffer::<Luma<u8>, _>::from_raw(width, height, data)
        .ok_or_else(|| RegistrationError::Camera("Failed to create grayscale image buffer".into()))?;

    let mut encoded = Cursor::new(Vec::new());
    DynamicImage::ImageLuma8(buffer).write_to(&mut encoded, ImageOutputFormat::Png)?;
    Ok(Frame::new(encoded.into_inner()))
}
