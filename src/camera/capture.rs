use std::path::Path;

use opencv::core::Mat;
use opencv::prelude::*;
use opencv::videoio;
use serde::Serialize;
use thiserror::Error;

const MAX_DEVICE_INDEX: i32 = 10;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("opencv error: {0}")]
    Cv(#[from] opencv::Error),
    #[error("failed to open source {0}")]
    OpenFailed(String),
}

/// Produces frames one at a time. `Ok(None)` is end of stream.
pub trait FrameSource: Send {
    fn next_frame(&mut self) -> Result<Option<Mat>, CaptureError>;
}

/// Opens a frame source from its identifier (device index, file or URL).
pub type SourceOpener =
    Box<dyn Fn(&str) -> Result<Box<dyn FrameSource>, CaptureError> + Send + Sync>;

pub struct OpenCvCapture {
    source: String,
    capture: videoio::VideoCapture,
}

impl OpenCvCapture {
    pub fn open(source: &str) -> Result<Self, CaptureError> {
        let capture = match source.trim().parse::<i32>() {
            Ok(index) => videoio::VideoCapture::new(index, videoio::CAP_ANY)?,
            Err(_) => videoio::VideoCapture::from_file(source, videoio::CAP_ANY)?,
        };

        if !capture.is_opened()? {
            return Err(CaptureError::OpenFailed(source.to_string()));
        }

        tracing::info!(camera = %source, "frame source opened");

        Ok(Self {
            source: source.to_string(),
            capture,
        })
    }

    pub fn opener() -> SourceOpener {
        Box::new(|source| Ok(Box::new(OpenCvCapture::open(source)?) as Box<dyn FrameSource>))
    }
}

impl FrameSource for OpenCvCapture {
    fn next_frame(&mut self) -> Result<Option<Mat>, CaptureError> {
        let mut frame = Mat::default();
        if !self.capture.read(&mut frame)? || frame.empty() {
            tracing::debug!(camera = %self.source, "no frame returned");
            return Ok(None);
        }
        Ok(Some(frame))
    }
}

impl Drop for OpenCvCapture {
    fn drop(&mut self) {
        let _ = self.capture.release();
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CameraDevice {
    pub id: i32,
    pub name: String,
}

/// Video devices present under `dev_root` as `video0`..`video9`.
pub fn list_devices(dev_root: &Path) -> Vec<CameraDevice> {
    (0..MAX_DEVICE_INDEX)
        .filter(|i| dev_root.join(format!("video{i}")).exists())
        .map(|i| CameraDevice {
            id: i,
            name: format!("Camera/Device {i}"),
        })
        .collect()
}
