mod capture;

pub use capture::{list_devices, CameraDevice, CaptureError, FrameSource, OpenCvCapture, SourceOpener};
