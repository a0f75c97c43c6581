mod classifier;
mod motion;
mod object;
mod onnx;
mod overlay;
mod pipeline;
mod trigger;
mod worker;

pub use classifier::{Classifier, OnnxClassifier};
pub use motion::MotionFilter;
pub use object::{DetectorAdapter, YoloDetector};
pub use pipeline::{spawn_session, CameraSession, EncodedFrame, SessionHandle};
pub use trigger::TriggerCoordinator;
pub use worker::WorkerContext;
