use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

mod analytics;
mod api;
mod camera;
mod config;
mod storage;

use analytics::{
    spawn_session, CameraSession, Classifier, DetectorAdapter, MotionFilter, OnnxClassifier,
    SessionHandle, TriggerCoordinator, WorkerContext, YoloDetector,
};
use api::AppState;
use camera::OpenCvCapture;
use config::Config;
use storage::{DetectionStore, SqliteDetectionStore};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("birdybird=debug".parse()?))
        .init();

    let config = Config::load()?;
    tracing::info!(
        camera = %config.camera.source,
        debug = config.camera.debug,
        cooldown_secs = config.trigger.cooldown_secs,
        "configuration loaded"
    );

    std::fs::create_dir_all(&config.storage.captures_dir)?;
    let store: Arc<dyn DetectionStore> =
        Arc::new(SqliteDetectionStore::open(&config.storage.database)?);

    tracing::info!(model = %config.classifier.model, "loading species classifier");
    let classifier: Arc<dyn Classifier> = Arc::new(OnnxClassifier::new(&config.classifier)?);

    tracing::info!(model = %config.detector.model, "loading object detector");
    let detector = YoloDetector::new(&config.detector.model, config.detector.min_confidence)?;
    let detector = DetectorAdapter::new(Box::new(detector), &config.detector);

    let motion = MotionFilter::new(&config.motion)?;
    let trigger = TriggerCoordinator::new(config.trigger.cooldown(), config.motion.confirm_frames);
    let handle = SessionHandle::new(&config.camera.source, config.camera.debug, trigger);
    let worker_ctx = Arc::new(WorkerContext::new(&config, classifier, Arc::clone(&store)));

    let session = CameraSession::new(
        Arc::clone(&handle),
        OpenCvCapture::opener(),
        motion,
        detector,
        worker_ctx,
        tokio::runtime::Handle::current(),
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    let session_task = spawn_session(session, Arc::clone(&shutdown));

    let state = AppState::new(handle, store, config.storage.captures_dir.clone());

    tokio::select! {
        result = api::start_server(state, config.http.port) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    shutdown.store(true, Ordering::Relaxed);
    if let Err(e) = session_task.await {
        tracing::error!(error = %e, "camera session task failed");
    }

    tracing::info!("shutdown complete");
    Ok(())
}
