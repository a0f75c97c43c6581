use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use opencv::core::{Mat, Rect, Vector};
use opencv::imgcodecs;
use opencv::prelude::*;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::storage::{DetectionStore, StoreError};

use super::classifier::{normalize_label, Classifier, ConfidenceTier};
use super::object::CandidateBox;
use super::trigger::InFlightGuard;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("image processing failed: {0}")]
    Cv(#[from] opencv::Error),
    #[error("classifier failed: {0}")]
    Classifier(Box<dyn std::error::Error + Send + Sync>),
    #[error("failed to write capture: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to store detection: {0}")]
    Store(#[from] StoreError),
}

/// Shared, long-lived dependencies of every classification run.
pub struct WorkerContext {
    pub classifier: Arc<dyn Classifier>,
    pub store: Arc<dyn DetectionStore>,
    pub captures_dir: PathBuf,
    pub floor: f32,
    pub confirm: f32,
    pub timeout: Duration,
    /// Held for the whole of a run, including a run that outlived its
    /// timeout.
    pub lane: Mutex<()>,
}

impl WorkerContext {
    pub fn new(
        config: &Config,
        classifier: Arc<dyn Classifier>,
        store: Arc<dyn DetectionStore>,
    ) -> Self {
        Self {
            classifier,
            store,
            captures_dir: config.storage.captures_dir.clone(),
            floor: config.classifier.floor,
            confirm: config.classifier.confirm,
            timeout: config.trigger.worker_timeout(),
            lane: Mutex::new(()),
        }
    }
}

/// Everything one admitted dispatch hands to its worker. The snapshot is an
/// exclusive copy of the undrawn frame.
pub struct ClassificationJob {
    pub camera_id: String,
    pub snapshot: Mat,
    pub candidates: Vec<CandidateBox>,
    pub dispatched_at: DateTime<Utc>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSummary {
    pub examined: usize,
    pub skipped: usize,
    pub discarded: usize,
    pub persisted: usize,
    pub failed: usize,
    pub abandoned: usize,
}

enum RegionOutcome {
    NoPrediction,
    Discarded,
    Persisted,
    Abandoned,
}

/// Run a job off the producer loop. The guard is released when the work
/// finishes, fails, panics or exceeds the context timeout. A timed-out run is
/// cancelled: it stops before its next region and never persists again.
pub fn spawn_classification(
    runtime: &Handle,
    ctx: Arc<WorkerContext>,
    job: ClassificationJob,
    guard: InFlightGuard,
) -> JoinHandle<()> {
    runtime.spawn(async move {
        let camera_id = job.camera_id.clone();
        let regions = job.candidates.len();
        let timeout = ctx.timeout;

        tracing::info!(camera = %camera_id, regions, "classification started");

        let cancel = Arc::new(AtomicBool::new(false));
        let work = {
            let cancel = Arc::clone(&cancel);
            tokio::task::spawn_blocking(move || classify_regions(&ctx, &job, &cancel))
        };
        match tokio::time::timeout(timeout, work).await {
            Ok(Ok(summary)) => {
                tracing::info!(
                    camera = %camera_id,
                    examined = summary.examined,
                    skipped = summary.skipped,
                    discarded = summary.discarded,
                    persisted = summary.persisted,
                    failed = summary.failed,
                    abandoned = summary.abandoned,
                    "classification finished"
                );
            }
            Ok(Err(e)) => {
                tracing::error!(camera = %camera_id, error = %e, "classification task aborted");
            }
            Err(_) => {
                cancel.store(true, Ordering::SeqCst);
                tracing::warn!(
                    camera = %camera_id,
                    timeout_secs = timeout.as_secs_f64(),
                    "classification timed out"
                );
            }
        }

        guard.complete();
    })
}

/// Runs never overlap: a run waits for the lane, and gives up without
/// classifying anything if it was cancelled while waiting.
pub fn classify_regions(
    ctx: &WorkerContext,
    job: &ClassificationJob,
    cancel: &AtomicBool,
) -> WorkerSummary {
    let _lane = ctx.lane.lock().unwrap_or_else(|e| e.into_inner());
    let mut summary = WorkerSummary::default();
    let (width, height) = (job.snapshot.cols(), job.snapshot.rows());

    for (index, candidate) in job.candidates.iter().enumerate() {
        if cancel.load(Ordering::SeqCst) {
            summary.abandoned += job.candidates.len() - index;
            break;
        }
        summary.examined += 1;

        let Some(rect) = clamp_box(candidate, width, height) else {
            summary.skipped += 1;
            continue;
        };

        match classify_region(ctx, job, index, rect, cancel) {
            Ok(RegionOutcome::Persisted) => summary.persisted += 1,
            Ok(RegionOutcome::Abandoned) => summary.abandoned += 1,
            Ok(RegionOutcome::Discarded) | Ok(RegionOutcome::NoPrediction) => {
                summary.discarded += 1
            }
            Err(e) => {
                summary.failed += 1;
                tracing::warn!(
                    camera = %job.camera_id,
                    region = index,
                    error = %e,
                    "region classification failed"
                );
            }
        }
    }

    summary
}

fn classify_region(
    ctx: &WorkerContext,
    job: &ClassificationJob,
    index: usize,
    rect: Rect,
    cancel: &AtomicBool,
) -> Result<RegionOutcome, WorkerError> {
    let crop = Mat::roi(&job.snapshot, rect)?.try_clone()?;
    let jpeg = encode_jpeg(&crop)?;

    let Some(prediction) = ctx
        .classifier
        .predict(&jpeg)
        .map_err(WorkerError::Classifier)?
    else {
        return Ok(RegionOutcome::NoPrediction);
    };

    let tier = ConfidenceTier::from_score(prediction.score, ctx.floor, ctx.confirm);
    if tier == ConfidenceTier::Discard {
        tracing::debug!(
            camera = %job.camera_id,
            region = index,
            label = %prediction.label,
            score = format!("{:.2}", prediction.score),
            "classification below floor"
        );
        return Ok(RegionOutcome::Discarded);
    }

    if cancel.load(Ordering::SeqCst) {
        return Ok(RegionOutcome::Abandoned);
    }

    let species = normalize_label(&prediction.label);
    let filename = format!(
        "capture_{}_{}.jpg",
        job.dispatched_at.timestamp_millis(),
        index
    );
    std::fs::create_dir_all(&ctx.captures_dir)?;
    let path = ctx.captures_dir.join(filename);
    std::fs::write(&path, &jpeg)?;

    let fact = format!(
        "{} ({:.1}% confidence)",
        tier.description(),
        prediction.score * 100.0
    );
    let id = match ctx
        .store
        .add(&species, prediction.score, &path.to_string_lossy(), &fact)
    {
        Ok(id) => id,
        Err(e) => {
            if let Err(rm) = std::fs::remove_file(&path) {
                tracing::warn!(path = %path.display(), error = %rm, "failed to remove unrecorded capture");
            }
            return Err(e.into());
        }
    };

    tracing::info!(
        camera = %job.camera_id,
        id,
        species = %species,
        confidence = format!("{:.2}", prediction.score),
        tier = ?tier,
        "detection saved"
    );

    Ok(RegionOutcome::Persisted)
}

/// Clamp a box to the frame. `None` if nothing of positive area remains.
pub fn clamp_box(candidate: &CandidateBox, width: i32, height: i32) -> Option<Rect> {
    let x1 = candidate.x1.clamp(0, width);
    let y1 = candidate.y1.clamp(0, height);
    let x2 = candidate.x2.clamp(0, width);
    let y2 = candidate.y2.clamp(0, height);

    if x2 - x1 <= 0 || y2 - y1 <= 0 {
        return None;
    }
    Some(Rect::new(x1, y1, x2 - x1, y2 - y1))
}

pub(crate) fn encode_jpeg(mat: &Mat) -> opencv::Result<Vec<u8>> {
    let mut buf = Vector::<u8>::new();
    let params = Vector::<i32>::new();
    imgcodecs::imencode(".jpg", mat, &mut buf, &params)?;
    Ok(buf.to_vec())
}
