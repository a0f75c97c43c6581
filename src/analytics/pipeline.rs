use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use opencv::core::{Mat, Size};
use opencv::prelude::*;
use tokio::runtime::Handle;
use tokio::sync::watch;

use crate::camera::{CaptureError, FrameSource, SourceOpener};

use super::motion::{MotionFilter, MotionState};
use super::object::{CandidateBox, DetectorAdapter};
use super::overlay::draw_overlay;
use super::trigger::{DispatchDecision, InFlightGuard, SuppressReason, TriggerCoordinator, TriggerStatus};
use super::worker::{encode_jpeg, spawn_classification, ClassificationJob, WorkerContext};

const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

pub type EncodedFrame = Option<Arc<Vec<u8>>>;

/// Control and status surface of one camera session, shared with the HTTP
/// layer.
pub struct SessionHandle {
    debug: AtomicBool,
    current_source: RwLock<String>,
    pending_source: Mutex<Option<String>>,
    trigger: Arc<TriggerCoordinator>,
    frames: watch::Sender<EncodedFrame>,
}

impl SessionHandle {
    pub fn new(source: &str, debug: bool, trigger: Arc<TriggerCoordinator>) -> Arc<Self> {
        let (frames, _) = watch::channel(None);
        Arc::new(Self {
            debug: AtomicBool::new(debug),
            current_source: RwLock::new(source.to_string()),
            pending_source: Mutex::new(None),
            trigger,
            frames,
        })
    }

    pub fn set_debug_override(&self, enabled: bool) {
        self.debug.store(enabled, Ordering::Relaxed);
        tracing::info!(enabled, "debug override changed");
    }

    pub fn debug_override(&self) -> bool {
        self.debug.load(Ordering::Relaxed)
    }

    /// Queue a source switch; the producer loop applies it before its next
    /// tick.
    pub fn set_frame_source(&self, source: &str) {
        *self
            .pending_source
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(source.to_string());
    }

    pub fn current_source(&self) -> String {
        self.current_source
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn status(&self) -> TriggerStatus {
        self.trigger.status(Instant::now())
    }

    pub fn subscribe(&self) -> watch::Receiver<EncodedFrame> {
        self.frames.subscribe()
    }

    pub(crate) fn take_pending_source(&self) -> Option<String> {
        self.pending_source
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    fn set_current_source(&self, source: String) {
        *self
            .current_source
            .write()
            .unwrap_or_else(|e| e.into_inner()) = source;
    }

    fn has_viewers(&self) -> bool {
        self.frames.receiver_count() > 0
    }

    fn publish(&self, jpeg: Vec<u8>) {
        self.frames.send_replace(Some(Arc::new(jpeg)));
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub confirmed: bool,
    pub detector_ran: bool,
    pub candidates: usize,
    pub admitted: bool,
    pub suppressed: Option<SuppressReason>,
}

/// The producer loop: capture, motion filter, detector, trigger, render.
/// Ticks run strictly one after another on a single thread.
pub struct CameraSession {
    handle: Arc<SessionHandle>,
    opener: SourceOpener,
    source: Option<Box<dyn FrameSource>>,
    motion: MotionFilter,
    motion_state: MotionState,
    detector: DetectorAdapter,
    worker_ctx: Arc<WorkerContext>,
    runtime: Handle,
}

impl CameraSession {
    pub fn new(
        handle: Arc<SessionHandle>,
        opener: SourceOpener,
        motion: MotionFilter,
        detector: DetectorAdapter,
        worker_ctx: Arc<WorkerContext>,
        runtime: Handle,
    ) -> Self {
        Self {
            handle,
            opener,
            source: None,
            motion,
            motion_state: MotionState::new(),
            detector,
            worker_ctx,
            runtime,
        }
    }

    #[cfg(test)]
    fn handle(&self) -> &Arc<SessionHandle> {
        &self.handle
    }

    #[cfg(test)]
    fn motion_counter(&self) -> u32 {
        self.motion_state.counter()
    }

    /// Open the current source with fresh motion state.
    pub fn connect(&mut self) -> bool {
        let source_id = self.handle.current_source();
        match (self.opener)(&source_id) {
            Ok(source) => {
                self.source = Some(source);
                self.motion_state.reset();
                true
            }
            Err(e) => {
                tracing::warn!(camera = %source_id, error = %e, "failed to open frame source");
                false
            }
        }
    }

    fn apply_source_switch(&mut self) {
        let Some(requested) = self.handle.take_pending_source() else {
            return;
        };

        match (self.opener)(&requested) {
            Ok(source) => {
                tracing::info!(
                    from = %self.handle.current_source(),
                    to = %requested,
                    "switched frame source"
                );
                self.source = Some(source);
                // A reference image from another camera is meaningless.
                self.motion_state.reset();
                self.handle.set_current_source(requested);
            }
            Err(e) => {
                tracing::warn!(camera = %requested, error = %e, "source switch failed, keeping current source");
            }
        }
    }

    /// Process one frame. `Ok(None)` means the stream has ended.
    pub fn tick(&mut self) -> Result<Option<TickReport>, CaptureError> {
        self.apply_source_switch();

        let Some(source) = self.source.as_mut() else {
            return Ok(None);
        };
        let Some(mut frame) = source.next_frame()? else {
            return Ok(None);
        };

        let original = Size::new(frame.cols(), frame.rows());
        let observation = match self.motion.observe(&mut self.motion_state, &frame) {
            Ok(o) => o,
            Err(e) => {
                tracing::warn!(error = %e, "motion analysis failed, skipping frame");
                return Ok(Some(TickReport::default()));
            }
        };

        if observation.confirmed && observation.counter == self.motion.confirm_frames() {
            tracing::debug!(camera = %self.handle.current_source(), "motion confirmed");
        }

        let debug = self.handle.debug_override();
        let detector_ran = observation.confirmed || debug;
        let candidates = if detector_ran {
            self.detector.detect(&observation.working, original)
        } else {
            Vec::new()
        };

        let decision =
            self.handle
                .trigger
                .try_dispatch(&candidates, observation.counter, Instant::now());
        let (admitted, suppressed) = match decision {
            DispatchDecision::Admitted(guard) => {
                self.dispatch(&frame, &candidates, guard);
                (true, None)
            }
            DispatchDecision::Suppressed(reason) => {
                if !candidates.is_empty() {
                    tracing::debug!(reason = ?reason, "dispatch suppressed");
                }
                (false, Some(reason))
            }
        };

        // The worker already holds its own copy, so drawing is safe.
        if debug {
            if let Err(e) = draw_overlay(&mut frame, &candidates, admitted) {
                tracing::warn!(error = %e, "failed to draw debug overlay");
            }
        }

        if self.handle.has_viewers() {
            match encode_jpeg(&frame) {
                Ok(jpeg) => self.handle.publish(jpeg),
                Err(e) => tracing::warn!(error = %e, "failed to encode frame"),
            }
        }

        Ok(Some(TickReport {
            confirmed: observation.confirmed,
            detector_ran,
            candidates: candidates.len(),
            admitted,
            suppressed,
        }))
    }

    fn dispatch(&self, frame: &Mat, candidates: &[CandidateBox], guard: InFlightGuard) {
        let camera_id = self.handle.current_source();
        let snapshot = match frame.try_clone() {
            Ok(s) => s,
            Err(e) => {
                // Dropping the guard releases the in-flight flag.
                tracing::error!(camera = %camera_id, error = %e, "failed to snapshot frame");
                return;
            }
        };

        tracing::info!(
            camera = %camera_id,
            candidates = candidates.len(),
            best = candidates.iter().map(|c| c.confidence).fold(0.0f32, f32::max),
            "dispatching classification"
        );

        let job = ClassificationJob {
            camera_id,
            snapshot,
            candidates: candidates.to_vec(),
            dispatched_at: Utc::now(),
        };
        spawn_classification(&self.runtime, Arc::clone(&self.worker_ctx), job, guard);
    }

    fn end_stream(&mut self) {
        self.source = None;
        self.motion_state.reset();
    }

    pub fn run(mut self, shutdown: Arc<AtomicBool>) {
        tracing::info!(camera = %self.handle.current_source(), "camera session started");

        while !shutdown.load(Ordering::Relaxed) {
            if self.source.is_none() && !self.connect() {
                wait_or_shutdown(&shutdown, RECONNECT_DELAY);
                continue;
            }

            match self.tick() {
                Ok(Some(_)) => {}
                Ok(None) => {
                    if self.source.is_some() {
                        tracing::warn!(camera = %self.handle.current_source(), "end of stream");
                    }
                    self.end_stream();
                    wait_or_shutdown(&shutdown, RECONNECT_DELAY);
                }
                Err(e) => {
                    tracing::error!(
                        camera = %self.handle.current_source(),
                        error = %e,
                        "frame capture failed"
                    );
                    self.end_stream();
                    wait_or_shutdown(&shutdown, RECONNECT_DELAY);
                }
            }
        }

        tracing::info!(camera = %self.handle.current_source(), "camera session stopped");
    }
}

fn wait_or_shutdown(shutdown: &AtomicBool, delay: Duration) {
    let deadline = Instant::now() + delay;
    while !shutdown.load(Ordering::Relaxed) && Instant::now() < deadline {
        thread::sleep(SHUTDOWN_POLL);
    }
}

pub fn spawn_session(session: CameraSession, shutdown: Arc<AtomicBool>) -> tokio::task::JoinHandle<()> {
    tokio::task::spawn_blocking(move || session.run(shutdown))
}
