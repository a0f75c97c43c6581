use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;

use super::object::CandidateBox;

struct TriggerState {
    in_flight: bool,
    last_dispatch: Option<Instant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuppressReason {
    NoCandidates,
    MotionUnconfirmed,
    InFlight,
    CoolingDown,
}

#[derive(Debug)]
pub enum DispatchDecision {
    Admitted(InFlightGuard),
    Suppressed(SuppressReason),
}

impl DispatchDecision {
    #[cfg(test)]
    pub fn is_admitted(&self) -> bool {
        matches!(self, DispatchDecision::Admitted(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TriggerStatus {
    pub in_flight: bool,
    pub cooldown_remaining_secs: f64,
}

/// Single-flight gate with a cooldown measured from dispatch start.
///
/// The only way to clear the in-flight flag is to drop (or complete) the
/// [`InFlightGuard`] handed out with an admitted dispatch.
pub struct TriggerCoordinator {
    state: Mutex<TriggerState>,
    cooldown: Duration,
    confirm_frames: u32,
}

impl TriggerCoordinator {
    pub fn new(cooldown: Duration, confirm_frames: u32) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(TriggerState {
                in_flight: false,
                last_dispatch: None,
            }),
            cooldown,
            confirm_frames,
        })
    }

    // A panicking worker must not wedge the flag, so poisoning is ignored.
    fn lock(&self) -> MutexGuard<'_, TriggerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn try_dispatch(
        self: &Arc<Self>,
        candidates: &[CandidateBox],
        motion_counter: u32,
        now: Instant,
    ) -> DispatchDecision {
        if candidates.is_empty() {
            return DispatchDecision::Suppressed(SuppressReason::NoCandidates);
        }
        if motion_counter < self.confirm_frames {
            return DispatchDecision::Suppressed(SuppressReason::MotionUnconfirmed);
        }

        let mut state = self.lock();
        if state.in_flight {
            return DispatchDecision::Suppressed(SuppressReason::InFlight);
        }
        if let Some(last) = state.last_dispatch {
            if now.saturating_duration_since(last) <= self.cooldown {
                return DispatchDecision::Suppressed(SuppressReason::CoolingDown);
            }
        }

        state.in_flight = true;
        state.last_dispatch = Some(now);

        DispatchDecision::Admitted(InFlightGuard {
            coordinator: Some(Arc::clone(self)),
        })
    }

    pub fn status(&self, now: Instant) -> TriggerStatus {
        let state = self.lock();
        let cooldown_remaining_secs = state
            .last_dispatch
            .map(|last| {
                self.cooldown
                    .saturating_sub(now.saturating_duration_since(last))
                    .as_secs_f64()
            })
            .unwrap_or(0.0);

        TriggerStatus {
            in_flight: state.in_flight,
            cooldown_remaining_secs,
        }
    }

    fn release(&self) {
        self.lock().in_flight = false;
    }
}

/// Proof of an admitted dispatch. Clears the in-flight flag exactly once,
/// on [`InFlightGuard::complete`] or on drop (including unwinding).
#[derive(Debug)]
pub struct InFlightGuard {
    coordinator: Option<Arc<TriggerCoordinator>>,
}

impl InFlightGuard {
    pub fn complete(mut self) {
        self.clear();
    }

    fn clear(&mut self) {
        if let Some(coordinator) = self.coordinator.take() {
            coordinator.release();
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.clear();
    }
}

impl std::fmt::Debug for TriggerCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerCoordinator")
            .field("cooldown", &self.cooldown)
            .field("confirm_frames", &self.confirm_frames)
            .finish_non_exhaustive()
    }
}
