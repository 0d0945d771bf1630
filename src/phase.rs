//! The shared worker phase and the externally reported engine state.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

/// The mode all workers of a session are in.
///
/// Exactly one writer exists (the controller); workers only read. `Stop` is
/// terminal: no transition out of it is ever observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
#[repr(u32)]
pub enum Phase {
    Idle = 0,
    Generate = 1,
    Validate = 2,
    Stop = 3,
}

impl Phase {
    fn from_u32(value: u32) -> Phase {
        match value {
            1 => Phase::Generate,
            2 => Phase::Validate,
            3 => Phase::Stop,
            _ => Phase::Idle,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "IDLE",
            Phase::Generate => "GENERATE",
            Phase::Validate => "VALIDATE",
            Phase::Stop => "STOP",
        };
        write!(f, "{name}")
    }
}

/// A process-local phase cell polled by hot loops.
///
/// Loads are relaxed: the phase only gates loop dispatch and the transition
/// latency budget is far above any reordering window.
#[derive(Debug, Clone, Default)]
pub struct SharedPhase(Arc<AtomicU32>);

impl SharedPhase {
    pub fn new(phase: Phase) -> Self {
        Self(Arc::new(AtomicU32::new(phase as u32)))
    }

    pub fn load(&self) -> Phase {
        Phase::from_u32(self.0.load(Ordering::Relaxed))
    }

    pub fn store(&self, phase: Phase) {
        self.0.store(phase as u32, Ordering::Relaxed);
    }
}

/// Engine state as reported by `/pow/status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PowState {
    NoController,
    Loading,
    Idle,
    Generating,
    Validating,
    Stopped,
}

impl PowState {
    /// Maps a live controller's phase to the reported state. `Loading`
    /// overlays this whenever a worker has not finished model init.
    pub fn from_phase(phase: Phase) -> PowState {
        match phase {
            Phase::Idle => PowState::Idle,
            Phase::Generate => PowState::Generating,
            Phase::Validate => PowState::Validating,
            Phase::Stop => PowState::Stopped,
        }
    }
}
