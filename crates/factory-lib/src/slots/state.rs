//! Slot state derivation
//!
//! The state of a slot is never stored. It is recomputed from the slot
//! record, the markers in its machine directory and what the backend says.

use crate::backend::Liveness;
use crate::models::MachineState;

/// What is known about a slot at one instant
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Observation {
    /// Creation time from a readable slot record
    pub created: Option<i64>,
    pub dir_exists: bool,
    pub started: Option<i64>,
    pub finished: Option<i64>,
    /// Only consulted once the instance has started and not finished
    pub liveness: Option<Liveness>,
}

pub fn derive_state(obs: &Observation) -> MachineState {
    if obs.created.is_none() || !obs.dir_exists {
        return MachineState::Unknown;
    }
    if obs.finished.is_some() {
        return MachineState::Shutdown;
    }
    if obs.started.is_none() {
        return MachineState::Starting;
    }
    match &obs.liveness {
        Some(Liveness::Running) => MachineState::Running,
        Some(Liveness::Paused(_)) => MachineState::Paused,
        Some(Liveness::Gone) | None => MachineState::Shutdown,
    }
}

/// Whether the backend needs asking for this observation
pub fn needs_liveness(obs: &Observation) -> bool {
    obs.created.is_some() && obs.dir_exists && obs.started.is_some() && obs.finished.is_none()
}
