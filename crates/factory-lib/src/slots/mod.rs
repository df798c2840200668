//! Slot manager
//!
//! A slot is one logical machine with a fixed hostname. Its lifecycle lives
//! entirely on disk: the slot record names the current instance, the
//! instance's machine directory holds its markers, and the state is derived
//! from those plus a liveness query to the backend.

mod features;
mod manager;
mod state;

#[cfg(test)]
pub(crate) mod testing;

pub use features::{job_features, machine_features, write_features, FeatureInputs};
pub use manager::{
    codes, cpu_percentage, CleanupReport, MonitorReport, SlotManager, STARTING_TIMEOUT_SECS,
};
pub use state::{derive_state, needs_liveness, Observation};
