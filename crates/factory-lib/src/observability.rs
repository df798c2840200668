//! Observability infrastructure for the factory
//!
//! Provides:
//! - Prometheus metrics (slot states, creations, zombies, cycle latency, protocol traffic)
//! - Structured JSON logging of slot lifecycle events with tracing

use crate::error::FactoryError;
use crate::models::{BackendKind, BackendModel, LogicalMachine, MachineState, ShutdownMessage};
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge_vec,
    Histogram, IntCounter, IntCounterVec, IntGaugeVec,
};
use std::sync::OnceLock;
use tracing::{debug, info, warn};

/// Histogram buckets for a full control cycle (in seconds)
const CYCLE_BUCKETS: &[f64] = &[0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0];

const ALL_STATES: [MachineState; 6] = [
    MachineState::Unknown,
    MachineState::Starting,
    MachineState::Running,
    MachineState::Paused,
    MachineState::Shutdown,
    MachineState::Zombie,
];

fn state_counts(machines: &[LogicalMachine], zombies: usize) -> [(MachineState, usize); 6] {
    ALL_STATES.map(|state| {
        let mut count = machines.iter().filter(|m| m.state == state).count();
        if state == MachineState::Zombie {
            count += zombies;
        }
        (state, count)
    })
}

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<FactoryMetricsInner> = OnceLock::new();

struct FactoryMetricsInner {
    slots_by_state: IntGaugeVec,
    slots_created: IntCounter,
    slot_create_failures: IntCounterVec,
    slots_destroyed: IntCounter,
    zombies_killed: IntCounterVec,
    heartbeats_recorded: IntCounter,
    cycle_latency_seconds: Histogram,
    protocol_queries_answered: IntCounterVec,
    protocol_datagrams_discarded: IntCounter,
}

impl FactoryMetricsInner {
    fn new() -> Self {
        Self {
            slots_by_state: register_int_gauge_vec!(
                "factoryd_slots",
                "Number of slots in each lifecycle state",
                &["state"]
            )
            .expect("Failed to register slots"),

            slots_created: register_int_counter!(
                "factoryd_slots_created_total",
                "Instances successfully created"
            )
            .expect("Failed to register slots_created"),

            slot_create_failures: register_int_counter_vec!(
                "factoryd_slot_create_failures_total",
                "Instance creations that failed, by error category",
                &["category"]
            )
            .expect("Failed to register slot_create_failures"),

            slots_destroyed: register_int_counter!(
                "factoryd_slots_destroyed_total",
                "Instances destroyed and finalised"
            )
            .expect("Failed to register slots_destroyed"),

            zombies_killed: register_int_counter_vec!(
                "factoryd_zombies_killed_total",
                "Orphaned backend instances terminated by the reaper",
                &["kind"]
            )
            .expect("Failed to register zombies_killed"),

            heartbeats_recorded: register_int_counter!(
                "factoryd_heartbeats_recorded_total",
                "Heartbeat records written for running instances"
            )
            .expect("Failed to register heartbeats_recorded"),

            cycle_latency_seconds: register_histogram!(
                "factoryd_cycle_latency_seconds",
                "Time spent in one control cycle",
                CYCLE_BUCKETS.to_vec()
            )
            .expect("Failed to register cycle_latency_seconds"),

            protocol_queries_answered: register_int_counter_vec!(
                "factoryd_protocol_queries_answered_total",
                "Status queries answered by the responder",
                &["message_type"]
            )
            .expect("Failed to register protocol_queries_answered"),

            protocol_datagrams_discarded: register_int_counter!(
                "factoryd_protocol_datagrams_discarded_total",
                "Datagrams dropped as malformed, foreign or unauthenticated"
            )
            .expect("Failed to register protocol_datagrams_discarded"),
        }
    }
}

/// Factory metrics for Prometheus exposition
///
/// A lightweight handle to the global metrics instance. Clones share the
/// same underlying metrics.
#[derive(Clone)]
pub struct FactoryMetrics {
    _private: (),
}

impl Default for FactoryMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl FactoryMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(FactoryMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &FactoryMetricsInner {
        GLOBAL_METRICS.get_or_init(FactoryMetricsInner::new)
    }

    /// Replace the per-state slot gauges with counts from a scan
    ///
    /// `zombies` is the number of orphaned instances the last reaper sweep
    /// found; they hold a slot's hostname but no slot tracks them.
    pub fn set_slot_states(&self, machines: &[LogicalMachine], zombies: usize) {
        for (state, count) in state_counts(machines, zombies) {
            self.inner()
                .slots_by_state
                .with_label_values(&[state.as_str()])
                .set(count as i64);
        }
    }

    pub fn inc_slots_created(&self) {
        self.inner().slots_created.inc();
    }

    pub fn inc_slot_create_failures(&self, category: &str) {
        self.inner()
            .slot_create_failures
            .with_label_values(&[category])
            .inc();
    }

    pub fn inc_slots_destroyed(&self) {
        self.inner().slots_destroyed.inc();
    }

    pub fn inc_zombies_killed(&self, kind: BackendKind) {
        self.inner()
            .zombies_killed
            .with_label_values(&[&kind.to_string()])
            .inc();
    }

    pub fn inc_heartbeats_recorded(&self) {
        self.inner().heartbeats_recorded.inc();
    }

    pub fn observe_cycle_latency(&self, duration_secs: f64) {
        self.inner().cycle_latency_seconds.observe(duration_secs);
    }

    pub fn inc_protocol_queries_answered(&self, message_type: &str) {
        self.inner()
            .protocol_queries_answered
            .with_label_values(&[message_type])
            .inc();
    }

    pub fn inc_protocol_datagrams_discarded(&self) {
        self.inner().protocol_datagrams_discarded.inc();
    }
}

/// Structured logger for factory events
///
/// Every event carries the factory name and an `event` field so JSON log
/// consumers can filter on it.
#[derive(Clone)]
pub struct StructuredLogger {
    factory_name: String,
}

impl StructuredLogger {
    pub fn new(factory_name: impl Into<String>) -> Self {
        Self {
            factory_name: factory_name.into(),
        }
    }

    pub fn log_startup(&self, version: &str, num_slots: usize, total_processors: u32) {
        info!(
            event = "factory_started",
            factory = %self.factory_name,
            factory_version = %version,
            num_slots = num_slots,
            total_processors = total_processors,
            "Factory started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "factory_shutdown",
            factory = %self.factory_name,
            reason = %reason,
            "Factory shutting down"
        );
    }

    pub fn log_slot_created(
        &self,
        hostname: &str,
        machinetype: &str,
        model: BackendModel,
        processors: u32,
        instance_id: &str,
    ) {
        info!(
            event = "slot_created",
            factory = %self.factory_name,
            slot = %hostname,
            machinetype = %machinetype,
            model = %model,
            processors = processors,
            instance_id = %instance_id,
            "Created instance"
        );
    }

    pub fn log_slot_create_failed(&self, hostname: &str, machinetype: &str, error: &FactoryError) {
        warn!(
            event = "slot_create_failed",
            factory = %self.factory_name,
            slot = %hostname,
            machinetype = %machinetype,
            category = error.category(),
            error = %error,
            "Failed to create instance"
        );
    }

    pub fn log_slot_destroyed(
        &self,
        hostname: &str,
        machinetype: &str,
        message: Option<&ShutdownMessage>,
    ) {
        info!(
            event = "slot_destroyed",
            factory = %self.factory_name,
            slot = %hostname,
            machinetype = %machinetype,
            shutdown_message = ?message.map(ToString::to_string),
            "Destroyed instance"
        );
    }

    pub fn log_slot_paused(&self, hostname: &str, detail: &str) {
        warn!(
            event = "slot_paused",
            factory = %self.factory_name,
            slot = %hostname,
            detail = %detail,
            "Instance is neither running nor gone"
        );
    }

    pub fn log_zombie_killed(&self, name: &str, kind: BackendKind, instance_id: &str, reason: &str) {
        warn!(
            event = "zombie_killed",
            factory = %self.factory_name,
            instance = %name,
            kind = %kind,
            instance_id = %instance_id,
            reason = %reason,
            "Killed zombie instance"
        );
    }

    pub fn log_heartbeat(&self, hostname: &str, cpu_seconds: u64, cpu_percentage: f64) {
        debug!(
            event = "heartbeat_recorded",
            factory = %self.factory_name,
            slot = %hostname,
            cpu_seconds = cpu_seconds,
            cpu_percentage = cpu_percentage,
            "Recorded heartbeat"
        );
    }
}
