//! Factory control cycle
//!
//! Every tick runs, in order: network reservations, the monitor pass, the
//! reaper sweep, slot filling, retention cleanup and the factory heartbeat.
//! Reaping and creation share this one task, so a sweep never overlaps the
//! creation of any slot.

use crate::allocator::{AllocationReport, Allocator};
use crate::health::{components, HealthRegistry};
use crate::observability::FactoryMetrics;
use crate::reaper::{ReapReport, Reaper};
use crate::slots::{CleanupReport, MonitorReport, SlotManager};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct CycleConfig {
    /// Time between the starts of two cycles (default: 60 seconds)
    pub interval: Duration,
    /// Run slot filling; off for a factory that only drains
    pub allocate: bool,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            allocate: true,
        }
    }
}

/// What one cycle did
#[derive(Debug, Default, Clone)]
pub struct CycleReport {
    pub monitor: MonitorReport,
    pub reap: ReapReport,
    pub allocation: AllocationReport,
    pub cleanup: CleanupReport,
    pub elapsed: Duration,
}

pub struct ControlCycle {
    manager: Arc<SlotManager>,
    reaper: Reaper,
    allocator: Allocator,
    health: HealthRegistry,
    metrics: FactoryMetrics,
    config: CycleConfig,
}

impl ControlCycle {
    pub fn new(manager: Arc<SlotManager>, health: HealthRegistry, config: CycleConfig) -> Self {
        Self {
            reaper: Reaper::new(manager.clone()),
            allocator: Allocator::new(manager.clone()),
            manager,
            health,
            metrics: FactoryMetrics::new(),
            config,
        }
    }

    /// Run cycles until shutdown is signalled
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            allocate = self.config.allocate,
            "Starting control cycle"
        );

        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut first = true;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.run_once().await;
                    debug!(
                        heartbeats = report.monitor.heartbeats,
                        zombies = report.reap.zombies.len(),
                        placed = report.allocation.placed.len(),
                        removed = report.cleanup.removed.len(),
                        elapsed_ms = report.elapsed.as_millis(),
                        "Cycle complete"
                    );
                    if first {
                        self.health.set_ready(true).await;
                        first = false;
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutting down control cycle");
                    break;
                }
            }
        }
    }

    /// One full pass
    pub async fn run_once(&self) -> CycleReport {
        let start = Instant::now();
        let snapshot = self.manager.config().current().await;
        let mut report = CycleReport::default();

        let network = self.manager.provisioner().ensure_network(&snapshot);
        if let Err(e) = &network {
            warn!(error = %e, "Failed to update network reservations");
        }
        self.health
            .report(components::PROVISIONER, &network, 0)
            .await;

        report.monitor = self.manager.monitor().await;

        report.reap = self.reaper.sweep().await;
        self.health
            .report::<(), String>(components::REAPER, &Ok(()), report.reap.failures)
            .await;

        if self.config.allocate {
            report.allocation = self.allocator.fill().await;
        }

        let cleanup = self.manager.cleanup().await;
        match &cleanup {
            Ok(c) => report.cleanup = c.clone(),
            Err(e) => warn!(error = %e, "Retention cleanup failed"),
        }

        let now = self.manager.clock().now();
        let heartbeat = self.manager.store().touch_factory_heartbeat(now);
        if let Err(e) = &heartbeat {
            warn!(error = %e, "Failed to write factory heartbeat");
        }

        let failures = report.monitor.failures + report.allocation.failures;
        let outcome = cleanup.map(|_| ()).and(heartbeat);
        self.health
            .report(components::SLOT_MANAGER, &outcome, failures)
            .await;

        self.metrics
            .set_slot_states(&self.manager.machines().await, report.reap.zombies.len());
        report.elapsed = start.elapsed();
        self.metrics
            .observe_cycle_latency(report.elapsed.as_secs_f64());
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Liveness;
    use crate::health::ComponentStatus;
    use crate::models::MachineState;
    use crate::slots::testing::{slot_fixture, T0};

    #[tokio::test]
    async fn test_first_cycle_fills_every_slot() {
        let f = slot_fixture("docker");
        let health = HealthRegistry::new();
        let cycle = ControlCycle::new(f.manager.clone(), health.clone(), CycleConfig::default());

        let report = cycle.run_once().await;

        assert_eq!(report.allocation.placed.len(), 4);
        assert!(report.reap.zombies.is_empty());
        assert!(f.manager.store().factory_heartbeat_time().is_some());
        assert!(f.dir.path().join("dhcp-hosts").exists());

        let status = health.health_at(T0).await;
        assert_eq!(
            status.components[components::SLOT_MANAGER].status,
            ComponentStatus::Healthy
        );
        assert_eq!(
            status.components[components::REAPER].status,
            ComponentStatus::Healthy
        );
    }

    #[tokio::test]
    async fn test_cycle_finalizes_vanished_and_reaps_strays() {
        let f = slot_fixture("docker");
        let cycle = ControlCycle::new(
            f.manager.clone(),
            HealthRegistry::new(),
            CycleConfig {
                allocate: false,
                ..CycleConfig::default()
            },
        );
        f.manager.create(0, "batch", 1, T0 + 3600).await.unwrap();
        f.fakes
            .docker
            .insert("host-03.example.com", "stray", Liveness::Running);
        // Instance 0 vanished behind the factory's back
        f.fakes
            .docker
            .set_liveness("host-00.example.com", Liveness::Gone);
        f.clock.advance(10);

        let report = cycle.run_once().await;

        assert_eq!(report.monitor.finalized, vec!["host-00.example.com".to_string()]);
        assert_eq!(report.reap.zombies.len(), 1);
        assert!(report.allocation.placed.is_empty());
        assert_eq!(f.manager.machine(0).await.state, MachineState::Shutdown);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let f = slot_fixture("docker");
        let health = HealthRegistry::new();
        let cycle = ControlCycle::new(
            f.manager.clone(),
            health.clone(),
            CycleConfig {
                interval: Duration::from_millis(20),
                allocate: true,
            },
        );
        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(cycle.run(rx));

        tokio::time::sleep(Duration::from_millis(300)).await;
        tx.send(()).unwrap();
        handle.await.unwrap();

        assert!(health.readiness().await.ready);
    }
}
