//! Local slot filling
//!
//! Picks which machinetype goes into the next idle slot: the type furthest
//! below its target share, among those not backing off after a bad finish
//! and fitting in the free processors.

use crate::config::ConfigSnapshot;
use crate::models::LogicalMachine;
use crate::protocol::{last_shutdown, LastShutdown};
use crate::slots::SlotManager;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One decided placement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub ordinal: usize,
    pub machinetype: String,
    pub processors: u32,
    pub shutdown_deadline: i64,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct AllocationReport {
    pub placed: Vec<String>,
    pub failures: usize,
}

/// Processors not held by a busy slot
pub fn free_processors(snapshot: &ConfigSnapshot, machines: &[LogicalMachine]) -> u32 {
    let used: u32 = machines
        .iter()
        .filter(|m| !m.state.is_idle())
        .map(|m| m.processors)
        .sum();
    snapshot.total_processors.saturating_sub(used)
}

/// Whether a machinetype is still holding off after its last finish
pub fn in_backoff(last: Option<&LastShutdown>, backoff_seconds: i64, now: i64) -> bool {
    match last {
        Some(last) if last.is_abnormal() => last.time.is_some_and(|t| now - t < backoff_seconds),
        _ => false,
    }
}

/// Decide the next placement, if any
pub fn choose(
    snapshot: &ConfigSnapshot,
    machines: &[LogicalMachine],
    lasts: &BTreeMap<String, LastShutdown>,
    now: i64,
) -> Option<Placement> {
    let ordinal = machines.iter().find(|m| m.state.is_idle())?.ordinal;
    let free = free_processors(snapshot, machines);

    let mut best: Option<(f64, &str, u32)> = None;
    for itype in snapshot.machinetypes.values() {
        if itype.target_share <= 0.0 || itype.min_processors > free {
            continue;
        }
        if in_backoff(lasts.get(&itype.name), itype.backoff_seconds, now) {
            debug!(machinetype = %itype.name, "Machinetype in backoff");
            continue;
        }

        let held: u32 = machines
            .iter()
            .filter(|m| !m.state.is_idle() && m.machinetype.as_deref() == Some(itype.name.as_str()))
            .map(|m| m.processors)
            .sum();
        let ratio = f64::from(held) / itype.target_share;
        if best.map_or(true, |(r, _, _)| ratio < r) {
            best = Some((ratio, itype.name.as_str(), itype.max_processors.min(free)));
        }
    }

    let (_, name, processors) = best?;
    let max_wallclock = snapshot.machinetypes.get(name)?.max_wallclock_seconds;
    Some(Placement {
        ordinal,
        machinetype: name.to_string(),
        processors,
        shutdown_deadline: now + max_wallclock,
    })
}

pub struct Allocator {
    manager: Arc<SlotManager>,
}

impl Allocator {
    pub fn new(manager: Arc<SlotManager>) -> Self {
        Self { manager }
    }

    /// Fill idle slots until nothing more fits
    ///
    /// Stops at the first failed creation; the failure's finish record puts
    /// the machinetype into backoff for the next cycle.
    pub async fn fill(&self) -> AllocationReport {
        let snapshot = self.manager.config().current().await;
        let store = self.manager.store();
        let mut report = AllocationReport::default();

        for _ in 0..snapshot.num_slots {
            let machines = self.manager.machines().await;
            let lasts: BTreeMap<String, LastShutdown> = snapshot
                .machinetypes
                .values()
                .filter_map(|t| last_shutdown(store, t).map(|l| (t.name.clone(), l)))
                .collect();
            let now = self.manager.clock().now();

            let Some(placement) = choose(&snapshot, &machines, &lasts, now) else {
                break;
            };
            info!(
                slot = placement.ordinal,
                machinetype = %placement.machinetype,
                processors = placement.processors,
                "Placing instance"
            );
            match self
                .manager
                .create(
                    placement.ordinal,
                    &placement.machinetype,
                    placement.processors,
                    placement.shutdown_deadline,
                )
                .await
            {
                Ok(machine) => report.placed.push(machine.hostname),
                Err(e) => {
                    warn!(
                        slot = placement.ordinal,
                        machinetype = %placement.machinetype,
                        error = %e,
                        "Placement failed"
                    );
                    report.failures += 1;
                    break;
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::testing::snapshot;
    use crate::config::InstanceType;
    use crate::models::{MachineState, ShutdownMessage};
    use crate::slots::testing::{slot_fixture, slot_fixture_with, T0};

    fn busy(ordinal: usize, machinetype: &str, processors: u32) -> LogicalMachine {
        let mut machine = LogicalMachine::unknown(ordinal, format!("host-{:02}.example.com", ordinal));
        machine.state = MachineState::Running;
        machine.machinetype = Some(machinetype.into());
        machine.processors = processors;
        machine
    }

    fn idle(ordinal: usize) -> LogicalMachine {
        LogicalMachine::unknown(ordinal, format!("host-{:02}.example.com", ordinal))
    }

    fn two_types() -> ConfigSnapshot {
        let dir = std::path::Path::new("/tmp");
        let mut snapshot = snapshot(dir, "docker");
        let batch = snapshot.machinetypes["batch"].clone();
        let mut analysis = InstanceType {
            name: "analysis".into(),
            target_share: 3.0,
            max_processors: 2,
            ..batch
        };
        analysis.backoff_seconds = 300;
        snapshot.machinetypes.insert("analysis".into(), analysis);
        snapshot
    }

    #[test]
    fn test_lowest_share_ratio_wins() {
        let snapshot = two_types();
        // analysis holds 2 of share 3 (0.67), batch holds 1 of share 1 (1.0)
        let machines = vec![busy(0, "analysis", 2), busy(1, "batch", 1), idle(2), idle(3)];

        let placement = choose(&snapshot, &machines, &BTreeMap::new(), T0).unwrap();

        assert_eq!(placement.ordinal, 2);
        assert_eq!(placement.machinetype, "analysis");
        // Only one of the four processors is free
        assert_eq!(placement.processors, 1);
        assert_eq!(placement.shutdown_deadline, T0 + 86400);
    }

    #[test]
    fn test_nothing_when_full_or_no_idle_slot() {
        let snapshot = two_types();
        let full = vec![busy(0, "batch", 1), busy(1, "batch", 1), busy(2, "analysis", 2), idle(3)];
        assert_eq!(free_processors(&snapshot, &full), 0);
        assert_eq!(choose(&snapshot, &full, &BTreeMap::new(), T0), None);

        let no_idle: Vec<LogicalMachine> = (0..4).map(|i| busy(i, "batch", 0)).collect();
        assert_eq!(choose(&snapshot, &no_idle, &BTreeMap::new(), T0), None);
    }

    #[test]
    fn test_backoff_after_abnormal_finish_only() {
        let snapshot = two_types();
        let machines: Vec<LogicalMachine> = (0..4).map(idle).collect();
        let failed = LastShutdown {
            machine: "host-00.example.com".into(),
            message: Some(ShutdownMessage::new(700, "Failed to create instance (backend)")),
            time: Some(T0 - 100),
        };
        let lasts = BTreeMap::from([("analysis".to_string(), failed.clone())]);

        let placement = choose(&snapshot, &machines, &lasts, T0).unwrap();
        assert_eq!(placement.machinetype, "batch");

        // Backoff of 300s has passed
        let placement = choose(&snapshot, &machines, &lasts, T0 + 200).unwrap();
        assert_eq!(placement.machinetype, "analysis");

        let fine = LastShutdown {
            message: Some(ShutdownMessage::new(300, "Nothing to do")),
            ..failed
        };
        assert!(!in_backoff(Some(&fine), 300, T0 - 99));
        assert!(!in_backoff(None, 300, T0));
    }

    #[test]
    fn test_zero_share_and_oversized_types_are_skipped() {
        let mut snapshot = two_types();
        snapshot.machinetypes.get_mut("batch").unwrap().target_share = 0.0;
        snapshot.machinetypes.get_mut("analysis").unwrap().min_processors = 2;

        let machines = vec![busy(0, "batch", 1), busy(1, "batch", 1), busy(2, "batch", 1), idle(3)];
        assert_eq!(choose(&snapshot, &machines, &BTreeMap::new(), T0), None);
    }

    #[tokio::test]
    async fn test_fill_places_until_processors_run_out() {
        let f = slot_fixture("docker");
        let allocator = Allocator::new(f.manager.clone());

        let report = allocator.fill().await;

        assert_eq!(report.failures, 0);
        assert_eq!(report.placed.len(), 4);
        let machines = f.manager.machines().await;
        assert!(machines.iter().all(|m| m.state == MachineState::Running));
        assert!(allocator.fill().await.placed.is_empty());
    }

    #[tokio::test]
    async fn test_failed_creation_backs_off_machinetype() {
        let f = slot_fixture_with("docker", |s| {
            s.machinetypes.get_mut("batch").unwrap().backoff_seconds = 60;
        });
        *f.fakes.docker.fail_start.lock().unwrap() = Some("no space left".into());
        let allocator = Allocator::new(f.manager.clone());

        let report = allocator.fill().await;
        assert_eq!(report.failures, 1);
        assert!(report.placed.is_empty());

        *f.fakes.docker.fail_start.lock().unwrap() = None;
        f.clock.advance(30);
        assert!(allocator.fill().await.placed.is_empty());

        f.clock.advance(31);
        assert_eq!(allocator.fill().await.placed.len(), 4);
    }
}
